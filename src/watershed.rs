use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::node::{DemProduct, Node, MISSING_ELEVATION};
use crate::raster::{Raster, RasterHeader};
use crate::river::RiverSystem;
use crate::runoff::RunoffSystem;

/// 4-connected neighbourhood used by the primary linkage pass.
const NEIGHBOURS_CROSS: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// 8-connected neighbourhood with the diagonal distance factor, used by
/// the diagnostic slope pass only.
const NEIGHBOURS_D8: [(isize, isize, f64); 8] = [
    (-1, 0, 1.0),
    (1, 0, 1.0),
    (0, -1, 1.0),
    (0, 1, 1.0),
    (-1, -1, std::f64::consts::SQRT_2),
    (1, 1, std::f64::consts::SQRT_2),
    (1, -1, std::f64::consts::SQRT_2),
    (-1, 1, std::f64::consts::SQRT_2),
];

/// The co-registered characteristic maps a conditioning run consumes.
pub struct WatershedRasters {
    /// Sub-basin ids; 0 / nodata = inactive cell
    pub subs: Raster<i32>,
    /// DEM before hydrological conditioning
    pub dem_before: Raster<f64>,
    /// DEM after hydrological conditioning (primary product)
    pub dem_after: Raster<f64>,
    /// Preprocessed slope
    pub slopes: Raster<f64>,
    /// Reach ids on river cells; nodata elsewhere
    pub reaches: Raster<i32>,
    /// Drained area [km2]
    pub uparea: Raster<f64>,
    /// Flow propagation time
    pub times: Raster<f64>,
    /// Optional sub-pixel DEMs
    pub dem_10m: Option<Raster<f64>>,
    pub dem_20m: Option<Raster<f64>>,
}

impl WatershedRasters {
    /// Load the characteristic maps from a model directory.
    ///
    /// Sub-pixel DEMs are looked up in `dir_subpixels` (defaulting to the
    /// model directory) and are optional.
    pub fn load(dir: &Path, dir_subpixels: Option<&Path>) -> Result<Self> {
        let maps = dir.join("Characteristic_maps");
        let subpix = dir_subpixels.unwrap_or(dir);

        let rasters = WatershedRasters {
            subs: Raster::read(maps.join("Drainage_basin.sub"))?,
            dem_before: Raster::read(maps.join("Drainage_basin.b"))?,
            dem_after: Raster::read(maps.join("Drainage_basincorr.b"))?,
            slopes: Raster::read(maps.join("Drainage_basin.slope"))?,
            reaches: Raster::read(maps.join("Drainage_basin.reachs"))?,
            uparea: Raster::read(maps.join("Drainage_basin.cnv"))?,
            times: Raster::read(maps.join("Drainage_basin.time"))?,
            dem_10m: Self::load_optional(&subpix.join("mnt10m.bin")),
            dem_20m: Self::load_optional(&subpix.join("mnt20m.bin")),
        };
        rasters.check_coregistration()?;
        Ok(rasters)
    }

    fn load_optional(path: &Path) -> Option<Raster<f64>> {
        match Raster::read(path) {
            Ok(r) => Some(r),
            Err(Error::MissingRaster(_)) => {
                info!("No sub-pixel DEM at {}", path.display());
                None
            }
            Err(e) => {
                warn!("Ignoring unreadable sub-pixel DEM {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn check_coregistration(&self) -> Result<()> {
        let h = &self.subs.header;
        let others: [(&'static str, &RasterHeader); 6] = [
            ("dem_before", &self.dem_before.header),
            ("dem_after", &self.dem_after.header),
            ("slopes", &self.slopes.header),
            ("reaches", &self.reaches.header),
            ("uparea", &self.uparea.header),
            ("times", &self.times.header),
        ];
        for (name, other) in others {
            if other.nx != h.nx || other.ny != h.ny {
                return Err(Error::SizeMismatch {
                    name,
                    enx: h.nx,
                    eny: h.ny,
                    anx: other.nx,
                    any: other.ny,
                });
            }
        }
        Ok(())
    }

    pub fn resolution(&self) -> f64 {
        self.subs.header.dx
    }
}

/// Read operator-supplied forced-exchange pairs.
///
/// The file starts with a literal `COORDINATES` line, then one
/// tab-separated `x_up y_up x_down y_down` quadruple per line. A missing
/// file simply means no overrides; a present but malformed file is fatal.
pub fn read_coupled_pairs<P: AsRef<Path>>(path: P) -> Result<Vec<[f64; 4]>> {
    let path = path.as_ref();
    if !path.exists() {
        info!("No forced-exchange file at {}", path.display());
        return Ok(Vec::new());
    }

    let corrupt = |reason: String| Error::CoupledPairs {
        path: path.to_path_buf(),
        reason,
    };

    let contents = fs::read_to_string(path)?;
    let mut lines = contents.lines();
    match lines.next() {
        Some("COORDINATES") => {}
        other => {
            return Err(corrupt(format!(
                "expected COORDINATES header, found {:?}",
                other.unwrap_or("")
            )))
        }
    }

    let mut pairs = Vec::new();
    for (nline, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 4 {
            return Err(corrupt(format!(
                "line {}: expected 4 tab-separated values, found {}",
                nline + 2,
                fields.len()
            )));
        }
        let mut xy = [0.0f64; 4];
        for (k, f) in fields.iter().enumerate() {
            xy[k] = f
                .trim()
                .parse::<f64>()
                .map_err(|e| corrupt(format!("line {}: {}", nline + 2, e)))?;
        }
        pairs.push(xy);
    }

    info!("{} forced-exchange pairs", pairs.len());
    Ok(pairs)
}

/// Read-only partition view of a [`Watershed`] for one sub-basin id.
#[derive(Debug, Clone)]
pub struct SubWatershed {
    pub index: usize,
    pub name: String,
    pub sub: i32,
    /// Boolean mask over the grid, `j * nx + i` indexed
    pub mask: Vec<bool>,
    pub dx: f64,
    pub dy: f64,
    pub nodes: Vec<usize>,
    pub rivers: Vec<usize>,
    pub runoff: Vec<usize>,
    /// Distinct reach ids touching the sub-basin
    pub idx_reaches: Vec<i32>,
}

impl SubWatershed {
    pub fn surface(&self) -> f64 {
        self.mask.iter().filter(|&&m| m).count() as f64 * self.dx * self.dy
    }
}

/// The full drainage graph of one model: node arena, linkage, curvilinear
/// distances, river/runoff partition and sub-basin views.
pub struct Watershed {
    pub header: RasterHeader,
    pub nodes: Vec<Node>,
    /// Arena index per grid cell, `j * nx + i` indexed
    pub nodesindex: Vec<Option<usize>>,
    pub outlet: usize,
    /// River nodes, ascending conditioned elevation
    pub rivers: Vec<usize>,
    /// Hillslope nodes, ascending conditioned elevation
    pub runoff: Vec<usize>,
    pub coupled_ij: Vec<((usize, usize), (usize, usize))>,
    pub subcatchments: Vec<SubWatershed>,
    /// Elevation products active for this run
    pub products: Vec<DemProduct>,
    pub riversystem: RiverSystem,
    pub runoffsystem: RunoffSystem,
}

impl Watershed {
    /// Build the drainage graph from the raster set.
    ///
    /// Fatal when the forced-exchange endpoints fall outside the active
    /// mask or when the primary linkage pass does not find exactly one
    /// outlet.
    pub fn build(
        rasters: &WatershedRasters,
        coupled_xy: &[[f64; 4]],
        tslopemin: Option<f64>,
        tslopemax: Option<f64>,
    ) -> Result<Watershed> {
        let header = rasters.subs.header;
        let resolution = rasters.resolution();

        let mut products = vec![DemProduct::BeforeCorr, DemProduct::AfterCorr];
        if rasters.dem_10m.is_some() {
            products.push(DemProduct::SubPixel10);
        }
        if rasters.dem_20m.is_some() {
            products.push(DemProduct::SubPixel20);
        }

        info!("Initialization of nodes...");
        let (mut nodes, nodesindex) = init_nodes(rasters);
        info!("{} active cells", nodes.len());

        let coupled_ij = resolve_coupled(&header, &nodesindex, coupled_xy)?;

        info!("Linking...");
        link_forced(&mut nodes, &coupled_ij, &nodesindex, &header, resolution);
        let outlet = link_steepest(&mut nodes, &nodesindex, &rasters.dem_after, resolution)?;
        info!(
            "Outlet at cell ({}, {})",
            nodes[outlet].i, nodes[outlet].j
        );

        info!("Finding slope...");
        compute_sloped8(&mut nodes, &nodesindex, &rasters.dem_before, resolution);

        info!("Curvilinear distances...");
        incr_curvi(&mut nodes, outlet);

        if let Some(dem) = &rasters.dem_10m {
            sample_subpixels(&mut nodes, &header, dem, DemProduct::SubPixel10);
        }
        if let Some(dem) = &rasters.dem_20m {
            sample_subpixels(&mut nodes, &header, dem, DemProduct::SubPixel20);
        }

        let after = DemProduct::AfterCorr.index();
        let mut rivers: Vec<usize> = nodes.iter().filter(|n| n.river).map(|n| n.index).collect();
        sort_by_elevation(&mut rivers, &nodes, after);
        let mut runoff: Vec<usize> = nodes.iter().filter(|n| !n.river).map(|n| n.index).collect();
        sort_by_elevation(&mut runoff, &nodes, after);

        info!("River network...");
        let riversystem = RiverSystem::build(&mut nodes, outlet, tslopemin, tslopemax);
        let runoffsystem = RunoffSystem::new(&nodes, &runoff, resolution, tslopemin, tslopemax);

        let mut watershed = Watershed {
            header,
            nodes,
            nodesindex,
            outlet,
            rivers,
            runoff,
            coupled_ij,
            subcatchments: Vec::new(),
            products,
            riversystem,
            runoffsystem,
        };

        info!("Initialization of subwatersheds...");
        watershed.init_subs();

        Ok(watershed)
    }

    pub fn resolution(&self) -> f64 {
        self.header.dx
    }

    pub fn nb_subs(&self) -> i32 {
        self.nodes.iter().map(|n| n.sub).max().unwrap_or(0)
    }

    pub fn get_node_from_ij(&self, i: usize, j: usize) -> Option<usize> {
        if i >= self.header.nx || j >= self.header.ny {
            return None;
        }
        self.nodesindex[j * self.header.nx + i]
    }

    pub fn get_node_from_xy(&self, x: f64, y: f64) -> Option<usize> {
        let (i, j) = self.header.get_ij_from_xy(x, y)?;
        self.get_node_from_ij(i, j)
    }

    /// River nodes filtered by sub-basin and/or reach, ascending
    /// conditioned elevation, with the most-upstream node.
    pub fn find_rivers(&self, whichsub: i32, whichreach: i32) -> (Vec<usize>, Option<usize>) {
        let mut sel: Vec<usize> = self
            .nodes
            .iter()
            .filter(|n| {
                n.river
                    && (whichsub <= 0 || n.sub == whichsub)
                    && (whichreach <= 0 || n.reach == whichreach)
            })
            .map(|n| n.index)
            .collect();
        sort_by_elevation(&mut sel, &self.nodes, DemProduct::AfterCorr.index());
        let up = sel.last().copied();
        (sel, up)
    }

    pub fn find_sub(&self, whichsub: i32) -> Vec<usize> {
        let mut sel: Vec<usize> = self
            .nodes
            .iter()
            .filter(|n| whichsub <= 0 || n.sub == whichsub)
            .map(|n| n.index)
            .collect();
        sort_by_elevation(&mut sel, &self.nodes, DemProduct::AfterCorr.index());
        sel
    }

    pub fn find_runoffnodes(&self, whichsub: i32) -> Vec<usize> {
        let mut sel: Vec<usize> = self
            .nodes
            .iter()
            .filter(|n| !n.river && (whichsub <= 0 || n.sub == whichsub))
            .map(|n| n.index)
            .collect();
        sort_by_elevation(&mut sel, &self.nodes, DemProduct::AfterCorr.index());
        sel
    }

    fn init_subs(&mut self) {
        let nx = self.header.nx;
        for s in 1..=self.nb_subs() {
            let mut mask = vec![false; nx * self.header.ny];
            for n in self.nodes.iter().filter(|n| n.sub == s) {
                mask[n.j * nx + n.i] = true;
            }
            let (rivers, _) = self.find_rivers(s, 0);
            let mut idx_reaches: Vec<i32> = rivers.iter().map(|&r| self.nodes[r].reach).collect();
            idx_reaches.sort_unstable();
            idx_reaches.dedup();

            self.subcatchments.push(SubWatershed {
                index: (s - 1) as usize,
                name: format!("sub n{}", s),
                sub: s,
                mask,
                dx: self.header.dx,
                dy: self.header.dy,
                nodes: self.find_sub(s),
                rivers,
                runoff: self.find_runoffnodes(s),
                idx_reaches,
            });
        }
    }

    /// Attach a surveyed cross-section bed elevation to the river cell at
    /// `(x, y)`. Keeps the minimum over all sections falling in the cell
    /// and activates the cross-section product for the run.
    pub fn set_crosssection_elevation(&mut self, x: f64, y: f64, z: f64) -> bool {
        let Some(idx) = self.get_node_from_xy(x, y) else {
            return false;
        };
        if !self.nodes[idx].river {
            return false;
        }
        let k = DemProduct::CrossSection.index();
        self.nodes[idx].dem[k] = self.nodes[idx].dem[k].min(z);
        if !self.products.contains(&DemProduct::CrossSection) {
            self.products.push(DemProduct::CrossSection);
        }
        true
    }

    /// Run the min- and max-slope correction passes for every active
    /// product, rivers then hillslopes.
    pub fn slope_corrections(&mut self) -> Result<()> {
        let resolution = self.header.dx;
        let Watershed {
            ref riversystem,
            ref runoffsystem,
            ref mut nodes,
            ref products,
            ..
        } = *self;

        info!("Slopes corrections...");
        riversystem.slope_correction(nodes, products, resolution)?;
        runoffsystem.slope_correction(nodes, products, resolution)?;
        Ok(())
    }

    /// Corrected slope raster over every node for one product.
    pub fn slope_corr_raster(&self, product: DemProduct) -> Raster<f64> {
        let mut out = Raster::filled_nodata(self.header);
        for n in &self.nodes {
            out.set(n.i, n.j, n.slopecorr[product.index()].value);
        }
        out
    }

    /// Corrected elevation raster over every node for one product.
    pub fn dem_corr_raster(&self, product: DemProduct) -> Raster<f64> {
        let mut out = Raster::filled_nodata(self.header);
        for n in &self.nodes {
            out.set(n.i, n.j, n.demcorr[product.index()].value);
        }
        out
    }

    /// Write every derived raster under `dir/Characteristic_maps`.
    pub fn write_corrections(&self, dir: &Path) -> Result<()> {
        let maps = dir.join("Characteristic_maps");

        self.riversystem
            .strahler_raster(&self.nodes, self.header)
            .write(maps.join("Drainage_basin.strahler"))?;
        self.riversystem
            .reachlevel_raster(&self.nodes, self.header)
            .write(maps.join("Drainage_basin.reachlevel"))?;

        for &product in &self.products {
            let name = product.name();
            self.slope_corr_raster(product)
                .write(maps.join("corrslopes").join(name).join("Drainage_basin.slope_corr"))?;
            self.dem_corr_raster(product)
                .write(maps.join("corrdem").join(name).join("Drainage_basincorr.b"))?;
            self.riversystem
                .slope_corr_raster(&self.nodes, self.header, product)
                .write(maps.join(format!("Drainage_basin.slope_corr_riv_{}", name)))?;
            self.runoffsystem
                .slope_corr_raster(&self.nodes, self.header, product)
                .write(maps.join(format!("Drainage_basin.slope_corr_run_{}", name)))?;
        }
        Ok(())
    }
}

fn sort_by_elevation(sel: &mut [usize], nodes: &[Node], product: usize) {
    sel.sort_by(|&a, &b| {
        nodes[a].dem[product]
            .partial_cmp(&nodes[b].dem[product])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn init_nodes(rasters: &WatershedRasters) -> (Vec<Node>, Vec<Option<usize>>) {
    let header = rasters.subs.header;
    let (nx, ny) = (header.nx, header.ny);

    let mut nodesindex: Vec<Option<usize>> = vec![None; nx * ny];
    let mut nodes: Vec<Node> = Vec::with_capacity(rasters.subs.nb_notnull());

    for j in 0..ny {
        for i in 0..nx {
            if rasters.subs.is_nodata(i, j) || rasters.subs.get(i, j) <= 0 {
                continue;
            }
            let index = nodes.len();
            nodesindex[j * nx + i] = Some(index);

            let (x, y) = header.get_xy_from_ij(i, j);
            let mut node = Node::new(index, i, j, x, y);

            node.dem[DemProduct::BeforeCorr.index()] = rasters.dem_before.get(i, j);
            node.dem[DemProduct::AfterCorr.index()] = rasters.dem_after.get(i, j);
            node.slope = rasters.slopes.get(i, j);
            node.sub = rasters.subs.get(i, j);
            node.uparea = rasters.uparea.get(i, j);
            node.time = rasters.times.get(i, j);
            node.river = !rasters.reaches.is_nodata(i, j) && rasters.reaches.get(i, j) > 0;
            if node.river {
                node.reach = rasters.reaches.get(i, j);
            }
            for k in 0..DemProduct::COUNT {
                node.demcorr[k].value = node.dem[DemProduct::AfterCorr.index()];
                node.slopecorr[k].value = node.slope;
            }
            nodes.push(node);
        }
    }

    (nodes, nodesindex)
}

fn resolve_coupled(
    header: &RasterHeader,
    nodesindex: &[Option<usize>],
    coupled_xy: &[[f64; 4]],
) -> Result<Vec<((usize, usize), (usize, usize))>> {
    let mut out = Vec::with_capacity(coupled_xy.len());
    for &[xup, yup, xdown, ydown] in coupled_xy {
        let resolve = |x: f64, y: f64| -> Result<(usize, usize)> {
            let (i, j) = header
                .get_ij_from_xy(x, y)
                .ok_or(Error::CoupledPairOutside { x, y })?;
            if nodesindex[j * header.nx + i].is_none() {
                return Err(Error::CoupledPairOutside { x, y });
            }
            Ok((i, j))
        };
        let up = resolve(xup, yup)?;
        let down = resolve(xdown, ydown)?;
        // a self-referencing override would break every downstream walk
        if up == down {
            return Err(Error::CoupledPairDegenerate { x: xdown, y: ydown });
        }
        out.push((up, down));
    }
    Ok(out)
}

/// Forced-exchange pass; runs before the primary pass so forced nodes are
/// skipped by steepest-descent selection.
fn link_forced(
    nodes: &mut [Node],
    coupled_ij: &[((usize, usize), (usize, usize))],
    nodesindex: &[Option<usize>],
    header: &RasterHeader,
    resolution: f64,
) {
    for &((i, j), (idown, jdown)) in coupled_ij {
        let cur = nodesindex[j * header.nx + i].unwrap();
        let down = nodesindex[jdown * header.nx + idown].unwrap();

        let di = idown as f64 - i as f64;
        let dj = jdown as f64 - j as f64;

        nodes[cur].forced = true;
        nodes[cur].down = Some(down);
        nodes[cur].incrs = resolution * (di * di + dj * dj).sqrt();
        nodes[down].up.push(cur);
        if nodes[cur].river {
            nodes[down].upriver.push(cur);
        }
    }
}

/// Primary steepest-descent pass over the 4-connected neighbourhood of
/// the conditioned DEM. Exactly one node may end up without a descent
/// target; that node is the outlet.
fn link_steepest(
    nodes: &mut Vec<Node>,
    nodesindex: &[Option<usize>],
    dem_after: &Raster<f64>,
    resolution: f64,
) -> Result<usize> {
    let nx = dem_after.header.nx;
    let mut outlets: Vec<usize> = Vec::new();

    for cur in 0..nodes.len() {
        if nodes[cur].forced {
            continue;
        }
        let (i, j) = (nodes[cur].i as isize, nodes[cur].j as isize);
        let curtop = nodes[cur].dem[DemProduct::AfterCorr.index()];

        let mut mindiff = f64::INFINITY;
        let mut best: Option<usize> = None;
        for (di, dj) in NEIGHBOURS_CROSS {
            let (ni, nj) = (i + di, j + dj);
            let neighbour = active_node(nodesindex, nx, dem_after.header.ny, ni, nj);
            let diff = match neighbour {
                Some(_) => dem_after.get(ni as usize, nj as usize) - curtop,
                None => f64::INFINITY,
            };
            if diff < mindiff {
                mindiff = diff;
                best = neighbour;
            }
        }

        if mindiff < 0.0 {
            let down = best.unwrap();
            nodes[cur].down = Some(down);
            nodes[cur].incrs = resolution;
            nodes[down].up.push(cur);
            if nodes[cur].river {
                nodes[down].upriver.push(cur);
            }
        } else {
            outlets.push(cur);
        }
    }

    match outlets.len() {
        0 => Err(Error::NoOutlet),
        1 => Ok(outlets[0]),
        n => Err(Error::MultipleOutlets(n)),
    }
}

fn active_node(
    nodesindex: &[Option<usize>],
    nx: usize,
    ny: usize,
    i: isize,
    j: isize,
) -> Option<usize> {
    if i < 0 || j < 0 || i as usize >= nx || j as usize >= ny {
        return None;
    }
    nodesindex[j as usize * nx + i as usize]
}

/// Slope towards the 8-neighbour with the largest raw drop on the raw
/// DEM, normalized by that neighbour's distance. Cells with no lower
/// neighbour keep zero. Diagnostic only; never drives linkage.
fn compute_sloped8(
    nodes: &mut [Node],
    nodesindex: &[Option<usize>],
    dem_before: &Raster<f64>,
    resolution: f64,
) {
    let (nx, ny) = (dem_before.header.nx, dem_before.header.ny);
    for node in nodes.iter_mut() {
        if node.forced {
            continue;
        }
        let (i, j) = (node.i as isize, node.j as isize);
        let curtop = node.dem[DemProduct::BeforeCorr.index()];

        let mut mindiff = f64::INFINITY;
        let mut fact = 1.0;
        for (di, dj, f) in NEIGHBOURS_D8 {
            let (ni, nj) = (i + di, j + dj);
            if active_node(nodesindex, nx, ny, ni, nj).is_none() {
                continue;
            }
            let diff = dem_before.get(ni as usize, nj as usize) - curtop;
            if diff < mindiff {
                mindiff = diff;
                fact = f;
            }
        }
        if mindiff < 0.0 {
            node.sloped8 = -mindiff / (resolution * fact);
        }
    }
}

/// Curvilinear distance from the outlet, iteratively with an explicit
/// stack. The graph can be as deep as the node count, so native-stack
/// recursion is not an option here.
fn incr_curvi(nodes: &mut [Node], outlet: usize) {
    nodes[outlet].cums = 0.0;
    let mut stack: Vec<usize> = vec![outlet];
    while let Some(cur) = stack.pop() {
        let base = nodes[cur].cums;
        let ups = nodes[cur].up.clone();
        for u in ups {
            nodes[u].cums = base + nodes[u].incrs;
            stack.push(u);
        }
    }
}

/// Minimum of a finer DEM over each cell footprint (sub-pixel sampling).
fn sample_subpixels(
    nodes: &mut [Node],
    header: &RasterHeader,
    dem: &Raster<f64>,
    product: DemProduct,
) {
    let sub = &dem.header;
    for node in nodes.iter_mut() {
        let (cx, cy) = (node.x, node.y);
        let half_x = (header.dx - sub.dx) / 2.0;
        let half_y = (header.dy - sub.dy) / 2.0;

        let lo = sub.get_ij_from_xy(cx - half_x, cy - half_y);
        let hi = sub.get_ij_from_xy(cx + half_x, cy + half_y);
        let (Some((i1, j1)), Some((i2, j2))) = (lo, hi) else {
            continue;
        };

        let mut zmin = f64::INFINITY;
        for j in j1..=j2 {
            for i in i1..=i2 {
                if !dem.is_nodata(i, j) {
                    zmin = zmin.min(dem.get(i, j));
                }
            }
        }
        if zmin.is_finite() {
            node.dem[product.index()] = zmin;
        } else {
            node.dem[product.index()] = MISSING_ELEVATION;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::GridSpec;

    #[test]
    fn test_single_outlet_straight_river() {
        // 1x5 west-flowing river, outlet at the west end
        let ws = GridSpec::new(10.0)
            .dem(vec![vec![0.0, 8.0, 9.0, 9.5, 10.0]])
            .sub(vec![vec![1, 1, 1, 1, 1]])
            .reach(vec![vec![1, 1, 1, 1, 1]])
            .build_watershed(None, None)
            .unwrap();

        assert_eq!(ws.nodes.len(), 5);
        let outlet = &ws.nodes[ws.outlet];
        assert_eq!((outlet.i, outlet.j), (0, 0));
        assert!(outlet.down.is_none());
        assert_eq!(
            ws.nodes.iter().filter(|n| n.down.is_none()).count(),
            1
        );
    }

    #[test]
    fn test_partitioned_mask_is_fatal() {
        // two disconnected pits -> two outlet candidates
        let result = GridSpec::new(10.0)
            .dem(vec![vec![1.0, 5.0, -9999.0, 5.0, 1.0]])
            .sub(vec![vec![1, 1, 0, 2, 2]])
            .reach(vec![vec![0, 0, 0, 0, 0]])
            .build_watershed(None, None);

        assert!(matches!(result, Err(Error::MultipleOutlets(2))));
    }

    #[test]
    fn test_coupled_pair_on_single_cell_is_fatal() {
        // both endpoints fall inside cell (0, 0)
        let result = GridSpec::new(10.0)
            .dem(vec![vec![2.0, 1.0, 0.0]])
            .sub(vec![vec![1, 1, 1]])
            .reach(vec![vec![0, 0, 0]])
            .coupled(vec![[5.0, 5.0, 9.0, 5.0]])
            .build_watershed(None, None);

        assert!(matches!(result, Err(Error::CoupledPairDegenerate { .. })));
    }

    #[test]
    fn test_forest_invariant_and_cums() {
        let ws = GridSpec::new(10.0)
            .dem(vec![
                vec![5.0, 6.0, 7.0],
                vec![2.0, 4.0, 8.0],
                vec![0.0, 3.0, 9.0],
            ])
            .sub(vec![vec![1, 1, 1], vec![1, 1, 1], vec![1, 1, 1]])
            .reach(vec![vec![0, 0, 0], vec![0, 0, 0], vec![0, 0, 0]])
            .build_watershed(None, None)
            .unwrap();

        // every walk reaches the outlet within node-count steps
        for n in &ws.nodes {
            let mut cur = n.index;
            let mut steps = 0;
            while let Some(d) = ws.nodes[cur].down {
                cur = d;
                steps += 1;
                assert!(steps <= ws.nodes.len(), "cycle detected");
            }
            assert_eq!(cur, ws.outlet);
        }

        // cums(node) == cums(down) + incrs, zero at the outlet
        assert_eq!(ws.nodes[ws.outlet].cums, 0.0);
        for n in &ws.nodes {
            if let Some(d) = n.down {
                assert!((n.cums - (ws.nodes[d].cums + n.incrs)).abs() < 1e-12);
                assert!(n.cums > ws.nodes[d].cums);
            }
        }
    }

    #[test]
    fn test_forced_exchange_euclidean_incrs() {
        // two active cells, linked only by the forced pair (0,0) -> (5,5)
        let mut dem = vec![vec![-9999.0; 6]; 6];
        let mut sub = vec![vec![0; 6]; 6];
        // rows are given top-down; (i=0, j=5) is dem[0][0]
        dem[5][0] = 10.0; // (0, 0)
        dem[0][5] = 1.0; // (5, 5)
        sub[5][0] = 1;
        sub[0][5] = 1;

        let grid = GridSpec::new(10.0)
            .dem(dem)
            .sub(sub)
            .reach(vec![vec![0; 6]; 6]);
        let (x_up, y_up) = (5.0, 5.0); // cell centre of (0, 0)
        let (x_dn, y_dn) = (55.0, 55.0); // cell centre of (5, 5)
        let ws = grid
            .coupled(vec![[x_up, y_up, x_dn, y_dn]])
            .build_watershed(None, None)
            .unwrap();

        let up = ws.get_node_from_ij(0, 0).unwrap();
        let down = ws.get_node_from_ij(5, 5).unwrap();
        assert!(ws.nodes[up].forced);
        assert_eq!(ws.nodes[up].down, Some(down));
        assert_eq!(ws.outlet, down);
        let expected = 10.0 * 50.0f64.sqrt();
        assert!((ws.nodes[up].incrs - expected).abs() < 1e-9);
        assert!((ws.nodes[up].cums - expected).abs() < 1e-9);
    }

    #[test]
    fn test_corrupt_coupled_pairs_is_fatal() {
        let dir = std::env::temp_dir().join("thalweg_coupled_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("Coupled_pairs.txt");
        std::fs::write(&path, "WRONG HEADER\n1\t2\t3\t4\n").unwrap();
        assert!(matches!(
            read_coupled_pairs(&path),
            Err(Error::CoupledPairs { .. })
        ));

        std::fs::write(&path, "COORDINATES\n1\t2\t3\n").unwrap();
        assert!(read_coupled_pairs(&path).is_err());

        std::fs::write(&path, "COORDINATES\n1.0\t2.0\t3.0\t4.0\n").unwrap();
        assert_eq!(read_coupled_pairs(&path).unwrap(), vec![[1.0, 2.0, 3.0, 4.0]]);

        // absent file means no overrides
        assert!(read_coupled_pairs(dir.join("nope.txt")).unwrap().is_empty());
    }

    #[test]
    fn test_sloped8_picks_largest_raw_drop() {
        let ws = GridSpec::new(10.0)
            .dem(vec![
                vec![9.5, 9.6, 9.7],
                vec![2.0, 8.0, 9.0],
                vec![1.0, 7.0, 9.0],
            ])
            .sub(vec![vec![1, 1, 1], vec![1, 1, 1], vec![1, 1, 1]])
            .reach(vec![vec![0, 0, 0], vec![0, 0, 0], vec![0, 0, 0]])
            .build_watershed(None, None)
            .unwrap();

        // centre cell: the cross drop 8 -> 2 is steeper once normalized
        // (0.6), but the diagonal 8 -> 1 carries the largest raw drop
        // and wins
        let centre = ws.get_node_from_ij(1, 1).unwrap();
        let expected = 7.0 / (10.0 * 2.0f64.sqrt());
        assert!((ws.nodes[centre].sloped8 - expected).abs() < 1e-12);
    }

    #[test]
    fn test_crosssection_attaches_to_river_cells_only() {
        let mut ws = GridSpec::new(10.0)
            .dem(vec![vec![0.0, 8.0, 9.0, 9.5, 10.0]])
            .sub(vec![vec![1, 1, 1, 1, 1]])
            .reach(vec![vec![1, 1, 1, 0, 0]])
            .build_watershed(None, None)
            .unwrap();
        assert!(!ws.products.contains(&DemProduct::CrossSection));

        // hillslope cell: refused
        assert!(!ws.set_crosssection_elevation(35.0, 5.0, 7.0));
        // river cell: attached, keeping the minimum over repeats
        assert!(ws.set_crosssection_elevation(15.0, 5.0, 7.5));
        assert!(ws.set_crosssection_elevation(15.0, 5.0, 7.0));
        assert!(ws.set_crosssection_elevation(15.0, 5.0, 7.2));
        assert!(ws.products.contains(&DemProduct::CrossSection));

        let n = ws.get_node_from_xy(15.0, 5.0).unwrap();
        let k = DemProduct::CrossSection.index();
        assert_eq!(ws.nodes[n].dem[k], 7.0);
        assert_eq!(
            ws.nodes[n].correction_elevation(DemProduct::CrossSection),
            7.0
        );
    }

    #[test]
    fn test_subwatershed_surface() {
        let ws = GridSpec::new(10.0)
            .dem(vec![vec![0.0, 1.0, 2.0, 3.0]])
            .sub(vec![vec![1, 1, 2, 2]])
            .reach(vec![vec![1, 1, 1, 1]])
            .build_watershed(None, None)
            .unwrap();

        assert_eq!(ws.subcatchments.len(), 2);
        assert_eq!(ws.subcatchments[0].surface(), 200.0);
        assert_eq!(ws.subcatchments[1].surface(), 200.0);
        assert_eq!(ws.subcatchments[0].idx_reaches, vec![1]);
        assert_eq!(ws.subcatchments[0].nodes.len(), 2);
    }
}
