use log::info;
use rayon::prelude::*;

use crate::error::Result;
use crate::node::{DemProduct, Node};
use crate::raster::{Raster, RasterHeader};
use crate::support::{clamp_slope, interp_extrapolate, slope_down_series};

type Profile = (Vec<f64>, Vec<f64>);

/// The hillslope cells of a model and their slope-correction machinery.
///
/// Walks start from cells draining exactly one cell of area and stop at
/// the river network; river cells are corrected by the
/// [`RiverSystem`](crate::river::RiverSystem) instead.
pub struct RunoffSystem {
    /// Hillslope nodes, ascending conditioned elevation
    pub nodes: Vec<usize>,
    /// Unit-drained-area cells, the walk origins
    pub upstreams: Vec<usize>,
    pub tslopemin: Option<f64>,
    pub tslopemax: Option<f64>,
}

impl RunoffSystem {
    pub fn new(
        nodes: &[Node],
        runoff: &[usize],
        resolution: f64,
        tslopemin: Option<f64>,
        tslopemax: Option<f64>,
    ) -> RunoffSystem {
        // a cell draining only itself has the unit area, in km2
        let areaup = resolution.powi(2) / 1.0e6;
        let upstreams: Vec<usize> = runoff
            .iter()
            .copied()
            .filter(|&n| (nodes[n].uparea - areaup).abs() < 1.0e-6)
            .collect();
        info!(
            "{} runoff cells, {} hillslope headwaters",
            runoff.len(),
            upstreams.len()
        );

        RunoffSystem {
            nodes: runoff.to_vec(),
            upstreams,
            tslopemin,
            tslopemax,
        }
    }

    /// Minimum- then maximum-slope correction over hillslope cells, for
    /// each active product. Each pass is skipped when its threshold is
    /// unset.
    pub fn slope_correction(
        &self,
        nodes: &mut [Node],
        products: &[DemProduct],
        resolution: f64,
    ) -> Result<()> {
        if let Some(tmin) = self.tslopemin {
            info!("select min - runoff");
            for &product in products {
                let profiles = self.select_min(nodes, product, resolution, tmin);
                self.compute_slopescorr(nodes, product, &profiles)?;
            }
        }
        if let Some(tmax) = self.tslopemax {
            info!("select max - runoff");
            for &product in products {
                let profiles = self.select_max(nodes, product, resolution, tmax);
                self.compute_slopescorr(nodes, product, &profiles)?;
            }
        }
        Ok(())
    }

    /// Same retention rule as the river pass, but a walk ends once it
    /// keeps a river cell.
    fn select_min(
        &self,
        nodes: &[Node],
        product: DemProduct,
        resolution: f64,
        tmin: f64,
    ) -> Vec<Profile> {
        self.upstreams
            .par_iter()
            .map(|&up| {
                let mut basey = nodes[up].correction_elevation(product);
                let mut x = vec![nodes[up].cums];
                let mut y = vec![basey];

                let mut cur = nodes[up].down;
                let mut locs = resolution;
                while let Some(c) = cur {
                    let yloc = nodes[c].correction_elevation(product);
                    if (basey - yloc) / locs > tmin {
                        x.push(nodes[c].cums);
                        y.push(yloc);
                        basey = yloc;
                        locs = resolution;
                        if nodes[c].river {
                            break;
                        }
                    } else {
                        locs += resolution;
                    }
                    cur = nodes[c].down;
                }
                (x, y)
            })
            .collect()
    }

    fn select_max(
        &self,
        nodes: &[Node],
        product: DemProduct,
        resolution: f64,
        tmax: f64,
    ) -> Vec<Profile> {
        let k = product.index();
        self.upstreams
            .par_iter()
            .map(|&up| {
                let mut basey = nodes[up].demcorr[k].value;
                let mut x = vec![nodes[up].cums];
                let mut y = vec![basey];

                let mut cur = nodes[up].down;
                let mut locs = resolution;
                while let Some(c) = cur {
                    let yloc = nodes[c].demcorr[k].value;

                    while x.len() > 1 && (basey - yloc) / locs > tmax {
                        x.pop();
                        y.pop();
                        basey = *y.last().unwrap();
                        locs += resolution;
                    }

                    if yloc < *y.last().unwrap() {
                        x.push(nodes[c].cums);
                        y.push(yloc);
                        basey = yloc;
                        locs = resolution;
                        if nodes[c].river {
                            break;
                        }
                    }

                    cur = nodes[c].down;
                }
                (x, y)
            })
            .collect()
    }

    /// Interpolate the selected profiles onto the hillslope part of each
    /// walk, stack the contributions, then resolve each node to the mean.
    /// Cells carrying fewer than two contributions cannot be corrected
    /// and fall back to their clamped raw slope.
    fn compute_slopescorr(
        &self,
        nodes: &mut [Node],
        product: DemProduct,
        profiles: &[Profile],
    ) -> Result<()> {
        let k = product.index();

        let shared: &[Node] = nodes;
        let corrected: Vec<Option<(Vec<f64>, Vec<f64>)>> = self
            .upstreams
            .par_iter()
            .zip(profiles.par_iter())
            .map(|(&up, (xsel, ysel))| {
                if xsel.len() < 2 {
                    return None;
                }
                let x = path_cums(shared, up);
                if x.len() < 2 {
                    return None;
                }
                let y = interp_extrapolate(xsel, ysel, &x);
                let slopes = slope_down_series(&x, &y);
                Some((y, slopes))
            })
            .collect();

        for (&up, corr) in self.upstreams.iter().zip(&corrected) {
            let Some((y, slopes)) = corr else { continue };
            let mut cur = up;
            let mut i = 0;
            while !nodes[cur].river {
                nodes[cur].demcorr[k].parts.push(y[i]);
                nodes[cur].slopecorr[k].parts.push(slopes[i]);
                i += 1;
                match nodes[cur].down {
                    Some(d) => cur = d,
                    None => break,
                }
            }
        }

        for &n in &self.nodes {
            let node = &mut nodes[n];
            if node.slopecorr[k].parts.len() < 2 {
                // flat spills into the river leave nothing to average
                node.slopecorr[k].value = clamp_slope(node.slope, self.tslopemin, self.tslopemax);
                node.slopecorr[k].parts.clear();
                node.demcorr[k].parts.clear();
            } else {
                node.demcorr[k].resolve_mean();
                node.slopecorr[k].resolve_mean();
            }
        }
        Ok(())
    }

    /// Corrected slope raster over hillslope cells only.
    pub fn slope_corr_raster(
        &self,
        nodes: &[Node],
        header: RasterHeader,
        product: DemProduct,
    ) -> Raster<f64> {
        let k = product.index();
        let mut out = Raster::filled_nodata(header);
        for &n in &self.nodes {
            out.set(nodes[n].i, nodes[n].j, nodes[n].slopecorr[k].value);
        }
        out
    }
}

/// Curvilinear positions of the hillslope part of the walk from `up`. A
/// single-cell hillslope borrows the river cell below it so there are
/// always two points to interpolate between.
fn path_cums(nodes: &[Node], up: usize) -> Vec<f64> {
    let mut x = Vec::new();
    let mut cur = up;
    while !nodes[cur].river {
        x.push(nodes[cur].cums);
        match nodes[cur].down {
            Some(d) => cur = d,
            None => return x,
        }
    }
    if x.len() == 1 {
        x.push(nodes[cur].cums);
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::GridSpec;
    use crate::watershed::Watershed;

    // two unit-area hillslope heads converging on a shared path into a
    // one-cell river
    fn converging_watershed(tmin: Option<f64>, tmax: Option<f64>) -> Watershed {
        let unit = 1.0e-4; // 10 m cells, km2
        GridSpec::new(10.0)
            .dem(vec![
                vec![10.0, 8.0, 7.0, 6.0],
                vec![-9999.0, 10.0, -9999.0, -9999.0],
            ])
            .sub(vec![vec![1, 1, 1, 1], vec![0, 1, 0, 0]])
            .reach(vec![vec![0, 0, 0, 1], vec![0, 0, 0, 0]])
            .uparea(vec![
                vec![unit, 3.0 * unit, 4.0 * unit, 5.0 * unit],
                vec![0.0, unit, 0.0, 0.0],
            ])
            .build_watershed(tmin, tmax)
            .unwrap()
    }

    #[test]
    fn test_unit_area_headwater_selection() {
        let ws = converging_watershed(None, None);
        let rs = &ws.runoffsystem;

        assert_eq!(rs.nodes.len(), 4);
        assert_eq!(rs.upstreams.len(), 2);
        for &up in &rs.upstreams {
            assert!((ws.nodes[up].uparea - 1.0e-4).abs() < 1.0e-6);
        }
    }

    #[test]
    fn test_shared_path_gets_mean_of_contributions() {
        let mut ws = converging_watershed(Some(0.001), None);
        ws.slope_corrections().unwrap();

        let k = DemProduct::AfterCorr.index();
        let c = ws.get_node_from_ij(1, 1).unwrap();
        let d = ws.get_node_from_ij(2, 1).unwrap();

        // both walks contribute the same interpolated profile
        assert!((ws.nodes[c].demcorr[k].value - 8.0).abs() < 1e-9);
        assert!((ws.nodes[d].demcorr[k].value - 7.0).abs() < 1e-9);
        assert!((ws.nodes[c].slopecorr[k].value - 0.1).abs() < 1e-9);
        assert!((ws.nodes[d].slopecorr[k].value - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_single_contribution_falls_back_to_clamped_raw() {
        let mut ws = converging_watershed(Some(0.001), None);
        ws.slope_corrections().unwrap();

        let k = DemProduct::AfterCorr.index();
        // the heads are traversed by their own walk only
        for &(i, j) in &[(0usize, 1usize), (1usize, 0usize)] {
            let n = ws.get_node_from_ij(i, j).unwrap();
            assert!(ws.nodes[n].slopecorr[k].parts.is_empty());
            // raw slope 0 clamped up to the minimum threshold
            assert_eq!(ws.nodes[n].slopecorr[k].value, 0.001);
            // elevation untouched by the fallback
            assert_eq!(
                ws.nodes[n].demcorr[k].value,
                ws.nodes[n].dem[DemProduct::AfterCorr.index()]
            );
        }
    }

    #[test]
    fn test_walk_stops_at_river() {
        let mut ws = converging_watershed(Some(0.001), None);
        ws.slope_corrections().unwrap();

        let k = DemProduct::AfterCorr.index();
        // the river cell is the outlet of a one-cell reach: corrected by
        // the river side, which clamps its raw slope, not by the walks
        let r = ws.get_node_from_ij(3, 1).unwrap();
        assert!(ws.nodes[r].river);
        assert_eq!(ws.nodes[r].slopecorr[k].value, 0.001);
        assert_eq!(ws.nodes[r].demcorr[k].value, 6.0);
    }

    #[test]
    fn test_runoff_raster_covers_hillslopes_only() {
        let mut ws = converging_watershed(Some(0.001), None);
        ws.slope_corrections().unwrap();

        let raster =
            ws.runoffsystem
                .slope_corr_raster(&ws.nodes, ws.header, DemProduct::AfterCorr);
        assert_eq!(raster.nb_notnull(), 4);
        let r = ws.get_node_from_ij(3, 1).unwrap();
        assert!(raster.is_nodata(ws.nodes[r].i, ws.nodes[r].j));
    }
}
