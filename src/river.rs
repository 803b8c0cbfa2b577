use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use geojson::Value::LineString;
use geojson::{Feature, FeatureCollection, Geometry};
use log::info;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::to_string_pretty;

use crate::error::{Error, Result};
use crate::node::{DemProduct, Node};
use crate::raster::{Raster, RasterHeader};
use crate::support::{clamp_slope, interp_extrapolate, slope_down_series};

/// One reach of the river network.
#[derive(Debug, Clone)]
pub struct Reach {
    pub id: i32,
    /// Most-upstream node of the reach
    pub upstream: usize,
    /// Reach nodes, ascending conditioned elevation (downstream first)
    pub baselist: Vec<usize>,
}

/// Selected profile of one headwater walk: curvilinear positions and
/// elevations of the retained cells only.
type Profile = (Vec<f64>, Vec<f64>);

/// The river network: reaches grouped by id, headwater anchors, level and
/// Strahler indexes, and the slope-correction machinery for river cells.
pub struct RiverSystem {
    pub reaches: BTreeMap<i32, Reach>,
    /// Reach anchors with no upstream river cell, the walk origins
    pub upstreams: Vec<usize>,
    /// Reach ids per traversal level
    pub indexed: BTreeMap<i32, Vec<i32>>,
    /// Reach ids per Strahler order
    pub strahler: BTreeMap<i32, Vec<i32>>,
    pub maxlevels: i32,
    pub maxstrahler: i32,
    pub tslopemin: Option<f64>,
    pub tslopemax: Option<f64>,
}

/// Reach metadata for the network summary export.
#[derive(Debug, Serialize)]
pub struct ReachSummary {
    pub reach: i32,
    pub strahler: i32,
    pub reachlevel: i32,
    pub nb_nodes: usize,
    pub length: f64,
}

#[derive(Debug, Serialize)]
pub struct NetworkSummary {
    pub nb_reaches: usize,
    pub nb_headwaters: usize,
    pub maxlevels: i32,
    pub maxstrahler: i32,
    pub reaches: Vec<ReachSummary>,
}

impl RiverSystem {
    /// Group river nodes into reaches, find the headwater anchors and
    /// compute traversal levels and Strahler orders. Writes `reachlevel`
    /// and `strahler` back into the nodes.
    pub fn build(
        nodes: &mut [Node],
        outlet: usize,
        tslopemin: Option<f64>,
        tslopemax: Option<f64>,
    ) -> RiverSystem {
        let mut reaches: BTreeMap<i32, Reach> = BTreeMap::new();
        for n in nodes.iter().filter(|n| n.river) {
            reaches
                .entry(n.reach)
                .or_insert_with(|| Reach {
                    id: n.reach,
                    upstream: n.index,
                    baselist: Vec::new(),
                })
                .baselist
                .push(n.index);
        }
        let after = DemProduct::AfterCorr.index();
        for reach in reaches.values_mut() {
            reach.baselist.sort_by(|&a, &b| {
                nodes[a].dem[after]
                    .partial_cmp(&nodes[b].dem[after])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            reach.upstream = *reach.baselist.last().unwrap();
        }

        let upstreams: Vec<usize> = reaches
            .values()
            .filter(|r| nodes[r.upstream].upriver.is_empty())
            .map(|r| r.upstream)
            .collect();
        info!("{} reaches, {} headwaters", reaches.len(), upstreams.len());

        let mut system = RiverSystem {
            reaches,
            upstreams,
            indexed: BTreeMap::new(),
            strahler: BTreeMap::new(),
            maxlevels: 0,
            maxstrahler: 0,
            tslopemin,
            tslopemax,
        };
        system.create_index(nodes, outlet);
        system
    }

    /// Traversal levels and Strahler orders.
    ///
    /// Every headwater walk increments `reachlevel` on each node down to
    /// the outlet, so a reach's level is the number of headwaters above
    /// it. Level-1 reaches get order 1; higher reaches take the maximum
    /// order of the rivers joining at their anchor, plus one when those
    /// orders are all equal.
    fn create_index(&mut self, nodes: &mut [Node], outlet: usize) {
        for &up in &self.upstreams {
            let mut cur = Some(up);
            while let Some(c) = cur {
                nodes[c].reachlevel += 1;
                cur = nodes[c].down;
            }
        }
        self.maxlevels = nodes[outlet].reachlevel;

        for reach in self.reaches.values() {
            let level = nodes[reach.baselist[0]].reachlevel;
            self.indexed.entry(level).or_default().push(reach.id);
        }

        if let Some(first) = self.indexed.get(&1) {
            self.strahler.insert(1, first.clone());
            for &id in first {
                set_strahler_in_nodes(nodes, &self.reaches[&id], 1);
            }
        }

        for level in 2..=self.maxlevels {
            let Some(listlevel) = self.indexed.get(&level) else {
                continue;
            };
            for &id in listlevel.clone().iter() {
                let anchor = self.reaches[&id].upstream;
                let upidx: Vec<i32> = nodes[anchor]
                    .upriver
                    .iter()
                    .map(|&u| nodes[u].strahler)
                    .collect();
                let order = match upidx.iter().max() {
                    None => 1,
                    Some(&maxidx) => {
                        if upidx.iter().all(|&v| v == upidx[0]) {
                            maxidx + 1
                        } else {
                            maxidx
                        }
                    }
                };
                self.strahler.entry(order).or_default().push(id);
                set_strahler_in_nodes(nodes, &self.reaches[&id], order);
            }
        }
        self.maxstrahler = self.strahler.keys().next_back().copied().unwrap_or(0);
    }

    /// Minimum- then maximum-slope correction over river cells, for each
    /// active product. Each pass is skipped when its threshold is unset.
    pub fn slope_correction(
        &self,
        nodes: &mut [Node],
        products: &[DemProduct],
        resolution: f64,
    ) -> Result<()> {
        if let Some(tmin) = self.tslopemin {
            info!("select min - river");
            for &product in products {
                let profiles = self.select_min(nodes, product, resolution, tmin);
                self.compute_slopescorr(nodes, product, &profiles)?;
            }
        }
        if let Some(tmax) = self.tslopemax {
            info!("select max - river");
            for &product in products {
                let profiles = self.select_max(nodes, product, resolution, tmax);
                self.compute_slopescorr(nodes, product, &profiles)?;
            }
        }
        Ok(())
    }

    /// Walk each headwater to the outlet, keeping only the cells that
    /// preserve a descent steeper than `tmin`. Skipped cells stretch the
    /// running distance, so a long flat run ends at its first real drop.
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
                    } else {
                        locs += resolution;
                    }
                    cur = nodes[c].down;
                }
                (x, y)
            })
            .collect()
    }

    /// Walk each headwater over the min-corrected elevations, popping back
    /// selected cells while the local slope exceeds `tmax`.
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
                    }

                    cur = nodes[c].down;
                }
                (x, y)
            })
            .collect()
    }

    /// Interpolate each selected profile back onto the full walk, stack
    /// the per-walk contributions on the traversed nodes, then resolve
    /// every reach to the mean of its contributions.
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
                    return Ok(None);
                }
                let x = path_cums(shared, up)?;
                let y = interp_extrapolate(xsel, ysel, &x);
                let slopes = slope_down_series(&x, &y);
                Ok(Some((y, slopes)))
            })
            .collect::<Result<Vec<_>>>()?;

        // merge in headwater order so contributions stack deterministically
        for (&up, corr) in self.upstreams.iter().zip(&corrected) {
            let Some((y, slopes)) = corr else { continue };
            let mut cur = Some(up);
            let mut i = 0;
            while let Some(c) = cur {
                nodes[c].demcorr[k].parts.push(y[i]);
                nodes[c].slopecorr[k].parts.push(slopes[i]);
                i += 1;
                cur = nodes[c].down;
            }
        }

        for reach in self.reaches.values() {
            let degenerate = reach.baselist.len() < 2;
            for &n in &reach.baselist {
                let node = &mut nodes[n];
                if degenerate || node.slopecorr[k].parts.is_empty() {
                    // too short to carry a profile: clamp the raw slope
                    node.slopecorr[k].value =
                        clamp_slope(node.slope, self.tslopemin, self.tslopemax);
                    node.slopecorr[k].parts.clear();
                    node.demcorr[k].parts.clear();
                } else {
                    node.demcorr[k].resolve_mean();
                    node.slopecorr[k].resolve_mean();
                }
            }
        }
        Ok(())
    }

    /// Strahler order raster over river cells.
    pub fn strahler_raster(&self, nodes: &[Node], header: RasterHeader) -> Raster<i32> {
        let mut out = Raster::filled_nodata(header);
        for reach in self.reaches.values() {
            for &n in &reach.baselist {
                out.set(nodes[n].i, nodes[n].j, nodes[n].strahler);
            }
        }
        out
    }

    /// Traversal level raster over river cells.
    pub fn reachlevel_raster(&self, nodes: &[Node], header: RasterHeader) -> Raster<i32> {
        let mut out = Raster::filled_nodata(header);
        for reach in self.reaches.values() {
            for &n in &reach.baselist {
                out.set(nodes[n].i, nodes[n].j, nodes[n].reachlevel);
            }
        }
        out
    }

    /// Corrected slope raster over river cells only.
    pub fn slope_corr_raster(
        &self,
        nodes: &[Node],
        header: RasterHeader,
        product: DemProduct,
    ) -> Raster<f64> {
        let k = product.index();
        let mut out = Raster::filled_nodata(header);
        for reach in self.reaches.values() {
            for &n in &reach.baselist {
                out.set(nodes[n].i, nodes[n].j, nodes[n].slopecorr[k].value);
            }
        }
        out
    }

    fn reach_length(&self, nodes: &[Node], reach: &Reach) -> f64 {
        let down = &nodes[reach.baselist[0]];
        nodes[reach.upstream].cums - down.cums + down.incrs
    }

    pub fn summary(&self, nodes: &[Node]) -> NetworkSummary {
        NetworkSummary {
            nb_reaches: self.reaches.len(),
            nb_headwaters: self.upstreams.len(),
            maxlevels: self.maxlevels,
            maxstrahler: self.maxstrahler,
            reaches: self
                .reaches
                .values()
                .map(|reach| ReachSummary {
                    reach: reach.id,
                    strahler: nodes[reach.upstream].strahler,
                    reachlevel: nodes[reach.baselist[0]].reachlevel,
                    nb_nodes: reach.baselist.len(),
                    length: self.reach_length(nodes, reach),
                })
                .collect(),
        }
    }

    pub fn write_summary_json(&self, nodes: &[Node], path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(to_string_pretty(&self.summary(nodes))?.as_bytes())?;
        Ok(())
    }

    pub fn write_reaches_csv(&self, nodes: &[Node], path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = csv::Writer::from_writer(file);

        writer.write_record(["reach", "strahler", "reachlevel", "nb_nodes", "length"])?;
        for reach in self.reaches.values() {
            writer.write_record([
                reach.id.to_string(),
                nodes[reach.upstream].strahler.to_string(),
                nodes[reach.baselist[0]].reachlevel.to_string(),
                reach.baselist.len().to_string(),
                self.reach_length(nodes, reach).to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// One LineString feature per reach, downstream node first.
    pub fn to_geojson_feature_collection(&self, nodes: &[Node]) -> FeatureCollection {
        let features: Vec<Feature> = self
            .reaches
            .values()
            .map(|reach| {
                let coords: Vec<Vec<f64>> = reach
                    .baselist
                    .iter()
                    .map(|&n| vec![nodes[n].x, nodes[n].y])
                    .collect();
                let line_string = Geometry::new(LineString(coords));

                let mut properties = serde_json::Map::new();
                properties.insert(
                    String::from("reach"),
                    serde_json::Value::Number(serde_json::Number::from(reach.id as i64)),
                );
                properties.insert(
                    String::from("strahler"),
                    serde_json::Value::Number(serde_json::Number::from(
                        nodes[reach.upstream].strahler as i64,
                    )),
                );
                properties.insert(
                    String::from("reachlevel"),
                    serde_json::Value::Number(serde_json::Number::from(
                        nodes[reach.baselist[0]].reachlevel as i64,
                    )),
                );
                if let Some(number) =
                    serde_json::Number::from_f64(self.reach_length(nodes, reach))
                {
                    properties.insert(String::from("length"), serde_json::Value::Number(number));
                }

                Feature {
                    bbox: None,
                    geometry: Some(line_string),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();

        FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }

    pub fn write_geojson(&self, nodes: &[Node], path: &Path) -> Result<()> {
        let feature_collection = self.to_geojson_feature_collection(nodes);
        let mut file = File::create(path)?;
        file.write_all(to_string_pretty(&feature_collection)?.as_bytes())?;
        Ok(())
    }
}

fn set_strahler_in_nodes(nodes: &mut [Node], reach: &Reach, strahler: i32) {
    for &n in &reach.baselist {
        nodes[n].strahler = strahler;
    }
}

/// Curvilinear positions of the full walk from `up` to the outlet.
/// Positions must be strictly decreasing; coincident neighbours mean the
/// upstream rasters are inconsistent and would poison the interpolation.
fn path_cums(nodes: &[Node], up: usize) -> Result<Vec<f64>> {
    let mut x = Vec::new();
    let mut cur = Some(up);
    while let Some(c) = cur {
        if let Some(&last) = x.last() {
            if nodes[c].cums >= last {
                return Err(Error::CoincidentCurvi {
                    i: nodes[c].i,
                    j: nodes[c].j,
                });
            }
        }
        x.push(nodes[c].cums);
        cur = nodes[c].down;
    }
    Ok(x)
}
