use std::collections::HashMap;

use lazy_static::lazy_static;

/// Sentinel elevation for products without a value at a node (matches the
/// raster nodata convention of the characteristic maps).
pub const MISSING_ELEVATION: f64 = 99999.0;

/// The closed set of elevation products a run can correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemProduct {
    /// Raw DEM, before hydrological conditioning
    BeforeCorr,
    /// Conditioned DEM; the primary product, used for linkage and sorting
    AfterCorr,
    /// Minimum of a 10 m sub-pixel DEM over each cell footprint
    SubPixel10,
    /// Minimum of a 20 m sub-pixel DEM over each cell footprint
    SubPixel20,
    /// Bed elevation sampled from surveyed cross sections
    CrossSection,
}

impl DemProduct {
    pub const COUNT: usize = 5;

    pub const ALL: [DemProduct; DemProduct::COUNT] = [
        DemProduct::BeforeCorr,
        DemProduct::AfterCorr,
        DemProduct::SubPixel10,
        DemProduct::SubPixel20,
        DemProduct::CrossSection,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DemProduct::BeforeCorr => "dem_before_corr",
            DemProduct::AfterCorr => "dem_after_corr",
            DemProduct::SubPixel10 => "dem_10m",
            DemProduct::SubPixel20 => "dem_20m",
            DemProduct::CrossSection => "crosssection",
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

lazy_static! {
    /// Product lookup by the name used in file suffixes and on the CLI.
    pub static ref PRODUCTS_BY_NAME: HashMap<&'static str, DemProduct> = {
        let mut m = HashMap::new();
        for p in DemProduct::ALL {
            m.insert(p.name(), p);
        }
        m
    };
}

/// A corrected quantity at a node: partial contributions from each
/// headwater walk passing through, and the resolved (averaged) value.
#[derive(Debug, Clone, Default)]
pub struct Corrected {
    pub parts: Vec<f64>,
    pub value: f64,
}

impl Corrected {
    pub fn resolve_mean(&mut self) {
        if !self.parts.is_empty() {
            self.value = self.parts.iter().sum::<f64>() / self.parts.len() as f64;
        }
        self.parts.clear();
    }
}

/// One vertex of the drainage graph; one per active grid cell.
///
/// Relations are stored as indices into the owning [`Watershed`]'s node
/// arena: `down` is the unique successor (`None` only at the outlet),
/// `up` the predecessors, `upriver` the river subset of `up`.
///
/// [`Watershed`]: crate::watershed::Watershed
#[derive(Debug, Clone)]
pub struct Node {
    pub i: usize,
    pub j: usize,
    pub x: f64,
    pub y: f64,
    /// Position in the arena, used for all O(1) back-references
    pub index: usize,

    /// Elevation per product
    pub dem: [f64; DemProduct::COUNT],
    /// Corrected elevation per product
    pub demcorr: [Corrected; DemProduct::COUNT],
    /// Corrected slope per product
    pub slopecorr: [Corrected; DemProduct::COUNT],

    /// Slope from the preprocessing raster
    pub slope: f64,
    /// Steepest-descent slope among the 8 neighbours on the raw DEM
    pub sloped8: f64,
    /// Drained area [km2]
    pub uparea: f64,
    /// Flow propagation time
    pub time: f64,

    pub river: bool,
    /// Reach id; only meaningful when `river` is true
    pub reach: i32,
    /// Sub-basin id
    pub sub: i32,
    /// Linkage was set by a forced-exchange pair, not steepest descent
    pub forced: bool,

    /// Strahler stream order
    pub strahler: i32,
    /// Number of headwater traversals passing through this node
    pub reachlevel: i32,

    /// Cumulative curvilinear distance to the outlet
    pub cums: f64,
    /// Curvilinear length of this node's own downstream edge
    pub incrs: f64,

    pub down: Option<usize>,
    pub up: Vec<usize>,
    pub upriver: Vec<usize>,
}

impl Node {
    pub fn new(index: usize, i: usize, j: usize, x: f64, y: f64) -> Self {
        Node {
            i,
            j,
            x,
            y,
            index,
            dem: [MISSING_ELEVATION; DemProduct::COUNT],
            demcorr: Default::default(),
            slopecorr: Default::default(),
            slope: 0.0,
            sloped8: 0.0,
            uparea: 0.0,
            time: 0.0,
            river: false,
            reach: -1,
            sub: 0,
            forced: false,
            strahler: 0,
            reachlevel: 0,
            cums: 0.0,
            incrs: 0.0,
            down: None,
            up: Vec::new(),
            upriver: Vec::new(),
        }
    }

    /// Elevation used by the correction passes: the cross-section product
    /// falls back to the conditioned DEM where it is higher or missing.
    pub fn correction_elevation(&self, product: DemProduct) -> f64 {
        let z = self.dem[product.index()];
        match product {
            DemProduct::CrossSection => z.min(self.dem[DemProduct::AfterCorr.index()]),
            _ => z,
        }
    }

    /// Mean preprocessed slope of the direct predecessors steeper than
    /// `threshold`; zero when none qualify.
    pub fn mean_slope_up(&self, nodes: &[Node], threshold: f64) -> f64 {
        let steep: Vec<f64> = self
            .up
            .iter()
            .map(|&u| nodes[u].slope)
            .filter(|&s| s > threshold)
            .collect();
        if steep.is_empty() {
            return 0.0;
        }
        steep.iter().sum::<f64>() / steep.len() as f64
    }

    /// First slope at or above `threshold` walking downstream; the
    /// outlet's slope when the walk exhausts.
    pub fn slope_down(&self, nodes: &[Node], threshold: f64) -> f64 {
        let mut cur = self;
        while cur.slope < threshold {
            match cur.down {
                Some(d) => cur = &nodes[d],
                None => break,
            }
        }
        cur.slope
    }

    /// First slope at or above `threshold` walking up the river network
    /// (first branch only); -1 when the walk dies out in a headwater.
    pub fn slope_upriver(&self, nodes: &[Node], threshold: f64) -> f64 {
        let mut cur = self;
        while cur.slope < threshold {
            match cur.upriver.first() {
                Some(&u) => cur = &nodes[u],
                None => return -1.0,
            }
        }
        cur.slope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_name_lookup() {
        assert_eq!(
            PRODUCTS_BY_NAME.get("dem_after_corr"),
            Some(&DemProduct::AfterCorr)
        );
        assert_eq!(PRODUCTS_BY_NAME.len(), DemProduct::COUNT);
    }

    #[test]
    fn test_correction_elevation_crosssection_min() {
        let mut n = Node::new(0, 0, 0, 5.0, 5.0);
        n.dem[DemProduct::AfterCorr.index()] = 12.0;
        // no surveyed section: fall back to the conditioned DEM
        assert_eq!(n.correction_elevation(DemProduct::CrossSection), 12.0);
        n.dem[DemProduct::CrossSection.index()] = 11.2;
        assert_eq!(n.correction_elevation(DemProduct::CrossSection), 11.2);
        assert_eq!(n.correction_elevation(DemProduct::AfterCorr), 12.0);
    }

    #[test]
    fn test_diagnostic_walks() {
        // chain: node 2 -> node 1 -> node 0 (outlet)
        let mut nodes: Vec<Node> = (0..3).map(|k| Node::new(k, k, 0, 0.0, 0.0)).collect();
        nodes[0].slope = 0.30;
        nodes[1].slope = 0.001;
        nodes[2].slope = 0.05;
        for n in nodes.iter_mut() {
            n.river = true;
        }
        nodes[1].down = Some(0);
        nodes[2].down = Some(1);
        nodes[0].up = vec![1];
        nodes[0].upriver = vec![1];
        nodes[1].up = vec![2];
        nodes[1].upriver = vec![2];

        assert_eq!(nodes[1].slope_down(&nodes, 0.01), 0.30);
        assert_eq!(nodes[1].slope_upriver(&nodes, 0.01), 0.05);
        assert_eq!(nodes[0].slope_upriver(&nodes, 0.01), 0.30);
        assert!((nodes[0].mean_slope_up(&nodes, 0.0) - 0.001).abs() < 1e-12);
        assert_eq!(nodes[0].mean_slope_up(&nodes, 0.01), 0.0);
        // walk dies out in a headwater below the threshold
        assert_eq!(nodes[2].slope_upriver(&nodes, 0.1), -1.0);
    }

    #[test]
    fn test_resolve_mean_clears_parts() {
        let mut c = Corrected {
            parts: vec![1.0, 3.0],
            value: 0.0,
        };
        c.resolve_mean();
        assert_eq!(c.value, 2.0);
        assert!(c.parts.is_empty());

        // no contributions: keep the current value
        c.resolve_mean();
        assert_eq!(c.value, 2.0);
    }
}
