use std::path::PathBuf;

use thiserror::Error;

/// Error type for watershed conditioning operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot read raster {path}: {reason}")]
    RasterFormat { path: PathBuf, reason: String },

    #[error("Raster size mismatch for {name}: expected {enx}x{eny}, got {anx}x{any}")]
    SizeMismatch {
        name: &'static str,
        enx: usize,
        eny: usize,
        anx: usize,
        any: usize,
    },

    #[error("Missing required raster: {0}")]
    MissingRaster(PathBuf),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt forced-exchange file {path}: {reason}")]
    CoupledPairs { path: PathBuf, reason: String },

    #[error("Forced-exchange endpoint ({x}, {y}) falls outside the active domain")]
    CoupledPairOutside { x: f64, y: f64 },

    #[error("Forced-exchange pair resolves to a single cell near ({x}, {y})")]
    CoupledPairDegenerate { x: f64, y: f64 },

    #[error("No outlet found: every active cell has a lower neighbour")]
    NoOutlet,

    #[error("Multiple outlets found ({0} cells with no descent target); the sub-basin mask is not a single drainage area")]
    MultipleOutlets(usize),

    #[error("Coincident curvilinear positions at cell ({i}, {j}); upstream raster data is inconsistent")]
    CoincidentCurvi { i: usize, j: usize },
}

/// Result type alias for watershed conditioning operations
pub type Result<T> = std::result::Result<T, Error>;
