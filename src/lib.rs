extern crate lazy_static;

pub mod error;
pub mod raster;
pub mod node;
pub mod support;
pub mod watershed;
pub mod river;
pub mod runoff;

#[cfg(test)]
pub mod testutil;

pub use error::{Error, Result};
pub use node::DemProduct;
pub use watershed::Watershed;
