//! Domain types shared by the calculator, the job controller and the stores.

pub mod plan;
pub mod raster;
pub mod report;
pub mod stand;

pub use plan::*;
pub use raster::*;
pub use report::*;
pub use stand::*;
