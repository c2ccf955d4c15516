//! Repository implementations module.
//!
//! - `local`: in-memory implementation of the plan store and GIS traits,
//!   used for unit testing and local development
pub mod local;

pub use local::LocalRepository;
