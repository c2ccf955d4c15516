//! # Forest Carbon Backend
//!
//! Incremental per-feature forest carbon accounting for land-use plans.
//!
//! A submitted plan is a GeoJSON feature collection. Every feature is
//! calculated on its own unit of work: its geometry is reprojected and
//! repaired, the carbon rasters under it are weighted by the area each cell
//! shares with the polygon, and the stand categories it covers are projected
//! along growth curves to a set of horizon years. Rows are persisted as they
//! are produced, so a plan can be polled while it is being calculated and
//! resumed after a restart.
//!
//! ## Architecture
//!
//! - [`geometry`]: Reprojection, repair and fetch regions
//! - [`calculator`]: Overlap weighting, growth projection, per-feature rows and totals
//! - [`reference`]: Growth-curve and area-multiplier tables
//! - [`db`]: Plan store and GIS collaborators behind the repository pattern
//! - [`services`]: Job queue, worker pool, task tracker and job controller
//! - [`http`]: Axum-based HTTP server and request handlers
//! - [`config`]: File and environment configuration
//!

// Allow large error types - RepositoryError contains rich context for debugging
#![allow(clippy::result_large_err)]

pub mod calculator;
pub mod config;
pub mod db;
pub mod geometry;
pub mod models;
pub mod reference;
pub mod services;

#[cfg(feature = "http-server")]
pub mod http;
