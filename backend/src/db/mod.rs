//! Plan store and GIS collaborators.
//!
//! This module provides abstractions for plan persistence and raster fetches
//! via the Repository pattern, allowing different backends to be swapped easily.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Application Layer (REST API, job controller)           │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Service Layer (services.rs) - Business Logic           │
//! │  - Submission rules and first enqueue                   │
//! │  - Status query with per-feature outcomes               │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────────────────────┐
//! │  Repository Traits (repository/) - Abstract Interface   │
//! │  - PlanRepository (plans, rows, skips)                  │
//! │  - GisRepository (rasters, stand variables)             │
//! └───────────────────┬─────────────────────────────────────┘
//!                     │
//!     ┌───────────────▼──────────────────────────────┐
//!     │             Local Repository                  │
//!     │               (in-memory)                     │
//!     └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! The store is built once from configuration and shared as an `Arc`:
//!
//! ```
//! use forest_carbon::config::AppConfig;
//! use forest_carbon::db::{services, RepositoryFactory};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let repo = RepositoryFactory::from_config(&AppConfig::default())?;
//! let healthy = services::health_check(repo.as_ref()).await?;
//! # Ok(())
//! # }
//! ```

pub mod factory;
pub mod repositories;
pub mod repository;
pub mod services;

pub use factory::{RepositoryFactory, RepositoryType};
pub use repositories::LocalRepository;
pub use repository::{
    ErrorContext, FullRepository, GisRepository, PlanRepository, RepositoryError,
    RepositoryResult,
};
pub use services::{get_plan_status, health_check, submit_plan, PlanStatus, SubmitError};
