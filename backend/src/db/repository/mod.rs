//! Repository trait definitions.
//!
//! Two focused traits abstract the collaborators of the calculation pipeline:
//!
//! - [`plan`]: the plan store (plans, features, result rows, skip records)
//! - [`gis`]: raster and stand-variable fetches
//! - [`error`]: error types shared by both
//!
//! # Trait Composition
//!
//! A complete backend implements both traits and is then usable wherever a
//! [`FullRepository`] is expected:
//!
//! ```ignore
//! impl PlanRepository for MyRepo { ... }
//! impl GisRepository for MyRepo { ... }
//! ```

pub mod error;
pub mod gis;
pub mod plan;

pub use error::{ErrorContext, RepositoryError, RepositoryResult};
pub use gis::GisRepository;
pub use plan::PlanRepository;

/// Composite trait bound for a complete repository implementation.
pub trait FullRepository: PlanRepository + GisRepository {}

// Blanket implementation: any type implementing both traits is a FullRepository
impl<T> FullRepository for T where T: PlanRepository + GisRepository {}
