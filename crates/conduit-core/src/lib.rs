//! # conduit-core
//!
//! Core types, traits, and abstractions for the conduit job orchestrator.
//!
//! This crate provides the job data model, the lifecycle state machine, the
//! dependency failure taxonomy and the [`JobStore`] persistence seam that the
//! other conduit crates depend on.

pub mod defaults;
pub mod error;
pub mod ids;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use ids::new_v7;
pub use models::*;
pub use traits::*;
