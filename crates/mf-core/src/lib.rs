//! mf-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other mf-* crates,
//! providing type-safe identifiers, the error taxonomy used to classify job
//! failures, media-domain enums, application configuration, and a broadcast
//! event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;
pub mod paths;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, ErrorKind, Result};
pub use ids::*;
pub use media::*;
