//! Common types and utilities shared across all crates

pub mod types;
pub mod config;
pub mod error;
pub mod telemetry;

pub use types::*;
pub use config::*;
pub use error::{PipelineError, PipelineResult};
pub use telemetry::*;
