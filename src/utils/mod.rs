//! Utility functions and helpers

pub mod error;
pub mod fs;

pub use self::error::{OrchestratorError, ResultExt};
