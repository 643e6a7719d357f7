//! Codoc Common - Configuration, validation, and logging for the Codoc workspace.
//!
//! This crate provides:
//! - Configuration types and loading (`~/.codoc/config.json` plus `CODOC_*` overrides)
//! - Configuration validation
//! - Logging setup with noise filtering
//! - Small string helpers used when logging and capping user input

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{ApiConfig, ChatConfig, Config, ObservabilityConfig};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{ApiConfig, ChatConfig, Config};
    pub use crate::logging::init_logging;
    pub use crate::validation::{Validate, ValidationError};
}
