//! Configuration validation.
//!
//! Every section is checked and all problems are reported together.

use thiserror::Error;

use crate::config::{ApiConfig, ChatConfig, Config, ObservabilityConfig};
use crate::logging::LogFormat;

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for result in [
            self.api.validate(),
            self.chat.validate(),
            self.observability.validate(),
        ] {
            if let Err(e) = result {
                errors.push(e);
            }
        }

        collect(errors)
    }
}

impl Validate for ApiConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "api.base_url".into(),
            });
        } else if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            errors.push(ValidationError::InvalidValue {
                field: "api.base_url".into(),
                reason: format!("'{base_url}' must start with http:// or https://"),
            });
        }

        if self.request_timeout_secs == 0 {
            errors.push(positive("api.request_timeout_secs"));
        }
        if self.connect_timeout_secs == 0 {
            errors.push(positive("api.connect_timeout_secs"));
        }

        collect(errors)
    }
}

impl Validate for ChatConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if self.flush_interval_ms == 0 {
            errors.push(positive("chat.flush_interval_ms"));
        }
        if self.max_input_length == 0 {
            errors.push(positive("chat.max_input_length"));
        }
        if self.event_channel_capacity == 0 {
            errors.push(positive("chat.event_channel_capacity"));
        }

        collect(errors)
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        self.log_format
            .parse::<LogFormat>()
            .map(|_| ())
            .map_err(|reason| ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason,
            })
    }
}

fn positive(field: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: "must be greater than 0".into(),
    }
}

/// Fold a list of errors: none is Ok, one is returned as is, more become `Multiple`.
fn collect(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}
