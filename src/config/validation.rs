//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check tag lists are well formed
//! - Validate value ranges (ratio within [0, 1], intervals > 0)
//! - Detect contradictory options (token and basic auth together)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ObserveConfig → Result<(), Vec<ValidationError>>
//! - Reuses the stage parsers so a config that validates also acquires

use thiserror::Error;

use crate::config::schema::ObserveConfig;
use crate::logging::parse_level;
use crate::profiling::PyroscopeDsn;
use crate::tags;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `stats.tags`.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl ToString) -> Self {
        Self {
            field,
            message: message.to_string(),
        }
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ObserveConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = parse_level(&config.log.level) {
        errors.push(ValidationError::new("log.level", e));
    }
    check_tags(&mut errors, "log.ctx", &config.log.ctx);

    if !config.stats.dsn.is_empty() {
        if let Err(e) = url::Url::parse(&config.stats.dsn) {
            errors.push(ValidationError::new("stats.dsn", e));
        }
    }
    if config.stats.interval_ms == 0 {
        errors.push(ValidationError::new("stats.interval_ms", "must be greater than zero"));
    }
    check_tags(&mut errors, "stats.tags", &config.stats.tags);

    if !config.profiling.dsn.is_empty() {
        if let Err(e) = PyroscopeDsn::parse(&config.profiling.dsn) {
            errors.push(ValidationError::new("profiling.dsn", e));
        }
    }
    if config.profiling.sample_rate == 0 {
        errors.push(ValidationError::new("profiling.sample_rate", "must be greater than zero"));
    }
    check_tags(&mut errors, "profiling.tags", &config.profiling.tags);

    if !(0.0..=1.0).contains(&config.tracing.ratio) {
        errors.push(ValidationError::new(
            "tracing.ratio",
            format!("{} is outside [0, 1]", config.tracing.ratio),
        ));
    }
    check_tags(&mut errors, "tracing.tags", &config.tracing.tags);
    check_tags(&mut errors, "tracing.headers", &config.tracing.headers);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_tags(errors: &mut Vec<ValidationError>, field: &'static str, entries: &[String]) {
    if let Err(e) = tags::parse(entries) {
        errors.push(ValidationError::new(field, e));
    }
}
