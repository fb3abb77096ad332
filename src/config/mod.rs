//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! CLI flags / env vars (cli.rs)        config file (TOML)
//!     → MonitoringArgs                     → loader.rs (parse & deserialize)
//!     ↘                                    ↙
//!              ObserveConfig (schema.rs)
//!     → validation.rs (semantic checks)
//!     → read by every acquisition stage
//! ```
//!
//! # Design Decisions
//! - Config is immutable once built; the sequencer only borrows it
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{LogConfig, ObserveConfig, ProfilingConfig, StatsConfig, TracingConfig};
pub use validation::{validate_config, ValidationError};
