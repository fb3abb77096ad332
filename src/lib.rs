//! Command-line service bootstrap helpers.
//!
//! Turns parsed CLI flags into the observability primitives a service needs
//! (logger, statter, profiler, tracer provider) and bundles them into an
//! [`Observer`] with ordered, all-or-nothing acquisition and a single
//! shutdown path.

// Configuration
pub mod cli;
pub mod config;
pub mod tags;

// Stages
pub mod logging;
pub mod profiling;
pub mod stats;
pub mod trace;

// Acquisition and lifecycle
pub mod lifecycle;
pub mod observe;

pub use config::schema::ObserveConfig;
pub use observe::{Observer, ObserveError, Options};
