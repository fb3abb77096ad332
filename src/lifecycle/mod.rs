//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_signals() resolves
//!
//! Shutdown (shutdown.rs):
//!     trigger() → every subscriber stops → Observer::close()
//! ```
//!
//! # Design Decisions
//! - Signal waiting is async so the binary can race it against its work
//! - Observer teardown happens after every subscriber has stopped

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{wait_for_signals, Signal};
