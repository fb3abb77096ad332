//! Release actions and the ordered list that owns them.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::logging::Logger;

/// A deferred cleanup for a successfully acquired resource.
///
/// `FnOnce` makes "invoked at most once" a property of the type.
pub type ReleaseAction = Box<dyn FnOnce() + Send>;

/// A stage's output: the resource and, optionally, how to release it.
pub struct Acquired<T> {
    pub resource: T,
    pub release: Option<ReleaseAction>,
}

impl<T> fmt::Debug for Acquired<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquired")
            .field("release", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> Acquired<T> {
    /// A resource with nothing to release.
    pub fn bare(resource: T) -> Self {
        Self {
            resource,
            release: None,
        }
    }

    /// A resource with a release action.
    pub fn with_release(resource: T, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            resource,
            release: Some(Box::new(release)),
        }
    }
}

/// The acquisition stages, in the order the sequencer runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Logger,
    Stats,
    Profiler,
    Tracer,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Logger => "logger",
            Stage::Stats => "stats",
            Stage::Profiler => "profiler",
            Stage::Tracer => "tracer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which release actions run, for both rollback and close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReleaseOrder {
    /// Oldest first, the order resources were acquired in.
    ///
    /// Later stages hold the logger, so under this order they are released
    /// after the logger's own release has already run.
    #[default]
    Acquisition,
    /// Newest first (LIFO).
    Reverse,
}

/// Ordered release actions, one per acquisition that reported one.
#[derive(Default)]
pub struct ReleaseList {
    entries: Vec<(Stage, ReleaseAction)>,
    order: ReleaseOrder,
}

impl fmt::Debug for ReleaseList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseList")
            .field("stages", &self.stages())
            .field("order", &self.order)
            .finish()
    }
}

impl ReleaseList {
    pub fn new(order: ReleaseOrder) -> Self {
        Self {
            entries: Vec::new(),
            order,
        }
    }

    /// Record the release action of a stage that just succeeded.
    pub fn push(&mut self, stage: Stage, action: ReleaseAction) {
        self.entries.push((stage, action));
    }

    /// Record `action` if the stage reported one.
    pub fn push_opt(&mut self, stage: Stage, action: Option<ReleaseAction>) {
        if let Some(action) = action {
            self.push(stage, action);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn order(&self) -> ReleaseOrder {
        self.order
    }

    /// Stages holding a release action, in append order.
    pub fn stages(&self) -> Vec<Stage> {
        self.entries.iter().map(|(stage, _)| *stage).collect()
    }

    /// Invoke every action, draining the list.
    ///
    /// A panicking action is caught and logged; the remaining actions still
    /// run. Returns the number of actions that completed without panicking.
    pub fn release_all(&mut self, log: &Logger) -> usize {
        let mut entries = std::mem::take(&mut self.entries);
        if self.order == ReleaseOrder::Reverse {
            entries.reverse();
        }

        let mut completed = 0;
        for (stage, action) in entries {
            match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(()) => completed += 1,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    log.log(
                        tracing::Level::WARN,
                        "release action panicked",
                        &[("stage", stage.as_str()), ("panic", &reason)],
                    );
                }
            }
        }
        completed
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
