//! Multi-slot trigger-loop engine
//!
//! The controller owns the registered slots and their hooks; one runner
//! thread exists per currently held trigger key.

mod controller;
mod runner;

pub use controller::{ApplyReport, Engine, EngineOptions, SkippedSlot, EMERGENCY_HOTKEY};
pub use runner::{Clock, StopSignal};

use crate::backend::BackendError;

/// Errors surfaced by the engine controller
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("trigger '{trigger}' is already bound by {existing}, {incoming} skipped")]
    Conflict {
        trigger: String,
        existing: String,
        incoming: String,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("none of the {attempted} enabled slots could be registered: {last_error}")]
    NoBindings { attempted: usize, last_error: String },

    #[error("failed to spawn loop thread for '{trigger}': {reason}")]
    Spawn { trigger: String, reason: String },
}
