//! Events module for engine observation
//!
//! Structured events published by the engine and the reload coordinator.
//! Warnings that must reach the user without interrupting them (failed
//! suppression, skipped slots, rejected edits) travel here.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Sender half shared by every publisher
pub type EventSender = broadcast::Sender<EngineEvent>;

/// Events emitted by the engine during its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A trigger was pressed and its loop started
    Armed {
        trigger: String,
        output: String,
        interval_ms: u32,
        pass_through: bool,
    },

    /// A loop finished and its key state was restored
    Disarmed {
        trigger: String,
        /// Milliseconds the loop was armed
        duration_ms: u64,
        /// Output pulses emitted while armed
        pulses: u64,
    },

    /// Suppression was requested but the backend refused; the trigger
    /// passes through while armed
    SuppressionUnavailable { trigger: String, reason: String },

    /// Emitting the output failed; that loop stopped
    EmitFailed {
        trigger: String,
        output: String,
        reason: String,
    },

    /// A slot was not registered (trigger conflict or hook refusal)
    SlotSkipped {
        slot_id: String,
        trigger: String,
        reason: String,
    },

    /// The emergency hotkey could not be registered
    EmergencyHotkeyUnavailable { reason: String },

    /// The emergency hotkey fired
    EmergencyStop {
        /// Number of loops that were armed
        stopped: usize,
    },

    /// A changed binding file was applied
    ConfigReloaded { enabled: usize, total: usize },

    /// A changed binding file was rejected; previous bindings keep running
    ConfigRejected { reason: String },
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Armed {
                trigger,
                output,
                interval_ms,
                pass_through,
            } => write!(
                f,
                "ARMED {} -> {} @{}ms (pass-through {})",
                trigger.to_uppercase(),
                output.to_uppercase(),
                interval_ms,
                if *pass_through { "ON" } else { "OFF" }
            ),
            EngineEvent::Disarmed {
                trigger,
                duration_ms,
                pulses,
            } => write!(
                f,
                "DISARMED {} ({} pulses in {}ms)",
                trigger.to_uppercase(),
                pulses,
                duration_ms
            ),
            EngineEvent::SuppressionUnavailable { trigger, reason } => write!(
                f,
                "SUPPRESSION_UNAVAILABLE {}: {}",
                trigger.to_uppercase(),
                reason
            ),
            EngineEvent::EmitFailed {
                trigger,
                output,
                reason,
            } => write!(
                f,
                "EMIT_FAILED {} -> {}: {}",
                trigger.to_uppercase(),
                output.to_uppercase(),
                reason
            ),
            EngineEvent::SlotSkipped {
                slot_id,
                trigger,
                reason,
            } => write!(f, "SLOT_SKIPPED {} ({}): {}", slot_id, trigger, reason),
            EngineEvent::EmergencyHotkeyUnavailable { reason } => {
                write!(f, "EMERGENCY_HOTKEY_UNAVAILABLE: {}", reason)
            }
            EngineEvent::EmergencyStop { stopped } => {
                write!(f, "EMERGENCY_STOP ({} loops stopped)", stopped)
            }
            EngineEvent::ConfigReloaded { enabled, total } => {
                write!(f, "CONFIG_RELOADED ({}/{} slots enabled)", enabled, total)
            }
            EngineEvent::ConfigRejected { reason } => write!(f, "CONFIG_REJECTED: {}", reason),
        }
    }
}

impl EngineEvent {
    /// True for events that report a degraded or rejected operation
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EngineEvent::SuppressionUnavailable { .. }
                | EngineEvent::EmitFailed { .. }
                | EngineEvent::SlotSkipped { .. }
                | EngineEvent::EmergencyHotkeyUnavailable { .. }
                | EngineEvent::ConfigRejected { .. }
        )
    }
}

/// Publish without caring whether anyone is listening
pub fn publish(tx: &EventSender, event: EngineEvent) {
    let _ = tx.send(event);
}
