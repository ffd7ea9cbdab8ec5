//! Slot: one validated trigger -> output binding

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::{Delivery, InjectionMethod};

/// Stable identifier of a slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotId {
    /// Taken from the `id` field of the binding file
    Explicit(String),
    /// 1-based position in the slot list when no id was given
    Positional(usize),
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::Explicit(id) => write!(f, "{}", id),
            SlotId::Positional(n) => write!(f, "slot-{}", n),
        }
    }
}

/// A validated binding. Immutable once constructed; only the validator
/// builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub(super) id: SlotId,
    pub(super) trigger_key: String,
    pub(super) output_key: String,
    pub(super) interval_ms: u32,
    pub(super) pass_through: bool,
    pub(super) enabled: bool,
    pub(super) delivery: Delivery,
}

impl Slot {
    pub fn id(&self) -> &SlotId {
        &self.id
    }

    /// Normalized (lowercase) trigger key name
    pub fn trigger_key(&self) -> &str {
        &self.trigger_key
    }

    /// Normalized (lowercase) output key name
    pub fn output_key(&self) -> &str {
        &self.output_key
    }

    /// Emission interval, always within 1..=1000
    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    /// When false the trigger key is suppressed while the loop is armed
    pub fn pass_through(&self) -> bool {
        self.pass_through
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// One-line human description, e.g. `e -> r @50ms (pass-through off)`
    pub fn describe(&self) -> String {
        let mut line = format!(
            "{} -> {} @{}ms (pass-through {})",
            self.trigger_key,
            self.output_key,
            self.interval_ms,
            if self.pass_through { "on" } else { "off" }
        );
        if let Some(window) = &self.delivery.target_window {
            line.push_str(&format!(" -> '{}'", window));
        }
        if !self.enabled {
            line.push_str(" [disabled]");
        }
        line
    }

    /// Serializable form written back to the binding file
    pub fn to_record(&self) -> SlotRecord {
        SlotRecord {
            id: match &self.id {
                SlotId::Explicit(id) => Some(id.clone()),
                SlotId::Positional(_) => None,
            },
            trigger_key: self.trigger_key.clone(),
            output_key: self.output_key.clone(),
            interval_ms: self.interval_ms,
            pass_through: self.pass_through,
            enabled: self.enabled,
            window_title: self.delivery.target_window.clone().unwrap_or_default(),
            use_send_input: self.delivery.method == InjectionMethod::Hardware,
        }
    }
}

/// On-disk shape of a slot (camelCase JSON)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub trigger_key: String,
    pub output_key: String,
    pub interval_ms: u32,
    pub pass_through: bool,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub window_title: String,
    pub use_send_input: bool,
}
