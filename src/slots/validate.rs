//! Slot validation from untyped JSON
//!
//! Values are coerced leniently (the binding file is hand edited) but the
//! resulting [`Slot`] always satisfies its invariants: non-empty, known key
//! names and an interval within `1..=1000` ms.

use serde_json::{Map, Value};

use super::slot::{Slot, SlotId};
use crate::backend::{keys, Delivery, InjectionMethod, InputBackend};

pub const MIN_INTERVAL_MS: u32 = 1;
pub const MAX_INTERVAL_MS: u32 = 1000;

pub const DEFAULT_TRIGGER_KEY: &str = "e";
pub const DEFAULT_OUTPUT_KEY: &str = "r";
pub const DEFAULT_INTERVAL_MS: u32 = 50;

/// Errors produced while validating slots or loading a binding file
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("invalid {field} '{value}': {reason}")]
    InvalidKey {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("intervalMs must be an integer between 1 and 1000 inclusive, got {0}")]
    InvalidInterval(String),

    #[error("malformed binding file: {0}")]
    Malformed(String),

    #[error("slot {position}: {source}")]
    InSlot {
        position: usize,
        #[source]
        source: Box<SlotError>,
    },

    #[error("unable to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// First present value among camelCase and legacy snake_case spellings
fn field<'a>(map: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| map.get(*name))
}

fn normalize_key(
    field_name: &'static str,
    value: Option<&Value>,
    default: &str,
    backend: &dyn InputBackend,
) -> Result<String, SlotError> {
    let raw = match value {
        None | Some(Value::Null) => default.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(SlotError::InvalidKey {
                field: field_name,
                value: other.to_string(),
                reason: "expected a key name".to_string(),
            })
        }
    };

    let key = keys::normalize(&raw);
    if key.is_empty() {
        return Err(SlotError::InvalidKey {
            field: field_name,
            value: raw,
            reason: "key name cannot be empty".to_string(),
        });
    }
    if !backend.validate_key_name(&key) {
        return Err(SlotError::InvalidKey {
            field: field_name,
            value: raw,
            reason: "unknown key".to_string(),
        });
    }
    Ok(key)
}

fn parse_interval(value: Option<&Value>) -> Result<u32, SlotError> {
    let value = match value {
        None | Some(Value::Null) => return Ok(DEFAULT_INTERVAL_MS),
        Some(value) => value,
    };
    let invalid = || SlotError::InvalidInterval(value.to_string());

    let interval: i64 = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => {
                let f = n.as_f64().ok_or_else(invalid)?;
                if !f.is_finite() || f.fract() != 0.0 || f.abs() > i64::MAX as f64 {
                    return Err(invalid());
                }
                f as i64
            }
        },
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    if !(MIN_INTERVAL_MS as i64..=MAX_INTERVAL_MS as i64).contains(&interval) {
        return Err(SlotError::InvalidInterval(interval.to_string()));
    }
    Ok(interval as u32)
}

/// Boolean-like coercion: `true/false`, `1/0`, `"yes"/"no"`, `"on"/"off"`,
/// anything else by generic truthiness.
pub fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        None => default,
        Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn parse_id(value: Option<&Value>, position: usize) -> SlotId {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => SlotId::Explicit(s.trim().to_string()),
        Some(Value::Number(n)) => SlotId::Explicit(n.to_string()),
        _ => SlotId::Positional(position),
    }
}

fn parse_delivery(map: &Map<String, Value>) -> Delivery {
    let target_window = match field(map, &["windowTitle", "window_title"]) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    };
    let hardware = coerce_bool(
        field(map, &["useSendInput", "use_sendinput", "use_send_input"]),
        true,
    );
    Delivery {
        target_window,
        method: if hardware {
            InjectionMethod::Hardware
        } else {
            InjectionMethod::Message
        },
    }
}

/// Validate one slot mapping. `position` is 1-based and only used for the
/// fallback id.
pub fn validate_slot(
    raw: &Value,
    position: usize,
    backend: &dyn InputBackend,
) -> Result<Slot, SlotError> {
    let map = raw
        .as_object()
        .ok_or_else(|| SlotError::Malformed(format!("slot must be an object, got {}", raw)))?;

    let trigger_key = normalize_key(
        "triggerKey",
        field(map, &["triggerKey", "trigger_key"]),
        DEFAULT_TRIGGER_KEY,
        backend,
    )?;
    let output_key = normalize_key(
        "outputKey",
        field(map, &["outputKey", "output_key"]),
        DEFAULT_OUTPUT_KEY,
        backend,
    )?;
    let interval_ms = parse_interval(field(map, &["intervalMs", "interval_ms"]))?;
    let pass_through = coerce_bool(field(map, &["passThrough", "pass_through"]), false);
    let enabled = coerce_bool(field(map, &["enabled"]), true);

    Ok(Slot {
        id: parse_id(map.get("id"), position),
        trigger_key,
        output_key,
        interval_ms,
        pass_through,
        enabled,
        delivery: parse_delivery(map),
    })
}

/// The slot used when a binding file has none
pub fn default_slot(position: usize) -> Slot {
    Slot {
        id: SlotId::Positional(position),
        trigger_key: DEFAULT_TRIGGER_KEY.to_string(),
        output_key: DEFAULT_OUTPUT_KEY.to_string(),
        interval_ms: DEFAULT_INTERVAL_MS,
        pass_through: false,
        enabled: true,
        delivery: Delivery::default(),
    }
}
