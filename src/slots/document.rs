//! Binding file: an ordered slot list plus non-functional metadata

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::slot::{Slot, SlotId, SlotRecord};
use super::validate::{default_slot, validate_slot, SlotError};
use crate::backend::InputBackend;

pub const DEFAULT_LANGUAGE: &str = "en";

/// A validated set of slots as loaded from the binding file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSet {
    slots: Vec<Slot>,
    language: String,
}

impl Default for BindingSet {
    fn default() -> Self {
        Self {
            slots: vec![default_slot(1)],
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

/// Two enabled slots sharing a trigger key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConflict {
    pub trigger: String,
    pub kept: SlotId,
    pub skipped: SlotId,
}

#[derive(Serialize)]
struct Document<'a> {
    slots: Vec<SlotRecord>,
    language: &'a str,
}

impl BindingSet {
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(|slot| slot.enabled())
    }

    /// Same bindings, ignoring metadata such as the language
    pub fn same_bindings(&self, other: &BindingSet) -> bool {
        self.slots == other.slots
    }

    /// e.g. `AutoFire: 2/3 slots enabled`
    pub fn summary(&self) -> String {
        format!(
            "AutoFire: {}/{} slots enabled",
            self.enabled().count(),
            self.slots.len()
        )
    }

    /// Enabled slots whose trigger is already taken by an earlier enabled slot
    pub fn conflicts(&self) -> Vec<TriggerConflict> {
        let mut owners: HashMap<&str, &SlotId> = HashMap::new();
        let mut conflicts = Vec::new();
        for slot in self.enabled() {
            match owners.get(slot.trigger_key()) {
                Some(kept) if *kept != slot.id() => conflicts.push(TriggerConflict {
                    trigger: slot.trigger_key().to_string(),
                    kept: (*kept).clone(),
                    skipped: slot.id().clone(),
                }),
                Some(_) => {}
                None => {
                    owners.insert(slot.trigger_key(), slot.id());
                }
            }
        }
        conflicts
    }

    /// Build from a parsed JSON document.
    ///
    /// Accepts `{"slots": [...]}`, the legacy single-slot form with the slot
    /// fields at the root, and falls back to one default slot when the list
    /// is empty or missing.
    pub fn from_value(root: &Value, backend: &dyn InputBackend) -> Result<Self, SlotError> {
        let map = root
            .as_object()
            .ok_or_else(|| SlotError::Malformed("config root must be an object".to_string()))?;

        let language = match map.get("language").or_else(|| map.get("locale")) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => DEFAULT_LANGUAGE.to_string(),
        };

        let slots = match map.get("slots") {
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    validate_slot(item, i + 1, backend).map_err(|e| SlotError::InSlot {
                        position: i + 1,
                        source: Box::new(e),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None | Some(Value::Null) => {
                if map.contains_key("triggerKey") || map.contains_key("trigger_key") {
                    debug!("legacy single-slot binding file");
                    vec![validate_slot(root, 1, backend)?]
                } else {
                    Vec::new()
                }
            }
            Some(other) => {
                return Err(SlotError::Malformed(format!(
                    "slots must be a list, got {}",
                    other
                )))
            }
        };

        if slots.is_empty() {
            return Ok(Self {
                language,
                ..Self::default()
            });
        }
        Ok(Self { slots, language })
    }

    pub fn from_json_str(text: &str, backend: &dyn InputBackend) -> Result<Self, SlotError> {
        let root: Value = serde_json::from_str(text)?;
        Self::from_value(&root, backend)
    }

    /// Load from disk; a missing file yields the default set
    pub fn load(path: &Path, backend: &dyn InputBackend) -> Result<Self, SlotError> {
        if !path.exists() {
            debug!(?path, "binding file missing, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| SlotError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text, backend)
    }

    pub fn to_json(&self) -> Result<String, SlotError> {
        let document = Document {
            slots: self.slots.iter().map(Slot::to_record).collect(),
            language: &self.language,
        };
        let mut text = serde_json::to_string_pretty(&document)?;
        text.push('\n');
        Ok(text)
    }

    /// Write the set, replacing the file in one rename
    pub fn save(&self, path: &Path) -> Result<(), SlotError> {
        let io_err = |source| SlotError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, self.to_json()?).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        debug!(?path, slots = self.slots.len(), "binding file saved");
        Ok(())
    }
}
