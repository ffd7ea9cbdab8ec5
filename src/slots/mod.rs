//! Slot data model, validation and the binding file
//!
//! A slot binds a trigger key to an output key with an interval and a
//! suppression mode. Slots only come into existence through validation, so
//! everything downstream can rely on their invariants.

mod document;
mod slot;
mod validate;

pub use document::{BindingSet, TriggerConflict};
pub use slot::{Slot, SlotId, SlotRecord};
pub use validate::{SlotError, MAX_INTERVAL_MS, MIN_INTERVAL_MS};
