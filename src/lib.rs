//! Trigger-loop autofire engine
//!
//! While a physical trigger key is held, the engine repeats an output key
//! at the slot's interval, optionally suppressing the trigger from other
//! applications. The daemon binary wires these pieces together:
//!
//! - [`backend`]: host input capability (CGEventTap on macOS)
//! - [`slots`]: slot validation and the binding file
//! - [`engine`]: one timed loop per held trigger plus the emergency stop
//! - [`reload`]: polls the binding file and re-applies it
//! - [`editor`]: line-oriented slot editor

pub mod backend;
pub mod config;
pub mod editor;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod reload;
pub mod slots;
