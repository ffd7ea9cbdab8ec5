//! Input backend capability
//!
//! The engine never touches the OS directly. Everything it needs from the
//! host (key state, injection, suppression, global hooks) goes through the
//! [`InputBackend`] trait so the platform hook and the test double are
//! interchangeable.

pub mod keys;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(test)]
pub mod mock;
#[cfg(any(target_os = "macos", test))]
mod tracker;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Callback invoked by a backend when a hooked key or hotkey fires
pub type KeyCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle for a per-key press or release hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(pub u64);

/// Handle for a registered global hotkey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HotkeyHandle(pub u64);

/// How synthetic key events are delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMethod {
    /// Inject at the hardware level, seen by every application
    #[default]
    Hardware,
    /// Post to the session / target window
    Message,
}

/// Delivery attributes of a slot, passed through to the backend untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Target window title; `None` means global
    pub target_window: Option<String>,
    /// Injection method
    pub method: InjectionMethod,
}

/// Errors reported by an input backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("unknown key '{0}'")]
    UnknownKey(String),

    #[error("invalid hotkey combination '{0}'")]
    InvalidHotkey(String),

    #[error("failed to register hook for '{key}': {reason}")]
    Hook { key: String, reason: String },

    #[error("failed to block '{key}': {reason}")]
    Block { key: String, reason: String },

    #[error("failed to emit '{key}': {reason}")]
    Emit { key: String, reason: String },

    #[cfg(target_os = "macos")]
    #[error("failed to create event tap - check Accessibility permissions")]
    EventTapCreation,

    #[cfg(target_os = "macos")]
    #[error("failed to spawn input thread: {0}")]
    ThreadSpawn(String),

    #[error("no input backend available on this platform: {0}")]
    Unsupported(String),
}

/// Host input capability consumed by the engine.
///
/// Implementations must be callable from any thread and must never invoke a
/// hook callback synchronously from inside one of these methods; callbacks
/// arrive from the backend's own event thread.
pub trait InputBackend: Send + Sync {
    /// True if `name` maps to a physical key
    fn validate_key_name(&self, name: &str) -> bool;

    /// Current physical state of `key`
    fn is_pressed(&self, key: &str) -> bool;

    /// Emit one synthetic down/up pulse of `key`
    fn press_and_release(&self, key: &str, delivery: &Delivery) -> Result<(), BackendError>;

    /// Emit a synthetic key up for `key` to clear stuck state
    fn release(&self, key: &str) -> Result<(), BackendError>;

    /// Suppress physical events of `key` from reaching other applications
    fn block_key(&self, key: &str) -> Result<(), BackendError>;

    /// Undo one [`InputBackend::block_key`]
    fn unblock_key(&self, key: &str) -> Result<(), BackendError>;

    /// Observe physical presses of `key`
    fn on_press(&self, key: &str, callback: KeyCallback) -> Result<HookHandle, BackendError>;

    /// Observe physical releases of `key`
    fn on_release(&self, key: &str, callback: KeyCallback) -> Result<HookHandle, BackendError>;

    /// Remove a press or release hook
    fn unhook(&self, handle: HookHandle) -> Result<(), BackendError>;

    /// Register a global key combination such as `ctrl+alt+esc`
    fn add_global_hotkey(
        &self,
        combo: &str,
        callback: KeyCallback,
    ) -> Result<HotkeyHandle, BackendError>;

    /// Remove a global key combination
    fn remove_global_hotkey(&self, handle: HotkeyHandle) -> Result<(), BackendError>;
}

/// Start the input backend for the current platform
#[cfg(target_os = "macos")]
pub fn connect() -> Result<Arc<dyn InputBackend>, BackendError> {
    let backend = macos::EventTapBackend::start()?;
    Ok(Arc::new(backend))
}

/// Start the input backend for the current platform
#[cfg(not(target_os = "macos"))]
pub fn connect() -> Result<Arc<dyn InputBackend>, BackendError> {
    Err(BackendError::Unsupported(std::env::consts::OS.to_string()))
}
