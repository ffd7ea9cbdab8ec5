//! Recording in-memory backend for tests
//!
//! Simulated key presses run hooks on the calling (test) thread, never from
//! inside a backend call, matching the contract real backends follow.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::keys;
use super::{BackendError, Delivery, HookHandle, HotkeyHandle, InputBackend, KeyCallback};

/// A backend call as recorded by [`MockBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Emit(String),
    Release(String),
    Block(String),
    Unblock(String),
    OnPress(String),
    OnRelease(String),
    Unhook(u64),
    AddHotkey(String),
    RemoveHotkey(u64),
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    emitted_at: Vec<(String, Instant)>,
    held: HashSet<String>,
    blocked: HashMap<String, usize>,
    press_hooks: HashMap<u64, (String, KeyCallback)>,
    release_hooks: HashMap<u64, (String, KeyCallback)>,
    hotkeys: HashMap<u64, (String, KeyCallback)>,
    /// Trigger down/up events that reached other applications
    passed_through: Vec<(String, bool)>,
    fail_block: HashSet<String>,
    fail_hook: HashSet<String>,
    fail_emit: HashSet<String>,
    fail_hotkey: bool,
    emit_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Simulate a physical key down
    pub fn key_down(&self, key: &str) {
        let callbacks: Vec<KeyCallback> = {
            let mut state = self.state.lock();
            state.held.insert(key.to_string());
            state
                .press_hooks
                .values()
                .filter(|(k, _)| k == key)
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for cb in callbacks {
            cb();
        }
        let mut state = self.state.lock();
        if !state.blocked.contains_key(key) {
            state.passed_through.push((key.to_string(), true));
        }
    }

    /// Simulate a physical key up
    pub fn key_up(&self, key: &str) {
        let callbacks: Vec<KeyCallback> = {
            let mut state = self.state.lock();
            state.held.remove(key);
            if !state.blocked.contains_key(key) {
                state.passed_through.push((key.to_string(), false));
            }
            state
                .release_hooks
                .values()
                .filter(|(k, _)| k == key)
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for cb in callbacks {
            cb();
        }
    }

    /// Flip the physical state without delivering any hook (backend desync)
    pub fn set_held(&self, key: &str, held: bool) {
        let mut state = self.state.lock();
        if held {
            state.held.insert(key.to_string());
        } else {
            state.held.remove(key);
        }
    }

    /// Fire every hotkey registered for `combo`
    pub fn fire_hotkey(&self, combo: &str) {
        let callbacks: Vec<KeyCallback> = self
            .state
            .lock()
            .hotkeys
            .values()
            .filter(|(c, _)| c == combo)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb();
        }
    }

    pub fn fail_block(&self, key: &str) {
        self.state.lock().fail_block.insert(key.to_string());
    }

    pub fn fail_hook(&self, key: &str) {
        self.state.lock().fail_hook.insert(key.to_string());
    }

    pub fn fail_emit(&self, key: &str) {
        self.state.lock().fail_emit.insert(key.to_string());
    }

    /// Make every emit take `delay` before it is recorded
    pub fn slow_emit(&self, delay: Duration) {
        self.state.lock().emit_delay = Some(delay);
    }

    pub fn fail_hotkey(&self) {
        self.state.lock().fail_hotkey = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn emitted(&self, key: &str) -> usize {
        self.count(&Call::Emit(key.to_string()))
    }

    /// Instants at which `key` was emitted
    pub fn emit_times(&self, key: &str) -> Vec<Instant> {
        self.state
            .lock()
            .emitted_at
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.state.lock().blocked.contains_key(key)
    }

    pub fn passed_through(&self, key: &str) -> Vec<bool> {
        self.state
            .lock()
            .passed_through
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, down)| *down)
            .collect()
    }

    pub fn hook_count(&self) -> usize {
        let state = self.state.lock();
        state.press_hooks.len() + state.release_hooks.len()
    }

    pub fn hotkey_count(&self) -> usize {
        self.state.lock().hotkeys.len()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.emitted_at.clear();
    }
}

impl InputBackend for MockBackend {
    fn validate_key_name(&self, name: &str) -> bool {
        keys::key_code(name).is_some()
    }

    fn is_pressed(&self, key: &str) -> bool {
        self.state.lock().held.contains(key)
    }

    fn press_and_release(&self, key: &str, _delivery: &Delivery) -> Result<(), BackendError> {
        let delay = self.state.lock().emit_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock();
        if state.fail_emit.contains(key) {
            return Err(BackendError::Emit {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.calls.push(Call::Emit(key.to_string()));
        state.emitted_at.push((key.to_string(), Instant::now()));
        Ok(())
    }

    fn release(&self, key: &str) -> Result<(), BackendError> {
        self.state.lock().calls.push(Call::Release(key.to_string()));
        Ok(())
    }

    fn block_key(&self, key: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.fail_block.contains(key) {
            return Err(BackendError::Block {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.calls.push(Call::Block(key.to_string()));
        *state.blocked.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn unblock_key(&self, key: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Unblock(key.to_string()));
        if let Some(count) = state.blocked.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                state.blocked.remove(key);
            }
        }
        Ok(())
    }

    fn on_press(&self, key: &str, callback: KeyCallback) -> Result<HookHandle, BackendError> {
        let id = self.id();
        let mut state = self.state.lock();
        if state.fail_hook.contains(key) {
            return Err(BackendError::Hook {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.calls.push(Call::OnPress(key.to_string()));
        state.press_hooks.insert(id, (key.to_string(), callback));
        Ok(HookHandle(id))
    }

    fn on_release(&self, key: &str, callback: KeyCallback) -> Result<HookHandle, BackendError> {
        let id = self.id();
        let mut state = self.state.lock();
        if state.fail_hook.contains(key) {
            return Err(BackendError::Hook {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.calls.push(Call::OnRelease(key.to_string()));
        state.release_hooks.insert(id, (key.to_string(), callback));
        Ok(HookHandle(id))
    }

    fn unhook(&self, handle: HookHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Unhook(handle.0));
        state.press_hooks.remove(&handle.0);
        state.release_hooks.remove(&handle.0);
        Ok(())
    }

    fn add_global_hotkey(
        &self,
        combo: &str,
        callback: KeyCallback,
    ) -> Result<HotkeyHandle, BackendError> {
        keys::parse_hotkey(combo)?;
        let id = self.id();
        let mut state = self.state.lock();
        if state.fail_hotkey {
            return Err(BackendError::Hook {
                key: combo.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.calls.push(Call::AddHotkey(combo.to_string()));
        state.hotkeys.insert(id, (combo.to_string(), callback));
        Ok(HotkeyHandle(id))
    }

    fn remove_global_hotkey(&self, handle: HotkeyHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(Call::RemoveHotkey(handle.0));
        state.hotkeys.remove(&handle.0);
        Ok(())
    }
}

/// Poll `cond` every 2ms until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
