//! Key state behind the event tap
//!
//! Tracks held keys, key blocks, per-key hooks and global hotkeys, and
//! decides for each physical event whether it is suppressed. Hook callbacks
//! always run outside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::keys::{self, Hotkey, KeyCode, ModifierState};
use super::KeyCallback;

#[derive(Default)]
struct TrackerState {
    held: HashSet<KeyCode>,
    /// Block count per key; a key is suppressed while its count is non-zero
    blocked: HashMap<KeyCode, usize>,
    press_hooks: HashMap<u64, (KeyCode, KeyCallback)>,
    release_hooks: HashMap<u64, (KeyCode, KeyCallback)>,
    hotkeys: HashMap<u64, (Hotkey, KeyCallback)>,
}

impl TrackerState {
    fn release_callbacks(&self, code: KeyCode) -> Vec<KeyCallback> {
        self.release_hooks
            .values()
            .filter(|(key, _)| *key == code)
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }
}

pub(super) struct KeyTracker {
    state: Mutex<TrackerState>,
    next_id: AtomicU64,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_held(&self, code: KeyCode) -> bool {
        self.state.lock().held.contains(&code)
    }

    pub fn block(&self, code: KeyCode) {
        *self.state.lock().blocked.entry(code).or_insert(0) += 1;
    }

    pub fn unblock(&self, code: KeyCode) {
        let mut state = self.state.lock();
        if let Some(count) = state.blocked.get_mut(&code) {
            *count -= 1;
            if *count == 0 {
                state.blocked.remove(&code);
            }
        }
    }

    pub fn add_press_hook(&self, code: KeyCode, callback: KeyCallback) -> u64 {
        let id = self.next_id();
        self.state.lock().press_hooks.insert(id, (code, callback));
        id
    }

    pub fn add_release_hook(&self, code: KeyCode, callback: KeyCallback) -> u64 {
        let id = self.next_id();
        self.state.lock().release_hooks.insert(id, (code, callback));
        id
    }

    pub fn remove_hook(&self, id: u64) {
        let mut state = self.state.lock();
        state.press_hooks.remove(&id);
        state.release_hooks.remove(&id);
    }

    pub fn add_hotkey(&self, hotkey: Hotkey, callback: KeyCallback) -> u64 {
        let id = self.next_id();
        self.state.lock().hotkeys.insert(id, (hotkey, callback));
        id
    }

    pub fn remove_hotkey(&self, id: u64) {
        self.state.lock().hotkeys.remove(&id);
    }

    /// Returns true when the event must be dropped
    pub fn key_down(&self, code: KeyCode, autorepeat: bool, modifiers: ModifierState) -> bool {
        let callbacks: Vec<KeyCallback> = {
            let mut state = self.state.lock();
            state.held.insert(code);
            let hotkeys = state
                .hotkeys
                .values()
                .filter(|(hotkey, _)| !autorepeat && hotkey.matches(code, modifiers))
                .map(|(_, cb)| Arc::clone(cb));
            let presses = state
                .press_hooks
                .values()
                .filter(|(key, _)| !autorepeat && *key == code)
                .map(|(_, cb)| Arc::clone(cb));
            hotkeys.chain(presses).collect()
        };

        for callback in callbacks {
            callback();
        }

        // Decided after the hooks ran so a block installed by a press hook
        // already applies to this first down event.
        self.state.lock().blocked.contains_key(&code)
    }

    pub fn key_up(&self, code: KeyCode) -> bool {
        let (suppress, callbacks) = {
            let mut state = self.state.lock();
            state.held.remove(&code);
            (state.blocked.contains_key(&code), state.release_callbacks(code))
        };

        for callback in callbacks {
            callback();
        }

        suppress
    }

    /// A modifier key changed. Its flag being clear means released; with the
    /// flag set the key toggles, since the other side may still hold it.
    pub fn flags_changed(&self, code: KeyCode, modifiers: ModifierState) -> bool {
        let Some(modifier) = keys::modifier_of(code) else {
            return false;
        };
        if modifiers.has(modifier) && !self.is_held(code) {
            self.key_down(code, false, modifiers)
        } else {
            self.key_up(code)
        }
    }

    /// Forget every held key and report each one as released. Used when
    /// the event stream had a gap and key ups may have been lost.
    pub fn reset_held(&self) -> usize {
        let (released, callbacks) = {
            let mut state = self.state.lock();
            let held: Vec<KeyCode> = state.held.drain().collect();
            let callbacks: Vec<KeyCallback> = held
                .iter()
                .flat_map(|code| state.release_callbacks(*code))
                .collect();
            (held.len(), callbacks)
        };

        for callback in callbacks {
            callback();
        }

        released
    }
}
