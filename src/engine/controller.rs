//! Engine controller
//!
//! Owns every registered slot, its press/release hooks and its runner, plus
//! the process-wide emergency hotkey. All mutations go through one lock;
//! backend callbacks reach the controller through a weak reference so a
//! dropped engine never receives late hook deliveries.
//!
//! Nothing waits for a loop thread while holding the lock. Runners are
//! halted in place under the lock; `apply`, `unregister` and `clear` join
//! them after unlocking, while hook callbacks, which run on the backend's
//! event thread, hand them to the reaper thread instead.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::runner::{Clock, Suppression, SystemClock, TriggerLoopRunner, JOIN_TIMEOUT_MS};
use super::EngineError;
use crate::backend::{HookHandle, HotkeyHandle, InputBackend};
use crate::events::{publish, EngineEvent, EventSender};
use crate::slots::{BindingSet, Slot, SlotId};

/// Stops every armed loop regardless of focus
pub const EMERGENCY_HOTKEY: &str = "ctrl+alt+esc";

/// Tunables for [`Engine`]
#[derive(Clone)]
pub struct EngineOptions {
    pub clock: Arc<dyn Clock>,
    /// Upper bound on waiting for a loop thread to finish
    pub join_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            join_timeout: Duration::from_millis(JOIN_TIMEOUT_MS),
        }
    }
}

/// A slot that `apply` could not register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSlot {
    pub slot_id: SlotId,
    pub trigger: String,
    pub reason: String,
}

/// Outcome of a successful `apply`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub registered: Vec<SlotId>,
    pub skipped: Vec<SkippedSlot>,
}

struct Registration {
    slot: Arc<Slot>,
    press_hook: HookHandle,
    release_hook: HookHandle,
    runner: Option<TriggerLoopRunner>,
}

impl Registration {
    fn is_armed(&self) -> bool {
        self.runner.as_ref().is_some_and(TriggerLoopRunner::is_armed)
    }
}

#[derive(Default)]
struct EngineState {
    /// Last applied slot list, disabled slots included
    active: Vec<Slot>,
    /// Keyed by normalized trigger key
    registrations: HashMap<String, Registration>,
    emergency: Option<HotkeyHandle>,
}

struct Inner {
    backend: Arc<dyn InputBackend>,
    events: EventSender,
    options: EngineOptions,
    state: Mutex<EngineState>,
    /// `None` if the reaper thread could not be spawned
    reaper: Option<Mutex<mpsc::Sender<TriggerLoopRunner>>>,
}

/// Wait for halted runners, each bounded by its join timeout
fn join_all(runners: impl IntoIterator<Item = TriggerLoopRunner>) {
    for mut runner in runners {
        runner.stop();
    }
}

/// Joins halted runners until every sender is gone
fn spawn_reaper() -> Option<mpsc::Sender<TriggerLoopRunner>> {
    let (tx, rx) = mpsc::channel::<TriggerLoopRunner>();
    let spawned = thread::Builder::new()
        .name("autofire-reaper".to_string())
        .spawn(move || {
            join_all(rx);
            trace!("reaper stopped");
        });
    match spawned {
        Ok(_) => Some(tx),
        Err(e) => {
            warn!(%e, "failed to spawn reaper thread, loops are joined inline");
            None
        }
    }
}

/// Multi-slot autofire engine
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(backend: Arc<dyn InputBackend>, events: EventSender) -> Self {
        Self::with_options(backend, events, EngineOptions::default())
    }

    pub fn with_options(
        backend: Arc<dyn InputBackend>,
        events: EventSender,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                events,
                options,
                state: Mutex::new(EngineState::default()),
                reaper: spawn_reaper().map(Mutex::new),
            }),
        }
    }

    pub fn backend(&self) -> Arc<dyn InputBackend> {
        Arc::clone(&self.inner.backend)
    }

    pub fn events(&self) -> EventSender {
        self.inner.events.clone()
    }

    /// Replace the registered slots with `set`.
    ///
    /// Conflicting or refused slots are skipped with a warning. If none of
    /// the enabled slots can be registered the previous set is restored and
    /// the call fails.
    pub fn apply(&self, set: &BindingSet) -> Result<ApplyReport, EngineError> {
        let mut state = self.inner.state.lock();
        let previous = std::mem::take(&mut state.active);
        let mut halted = self.inner.unregister_all(&mut state);

        let result = match self.inner.register_all(&mut state, set.slots()) {
            Ok(report) => {
                state.active = set.slots().to_vec();
                info!(
                    registered = report.registered.len(),
                    skipped = report.skipped.len(),
                    total = set.slots().len(),
                    "bindings applied"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(%err, "new bindings unusable, restoring previous set");
                halted.extend(self.inner.unregister_all(&mut state));
                if let Err(restore_err) = self.inner.register_all(&mut state, &previous) {
                    error!(%restore_err, "failed to restore previous bindings");
                }
                state.active = previous;
                Err(err)
            }
        };

        drop(state);
        join_all(halted);
        result
    }

    /// Register one slot. Disabled slots and an already registered slot are
    /// no-ops; another slot holding the same trigger is a conflict.
    pub fn register(&self, slot: &Slot) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock();
        self.inner.register_locked(&mut state, slot)?;
        if slot.enabled() && !state.active.iter().any(|s| s.id() == slot.id()) {
            state.active.push(slot.clone());
        }
        Ok(())
    }

    /// Stop and remove one slot. Returns false if it was not registered.
    pub fn unregister(&self, slot: &Slot) -> bool {
        let mut state = self.inner.state.lock();
        let owned = state
            .registrations
            .get(slot.trigger_key())
            .is_some_and(|reg| reg.slot.id() == slot.id());
        if !owned {
            return false;
        }
        let halted = state
            .registrations
            .remove(slot.trigger_key())
            .and_then(|reg| self.inner.teardown(reg));
        state.active.retain(|s| s.id() != slot.id());

        drop(state);
        join_all(halted);
        true
    }

    /// Unregister everything, the emergency hotkey included
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let halted = self.inner.unregister_all(&mut state);
        if let Some(handle) = state.emergency.take() {
            if let Err(e) = self.inner.backend.remove_global_hotkey(handle) {
                warn!(%e, "failed to remove emergency hotkey");
            }
        }
        state.active.clear();

        drop(state);
        join_all(halted);
        debug!("engine cleared");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .registrations
            .values()
            .any(Registration::is_armed)
    }

    /// Triggers whose loop is currently armed, sorted
    pub fn armed_triggers(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut armed: Vec<String> = state
            .registrations
            .iter()
            .filter(|(_, reg)| reg.is_armed())
            .map(|(trigger, _)| trigger.clone())
            .collect();
        armed.sort();
        armed
    }

    pub fn active_slots(&self) -> Vec<Slot> {
        self.inner.state.lock().active.clone()
    }

    /// e.g. `AutoFire: 2/3 slots enabled`
    pub fn status_line(&self) -> String {
        let state = self.inner.state.lock();
        format!(
            "AutoFire: {}/{} slots enabled",
            state.active.iter().filter(|s| s.enabled()).count(),
            state.active.len()
        )
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.clear();
    }
}

impl Inner {
    fn register_all(
        self: &Arc<Self>,
        state: &mut EngineState,
        slots: &[Slot],
    ) -> Result<ApplyReport, EngineError> {
        let mut report = ApplyReport::default();
        let mut attempted = 0;
        let mut last_error = None;

        for slot in slots.iter().filter(|s| s.enabled()) {
            attempted += 1;
            match self.register_locked(state, slot) {
                Ok(()) => report.registered.push(slot.id().clone()),
                Err(err) => {
                    warn!(slot = %slot.id(), trigger = slot.trigger_key(), %err, "slot skipped");
                    publish(
                        &self.events,
                        EngineEvent::SlotSkipped {
                            slot_id: slot.id().to_string(),
                            trigger: slot.trigger_key().to_string(),
                            reason: err.to_string(),
                        },
                    );
                    report.skipped.push(SkippedSlot {
                        slot_id: slot.id().clone(),
                        trigger: slot.trigger_key().to_string(),
                        reason: err.to_string(),
                    });
                    last_error = Some(err);
                }
            }
        }

        if attempted > 0 && report.registered.is_empty() {
            return Err(EngineError::NoBindings {
                attempted,
                last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
            });
        }
        Ok(report)
    }

    fn register_locked(self: &Arc<Self>, state: &mut EngineState, slot: &Slot) -> Result<(), EngineError> {
        if !slot.enabled() {
            debug!(slot = %slot.id(), "slot disabled, not registering");
            return Ok(());
        }
        let trigger = slot.trigger_key().to_string();
        if let Some(existing) = state.registrations.get(&trigger) {
            if existing.slot.id() == slot.id() {
                return Ok(());
            }
            return Err(EngineError::Conflict {
                trigger,
                existing: existing.slot.id().to_string(),
                incoming: slot.id().to_string(),
            });
        }

        let weak = Arc::downgrade(self);
        let key = trigger.clone();
        let press_hook = self.backend.on_press(
            &trigger,
            Arc::new(move || {
                if let Some(inner) = Weak::upgrade(&weak) {
                    inner.handle_press(&key);
                }
            }),
        )?;

        let weak = Arc::downgrade(self);
        let key = trigger.clone();
        let release_hook = match self.backend.on_release(
            &trigger,
            Arc::new(move || {
                if let Some(inner) = Weak::upgrade(&weak) {
                    inner.handle_release(&key);
                }
            }),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(unhook_err) = self.backend.unhook(press_hook) {
                    warn!(trigger = %trigger, %unhook_err, "failed to roll back press hook");
                }
                return Err(e.into());
            }
        };

        info!(slot = %slot.id(), binding = %slot.describe(), "slot registered");
        state.registrations.insert(
            trigger,
            Registration {
                slot: Arc::new(slot.clone()),
                press_hook,
                release_hook,
                runner: None,
            },
        );
        self.ensure_emergency_hotkey(state);
        Ok(())
    }

    fn ensure_emergency_hotkey(self: &Arc<Self>, state: &mut EngineState) {
        if state.emergency.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let callback = Arc::new(move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.stop_all();
            }
        });
        match self.backend.add_global_hotkey(EMERGENCY_HOTKEY, callback) {
            Ok(handle) => {
                debug!(combo = EMERGENCY_HOTKEY, "emergency hotkey registered");
                state.emergency = Some(handle);
            }
            Err(e) => {
                warn!(combo = EMERGENCY_HOTKEY, %e, "emergency hotkey unavailable");
                publish(
                    &self.events,
                    EngineEvent::EmergencyHotkeyUnavailable {
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    /// Disarm now, join later off the calling thread
    fn retire(&self, mut runner: TriggerLoopRunner) {
        runner.halt();
        let mut runner = match &self.reaper {
            Some(reaper) => match reaper.lock().send(runner) {
                Ok(()) => return,
                Err(mpsc::SendError(runner)) => runner,
            },
            None => runner,
        };
        runner.stop();
    }

    /// Unhook a slot and halt its runner. The runner is returned so the
    /// caller can join it once the lock is released.
    fn teardown(&self, reg: Registration) -> Option<TriggerLoopRunner> {
        for handle in [reg.press_hook, reg.release_hook] {
            if let Err(e) = self.backend.unhook(handle) {
                warn!(trigger = reg.slot.trigger_key(), %e, "failed to remove hook");
            }
        }
        debug!(slot = %reg.slot.id(), "slot unregistered");
        reg.runner.map(|mut runner| {
            runner.halt();
            runner
        })
    }

    fn unregister_all(&self, state: &mut EngineState) -> Vec<TriggerLoopRunner> {
        state
            .registrations
            .drain()
            .filter_map(|(_, reg)| self.teardown(reg))
            .collect()
    }

    fn handle_press(&self, trigger: &str) {
        let mut state = self.state.lock();
        let Some(reg) = state.registrations.get_mut(trigger) else {
            return;
        };
        if reg.is_armed() {
            trace!(trigger, "already armed");
            return;
        }
        // A loop that ended on its own is collected before re-arming
        if let Some(finished) = reg.runner.take() {
            self.retire(finished);
        }

        let mut runner = TriggerLoopRunner::new(
            Arc::clone(&reg.slot),
            Arc::clone(&self.backend),
            Arc::clone(&self.options.clock),
            self.events.clone(),
            self.options.join_timeout,
        );
        match runner.start() {
            Ok(Suppression::Unavailable) => {
                debug!(trigger, "armed without suppression");
                reg.runner = Some(runner);
            }
            Ok(suppression) => {
                trace!(trigger, ?suppression, "runner started");
                reg.runner = Some(runner);
            }
            Err(e) => error!(trigger, %e, "failed to arm loop"),
        }
    }

    fn handle_release(&self, trigger: &str) {
        let mut state = self.state.lock();
        if let Some(runner) = state
            .registrations
            .get_mut(trigger)
            .and_then(|reg| reg.runner.take())
        {
            self.retire(runner);
        }
    }

    /// Disarm every loop and release its trigger. Returns how many were armed.
    fn stop_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut stopped = 0;
        for (trigger, reg) in state.registrations.iter_mut() {
            let Some(runner) = reg.runner.take() else {
                continue;
            };
            let was_armed = runner.is_armed();
            self.retire(runner);
            if was_armed {
                stopped += 1;
                if let Err(e) = self.backend.release(trigger) {
                    warn!(trigger = %trigger, %e, "failed to release trigger");
                }
            }
        }
        warn!(stopped, "emergency stop");
        publish(&self.events, EngineEvent::EmergencyStop { stopped });
        stopped
    }
}
