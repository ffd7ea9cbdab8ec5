//! Input backend using a macOS CGEventTap
//!
//! Observes system-wide key down/up and modifier flag events and can drop
//! them for blocked keys. Runs on a dedicated thread with its own
//! CFRunLoop. Synthetic events are posted with a marker in the user-data
//! field so the tap lets its own output through untouched. If macOS
//! disables the tap it is re-enabled on the next run loop slice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use core_foundation::runloop::{kCFRunLoopCommonModes, kCFRunLoopDefaultMode, CFRunLoop};
use core_graphics::event::{
    CGEvent, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
    CGEventTapProxy, CGEventType, EventField,
};
use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};
use tracing::{debug, error, info, trace, warn};

use super::keys::{self, KeyCode, ModifierState};
use super::tracker::KeyTracker;
use super::{
    BackendError, Delivery, HookHandle, HotkeyHandle, InjectionMethod, InputBackend, KeyCallback,
};

/// Written to EVENT_SOURCE_USER_DATA on every event we post
const SYNTHETIC_MARKER: i64 = 0x4146_4952;

struct Shared {
    tracker: KeyTracker,
    running: AtomicBool,
    /// Set by the tap callback when macOS disabled the tap
    tap_disabled: AtomicBool,
}

/// Global input backend built on a Quartz event tap
pub struct EventTapBackend {
    shared: Arc<Shared>,
}

impl EventTapBackend {
    /// Spawn the tap thread and wait until the tap is installed
    pub fn start() -> Result<Self, BackendError> {
        let shared = Arc::new(Shared {
            tracker: KeyTracker::new(),
            running: AtomicBool::new(true),
            tap_disabled: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), BackendError>>();
        let thread_shared = Arc::clone(&shared);

        thread::Builder::new()
            .name("input-tap".to_string())
            .spawn(move || {
                info!("input tap thread started");

                if let Err(e) = run_event_loop(Arc::clone(&thread_shared), &ready_tx) {
                    error!(?e, "input tap error");
                    let _ = ready_tx.send(Err(e));
                }

                thread_shared.running.store(false, Ordering::SeqCst);
                info!("input tap thread stopped");
            })
            .map_err(|e| BackendError::ThreadSpawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { shared }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::EventTapCreation),
        }
    }

    fn code(key: &str) -> Result<KeyCode, BackendError> {
        keys::key_code(key).ok_or_else(|| BackendError::UnknownKey(key.to_string()))
    }
}

impl Drop for EventTapBackend {
    fn drop(&mut self) {
        // The run loop notices on its next 100ms slice
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

fn tap_location(method: InjectionMethod) -> CGEventTapLocation {
    match method {
        InjectionMethod::Hardware => CGEventTapLocation::HID,
        InjectionMethod::Message => CGEventTapLocation::Session,
    }
}

fn post_key(code: KeyCode, down: bool, method: InjectionMethod) -> Result<(), String> {
    let source = CGEventSource::new(CGEventSourceStateID::HIDSystemState)
        .map_err(|_| "failed to create event source".to_string())?;
    let event = CGEvent::new_keyboard_event(source, code, down)
        .map_err(|_| "failed to create keyboard event".to_string())?;
    event.set_integer_value_field(EventField::EVENT_SOURCE_USER_DATA, SYNTHETIC_MARKER);
    event.post(tap_location(method));
    Ok(())
}

impl InputBackend for EventTapBackend {
    fn validate_key_name(&self, name: &str) -> bool {
        keys::key_code(name).is_some()
    }

    fn is_pressed(&self, key: &str) -> bool {
        match keys::key_code(key) {
            Some(code) => self.shared.tracker.is_held(code),
            None => false,
        }
    }

    fn press_and_release(&self, key: &str, delivery: &Delivery) -> Result<(), BackendError> {
        let code = Self::code(key)?;
        if let Some(window) = &delivery.target_window {
            trace!(key, window = %window, "window targeting not supported, posting globally");
        }
        let emit_err = |reason: String| BackendError::Emit {
            key: key.to_string(),
            reason,
        };
        post_key(code, true, delivery.method).map_err(emit_err)?;
        post_key(code, false, delivery.method).map_err(emit_err)
    }

    fn release(&self, key: &str) -> Result<(), BackendError> {
        let code = Self::code(key)?;
        post_key(code, false, InjectionMethod::Hardware).map_err(|reason| BackendError::Emit {
            key: key.to_string(),
            reason,
        })
    }

    fn block_key(&self, key: &str) -> Result<(), BackendError> {
        let code = Self::code(key)?;
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(BackendError::Block {
                key: key.to_string(),
                reason: "event tap is not running".to_string(),
            });
        }
        self.shared.tracker.block(code);
        debug!(key, "key blocked");
        Ok(())
    }

    fn unblock_key(&self, key: &str) -> Result<(), BackendError> {
        let code = Self::code(key)?;
        self.shared.tracker.unblock(code);
        debug!(key, "key unblocked");
        Ok(())
    }

    fn on_press(&self, key: &str, callback: KeyCallback) -> Result<HookHandle, BackendError> {
        let code = Self::code(key)?;
        Ok(HookHandle(self.shared.tracker.add_press_hook(code, callback)))
    }

    fn on_release(&self, key: &str, callback: KeyCallback) -> Result<HookHandle, BackendError> {
        let code = Self::code(key)?;
        Ok(HookHandle(self.shared.tracker.add_release_hook(code, callback)))
    }

    fn unhook(&self, handle: HookHandle) -> Result<(), BackendError> {
        self.shared.tracker.remove_hook(handle.0);
        Ok(())
    }

    fn add_global_hotkey(
        &self,
        combo: &str,
        callback: KeyCallback,
    ) -> Result<HotkeyHandle, BackendError> {
        let hotkey = keys::parse_hotkey(combo)?;
        let id = self.shared.tracker.add_hotkey(hotkey, callback);
        info!(combo, "global hotkey registered");
        Ok(HotkeyHandle(id))
    }

    fn remove_global_hotkey(&self, handle: HotkeyHandle) -> Result<(), BackendError> {
        self.shared.tracker.remove_hotkey(handle.0);
        Ok(())
    }
}

/// Run the CFRunLoop with the event tap until the backend is dropped
fn run_event_loop(
    shared: Arc<Shared>,
    ready_tx: &mpsc::Sender<Result<(), BackendError>>,
) -> Result<(), BackendError> {
    let tap_shared = Arc::clone(&shared);

    // Runs on the tap thread; must stay short or macOS disables the tap
    let callback = move |_proxy: CGEventTapProxy,
                         event_type: CGEventType,
                         event: &CGEvent|
          -> Option<CGEvent> {
        match event_type {
            CGEventType::KeyDown | CGEventType::KeyUp | CGEventType::FlagsChanged => {}
            CGEventType::TapDisabledByTimeout | CGEventType::TapDisabledByUserInput => {
                // Key ups may have been lost while disabled
                tap_shared.tap_disabled.store(true, Ordering::SeqCst);
                let released = tap_shared.tracker.reset_held();
                warn!(released, "event tap disabled, held keys reset");
                return Some(event.clone());
            }
            _ => return Some(event.clone()),
        }

        if event.get_integer_value_field(EventField::EVENT_SOURCE_USER_DATA) == SYNTHETIC_MARKER {
            return Some(event.clone());
        }

        let code = event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE) as KeyCode;
        let modifiers = ModifierState::from_flags(event.get_flags());
        let suppress = match event_type {
            CGEventType::KeyDown => {
                let autorepeat =
                    event.get_integer_value_field(EventField::KEYBOARD_EVENT_AUTOREPEAT) != 0;
                tap_shared.tracker.key_down(code, autorepeat, modifiers)
            }
            CGEventType::FlagsChanged => tap_shared.tracker.flags_changed(code, modifiers),
            _ => tap_shared.tracker.key_up(code),
        };

        if suppress {
            None
        } else {
            Some(event.clone())
        }
    };

    let tap = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::Default,
        vec![
            CGEventType::KeyDown,
            CGEventType::KeyUp,
            CGEventType::FlagsChanged,
        ],
        callback,
    )
    .map_err(|_| {
        error!("failed to create event tap - is Accessibility permission granted?");
        BackendError::EventTapCreation
    })?;

    tap.enable();

    let run_loop_source = tap
        .mach_port
        .create_runloop_source(0)
        .map_err(|_| BackendError::EventTapCreation)?;
    let run_loop = CFRunLoop::get_current();

    unsafe {
        run_loop.add_source(&run_loop_source, kCFRunLoopCommonModes);
    }

    info!("event tap created and enabled");
    let _ = ready_tx.send(Ok(()));

    while shared.running.load(Ordering::SeqCst) {
        unsafe {
            CFRunLoop::run_in_mode(kCFRunLoopDefaultMode, Duration::from_millis(100), true);
        }
        if shared.tap_disabled.swap(false, Ordering::SeqCst) {
            tap.enable();
            warn!("event tap re-enabled");
        }
    }

    Ok(())
}
