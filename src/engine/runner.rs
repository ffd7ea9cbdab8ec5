//! Trigger loop runner
//!
//! Idle -> Armed -> Idle for one trigger key. While armed a dedicated
//! thread emits the output key on a fixed schedule until the trigger is
//! released, a stop is requested or the backend fails. Whatever ends the
//! loop, the teardown guard clears the armed marker and gives back the key
//! block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::EngineError;
use crate::backend::{BackendError, InputBackend};
use crate::events::{publish, EngineEvent, EventSender};
use crate::slots::Slot;

/// Maximum time a stop waits for the loop thread before detaching it
pub const JOIN_TIMEOUT_MS: u64 = 500;

/// How far the schedule may fall behind before it is resynchronized
const CATCH_UP_INTERVALS: u32 = 5;

/// Cooperative stop flag whose waits wake as soon as it is set
#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    /// Block for up to `timeout`, returning early once set. Returns the flag.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped && !timeout.is_zero() {
            let _ = self.cv.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// Time source for the loop
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Sleep for `duration`, returning early if `stop` is set
    fn pause(&self, stop: &StopSignal, duration: Duration);
}

/// Wall clock with interruptible sleeps
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn pause(&self, stop: &StopSignal, duration: Duration) {
        stop.wait(duration);
    }
}

/// Why a loop ended
#[derive(Debug)]
pub(crate) enum LoopExit {
    Stopped,
    Released,
    EmitFailed(BackendError),
}

/// The timing loop body. Runs on the calling thread until it exits.
pub(crate) fn drive(
    slot: &Slot,
    backend: &dyn InputBackend,
    clock: &dyn Clock,
    stop: &StopSignal,
    pulses: &AtomicU64,
) -> LoopExit {
    let interval = Duration::from_millis(u64::from(slot.interval_ms().max(1)));
    let trigger = slot.trigger_key();
    let mut next_tick = clock.now();

    loop {
        if stop.is_set() {
            return LoopExit::Stopped;
        }
        // Catches releases the hook never reported
        if !backend.is_pressed(trigger) {
            return LoopExit::Released;
        }

        if clock.now() >= next_tick {
            if let Err(e) = backend.press_and_release(slot.output_key(), slot.delivery()) {
                return LoopExit::EmitFailed(e);
            }
            pulses.fetch_add(1, Ordering::Relaxed);
            next_tick += interval;

            let now = clock.now();
            if now.saturating_duration_since(next_tick) > interval * CATCH_UP_INTERVALS {
                trace!(trigger, "schedule stalled, resynchronizing");
                next_tick = now + interval;
            }
        }

        let wait = next_tick.saturating_duration_since(clock.now()).min(interval);
        clock.pause(stop, wait);
    }
}

struct Shared {
    stop: StopSignal,
    armed: AtomicBool,
    /// True while this runner owns a `block_key` on the trigger
    blocked: AtomicBool,
    pulses: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            stop: StopSignal::new(),
            armed: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            pulses: AtomicU64::new(0),
        }
    }

    /// Give back the block at most once, whichever side gets here first
    fn release_block(&self, backend: &dyn InputBackend, trigger: &str) {
        if self.blocked.swap(false, Ordering::SeqCst) {
            if let Err(e) = backend.unblock_key(trigger) {
                warn!(trigger, %e, "failed to unblock trigger");
            }
        }
    }
}

/// Runs in the loop thread on every exit route, panics included
struct Teardown {
    shared: Arc<Shared>,
    backend: Arc<dyn InputBackend>,
    events: EventSender,
    trigger: String,
    started: Instant,
    done_tx: mpsc::Sender<()>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.shared.stop.set();
        self.shared.armed.store(false, Ordering::SeqCst);
        self.shared.release_block(self.backend.as_ref(), &self.trigger);

        let duration_ms = self.started.elapsed().as_millis() as u64;
        let pulses = self.shared.pulses.load(Ordering::Relaxed);
        debug!(trigger = %self.trigger, duration_ms, pulses, "loop disarmed");
        publish(
            &self.events,
            EngineEvent::Disarmed {
                trigger: self.trigger.clone(),
                duration_ms,
                pulses,
            },
        );
        let _ = self.done_tx.send(());
    }
}

/// Outcome of suppression when a runner arms
#[derive(Debug)]
pub enum Suppression {
    /// Slot is pass-through
    NotRequested,
    /// Trigger is blocked while armed
    Active,
    /// Blocking failed; the trigger passes through while armed
    Unavailable,
}

/// Owns the timing loop for one armed slot
pub struct TriggerLoopRunner {
    slot: Arc<Slot>,
    backend: Arc<dyn InputBackend>,
    clock: Arc<dyn Clock>,
    events: EventSender,
    join_timeout: Duration,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    done_rx: Option<mpsc::Receiver<()>>,
}

impl TriggerLoopRunner {
    pub fn new(
        slot: Arc<Slot>,
        backend: Arc<dyn InputBackend>,
        clock: Arc<dyn Clock>,
        events: EventSender,
        join_timeout: Duration,
    ) -> Self {
        Self {
            slot,
            backend,
            clock,
            events,
            join_timeout,
            shared: Arc::new(Shared::new()),
            thread: None,
            done_rx: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.shared.armed.load(Ordering::SeqCst)
    }

    pub fn is_blocked(&self) -> bool {
        self.shared.blocked.load(Ordering::SeqCst)
    }

    /// Arm the loop. A no-op while already armed.
    pub fn start(&mut self) -> Result<Suppression, EngineError> {
        if self.is_armed() {
            return Ok(if self.is_blocked() {
                Suppression::Active
            } else {
                Suppression::NotRequested
            });
        }
        // Collect a previous loop that ended on its own
        if self.thread.is_some() {
            self.stop();
        }

        let trigger = self.slot.trigger_key().to_string();
        let shared = Arc::new(Shared::new());

        let suppression = if self.slot.pass_through() {
            Suppression::NotRequested
        } else {
            match self.backend.block_key(&trigger) {
                Ok(()) => {
                    shared.blocked.store(true, Ordering::SeqCst);
                    Suppression::Active
                }
                Err(e) => {
                    warn!(trigger = %trigger, %e, "suppression unavailable, trigger will pass through");
                    publish(
                        &self.events,
                        EngineEvent::SuppressionUnavailable {
                            trigger: trigger.clone(),
                            reason: e.to_string(),
                        },
                    );
                    Suppression::Unavailable
                }
            }
        };

        shared.armed.store(true, Ordering::SeqCst);
        let (done_tx, done_rx) = mpsc::channel();

        let teardown = Teardown {
            shared: Arc::clone(&shared),
            backend: Arc::clone(&self.backend),
            events: self.events.clone(),
            trigger: trigger.clone(),
            started: Instant::now(),
            done_tx,
        };
        let slot = Arc::clone(&self.slot);
        let backend = Arc::clone(&self.backend);
        let clock = Arc::clone(&self.clock);
        let events = self.events.clone();
        let thread_shared = Arc::clone(&shared);

        let spawned = thread::Builder::new()
            .name(format!("autofire-{}", trigger))
            .spawn(move || {
                let _teardown = teardown;
                let exit = drive(
                    &slot,
                    backend.as_ref(),
                    clock.as_ref(),
                    &thread_shared.stop,
                    &thread_shared.pulses,
                );
                match exit {
                    LoopExit::Stopped => trace!(trigger = slot.trigger_key(), "loop stopped"),
                    LoopExit::Released => debug!(trigger = slot.trigger_key(), "trigger released"),
                    LoopExit::EmitFailed(e) => {
                        error!(trigger = slot.trigger_key(), %e, "emit failed, stopping loop");
                        publish(
                            &events,
                            EngineEvent::EmitFailed {
                                trigger: slot.trigger_key().to_string(),
                                output: slot.output_key().to_string(),
                                reason: e.to_string(),
                            },
                        );
                    }
                }
            });

        // On spawn failure the closure (and its teardown guard) is dropped
        // here, which unblocks the trigger and clears the armed marker.
        let handle = spawned.map_err(|e| EngineError::Spawn {
            trigger: trigger.clone(),
            reason: e.to_string(),
        })?;

        self.shared = shared;
        self.thread = Some(handle);
        self.done_rx = Some(done_rx);

        info!(
            trigger = %trigger,
            output = self.slot.output_key(),
            interval_ms = self.slot.interval_ms(),
            pass_through = self.slot.pass_through(),
            "loop armed"
        );
        publish(
            &self.events,
            EngineEvent::Armed {
                trigger,
                output: self.slot.output_key().to_string(),
                interval_ms: self.slot.interval_ms(),
                pass_through: self.slot.pass_through(),
            },
        );
        Ok(suppression)
    }

    /// Disarm without waiting for the loop thread: the trigger is unblocked
    /// and the loop exits at its next check. [`stop`](Self::stop) still has
    /// to collect the thread.
    pub fn halt(&mut self) {
        self.shared.stop.set();
        self.shared.armed.store(false, Ordering::SeqCst);
        self.shared.release_block(self.backend.as_ref(), self.slot.trigger_key());
    }

    /// Disarm and wait up to the join timeout. Returns false if the thread
    /// had to be detached; key state is restored either way.
    pub fn stop(&mut self) -> bool {
        self.shared.stop.set();
        let trigger = self.slot.trigger_key();
        let mut joined = true;

        if let Some(handle) = self.thread.take() {
            let finished = match self.done_rx.take() {
                Some(rx) => !matches!(
                    rx.recv_timeout(self.join_timeout),
                    Err(RecvTimeoutError::Timeout)
                ),
                None => true,
            };
            if finished {
                if handle.join().is_err() {
                    warn!(trigger, "loop thread panicked");
                }
            } else {
                warn!(
                    trigger,
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "loop thread did not stop in time, detaching"
                );
                joined = false;
            }
        }

        self.shared.armed.store(false, Ordering::SeqCst);
        self.shared.release_block(self.backend.as_ref(), trigger);
        joined
    }
}

impl Drop for TriggerLoopRunner {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::broadcast;

    use super::*;
    use crate::backend::mock::{wait_until, Call, MockBackend};
    use crate::slots::BindingSet;

    /// Virtual time: pauses advance instantly, optionally with one stall and
    /// a physical release once the hold duration has elapsed.
    struct VirtualClock {
        base: Instant,
        elapsed: Mutex<Duration>,
        hold: Duration,
        stall: Mutex<Option<(Duration, Duration)>>,
        backend: Arc<MockBackend>,
        trigger: String,
    }

    impl VirtualClock {
        fn new(backend: Arc<MockBackend>, trigger: &str, hold_ms: u64) -> Self {
            Self {
                base: Instant::now(),
                elapsed: Mutex::new(Duration::ZERO),
                hold: Duration::from_millis(hold_ms),
                stall: Mutex::new(None),
                backend,
                trigger: trigger.to_string(),
            }
        }

        fn stall_at(self, at_ms: u64, stall_ms: u64) -> Self {
            *self.stall.lock() = Some((Duration::from_millis(at_ms), Duration::from_millis(stall_ms)));
            self
        }
    }

    impl Clock for VirtualClock {
        fn now(&self) -> Instant {
            self.base + *self.elapsed.lock()
        }

        fn pause(&self, _stop: &StopSignal, duration: Duration) {
            let mut elapsed = self.elapsed.lock();
            *elapsed += duration;
            let mut stall = self.stall.lock();
            if let Some((at, extra)) = *stall {
                if *elapsed >= at {
                    *elapsed += extra;
                    *stall = None;
                }
            }
            if *elapsed >= self.hold {
                self.backend.set_held(&self.trigger, false);
            }
        }
    }

    fn slot(interval_ms: u32, pass_through: bool) -> Arc<Slot> {
        let backend = MockBackend::new();
        let document = json!({"slots": [
            {"triggerKey": "e", "outputKey": "r", "intervalMs": interval_ms, "passThrough": pass_through}
        ]});
        let set = BindingSet::from_value(&document, backend.as_ref()).unwrap();
        Arc::new(set.slots()[0].clone())
    }

    fn pulses_for(interval_ms: u32, hold_ms: u64) -> u64 {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        let clock = VirtualClock::new(Arc::clone(&backend), "e", hold_ms);
        let pulses = AtomicU64::new(0);
        let exit = drive(
            &slot(interval_ms, true),
            backend.as_ref(),
            &clock,
            &StopSignal::new(),
            &pulses,
        );
        assert!(matches!(exit, LoopExit::Released));
        assert_eq!(backend.emitted("r") as u64, pulses.load(Ordering::Relaxed));
        pulses.load(Ordering::Relaxed)
    }

    #[test]
    fn test_pulse_count_tracks_hold_duration() {
        for (interval_ms, hold_ms) in [(10, 100), (1, 50), (7, 100), (33, 1000), (1000, 2500)] {
            let expected = hold_ms / u64::from(interval_ms);
            let pulses = pulses_for(interval_ms, hold_ms);
            assert!(
                pulses + 1 >= expected && pulses <= expected + 1,
                "interval {}ms hold {}ms: {} pulses",
                interval_ms,
                hold_ms,
                pulses
            );
        }
    }

    #[test]
    fn test_stall_does_not_burst() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        let clock = VirtualClock::new(Arc::clone(&backend), "e", 200).stall_at(50, 100);
        let pulses = AtomicU64::new(0);
        drive(&slot(10, true), backend.as_ref(), &clock, &StopSignal::new(), &pulses);

        // 200ms at 10ms with 100ms lost to the stall: one resync pulse, no catch-up burst
        let pulses = pulses.load(Ordering::Relaxed);
        assert!(pulses <= 11, "burst after stall: {} pulses", pulses);
        assert!(pulses >= 9, "{} pulses", pulses);
    }

    #[test]
    fn test_stop_signal_ends_loop_before_first_check() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        let stop = StopSignal::new();
        stop.set();
        let exit = drive(&slot(10, true), backend.as_ref(), &SystemClock, &stop, &AtomicU64::new(0));
        assert!(matches!(exit, LoopExit::Stopped));
        assert_eq!(backend.emitted("r"), 0);
    }

    #[test]
    fn test_emit_failure_exits_loop() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        backend.fail_emit("r");
        let exit = drive(&slot(10, true), backend.as_ref(), &SystemClock, &StopSignal::new(), &AtomicU64::new(0));
        assert!(matches!(exit, LoopExit::EmitFailed(BackendError::Emit { .. })));
    }

    #[test]
    fn test_stop_signal_wakes_waiter() {
        let stop = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&stop);
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        stop.set();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    fn runner(backend: &Arc<MockBackend>, slot: Arc<Slot>) -> TriggerLoopRunner {
        let (tx, _) = broadcast::channel(64);
        TriggerLoopRunner::new(
            slot,
            Arc::clone(backend) as Arc<dyn InputBackend>,
            Arc::new(SystemClock),
            tx,
            Duration::from_millis(JOIN_TIMEOUT_MS),
        )
    }

    #[test]
    fn test_runner_blocks_once_and_unblocks_once() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        let mut runner = runner(&backend, slot(5, false));

        assert!(matches!(runner.start().unwrap(), Suppression::Active));
        assert!(runner.is_armed());
        assert!(matches!(runner.start().unwrap(), Suppression::Active));
        assert!(wait_until(Duration::from_secs(2), || backend.emitted("r") >= 2));

        assert!(runner.stop());
        assert!(!runner.is_armed());
        assert!(!backend.is_blocked("e"));
        assert_eq!(backend.count(&Call::Block("e".to_string())), 1);
        assert_eq!(backend.count(&Call::Unblock("e".to_string())), 1);

        // Second stop is idle
        runner.stop();
        assert_eq!(backend.count(&Call::Unblock("e".to_string())), 1);
    }

    #[test]
    fn test_runner_tears_down_when_key_desyncs() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        let mut runner = runner(&backend, slot(5, false));
        runner.start().unwrap();

        backend.set_held("e", false);
        assert!(wait_until(Duration::from_secs(2), || !runner.is_armed()));
        assert!(wait_until(Duration::from_secs(2), || !backend.is_blocked("e")));
        assert_eq!(backend.count(&Call::Unblock("e".to_string())), 1);

        runner.stop();
        assert_eq!(backend.count(&Call::Unblock("e".to_string())), 1);
    }

    #[test]
    fn test_runner_pass_through_never_blocks() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        let mut runner = runner(&backend, slot(5, true));
        assert!(matches!(runner.start().unwrap(), Suppression::NotRequested));
        runner.stop();
        assert_eq!(backend.count(&Call::Block("e".to_string())), 0);
        assert_eq!(backend.count(&Call::Unblock("e".to_string())), 0);
    }

    #[test]
    fn test_runner_arms_without_suppression_when_block_fails() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        backend.fail_block("e");
        let mut runner = runner(&backend, slot(5, false));

        assert!(matches!(runner.start().unwrap(), Suppression::Unavailable));
        assert!(runner.is_armed());
        assert!(!runner.is_blocked());
        assert!(wait_until(Duration::from_secs(2), || backend.emitted("r") >= 1));

        runner.stop();
        assert_eq!(backend.count(&Call::Unblock("e".to_string())), 0);
    }

    #[test]
    fn test_halt_returns_while_emit_in_flight() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        backend.slow_emit(Duration::from_millis(300));
        let mut runner = runner(&backend, slot(5, false));
        runner.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        runner.halt();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!runner.is_armed());
        assert!(!backend.is_blocked("e"));

        // Collecting the thread later gives back nothing twice
        assert!(runner.stop());
        assert_eq!(backend.count(&Call::Unblock("e".to_string())), 1);
        assert!(backend.emitted("r") <= 1);
    }

    #[test]
    fn test_stop_detaches_thread_after_timeout() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        backend.slow_emit(Duration::from_millis(300));
        let (tx, _) = broadcast::channel(64);
        let mut runner = TriggerLoopRunner::new(
            slot(5, false),
            Arc::clone(&backend) as Arc<dyn InputBackend>,
            Arc::new(SystemClock),
            tx,
            Duration::from_millis(50),
        );
        runner.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(!runner.stop());
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!backend.is_blocked("e"));

        thread::sleep(Duration::from_millis(400));
        assert_eq!(backend.count(&Call::Unblock("e".to_string())), 1);
    }

    #[test]
    fn test_drop_disarms() {
        let backend = MockBackend::new();
        backend.set_held("e", true);
        {
            let mut runner = runner(&backend, slot(5, false));
            runner.start().unwrap();
        }
        assert!(!backend.is_blocked("e"));
        let emitted = backend.emitted("r");
        thread::sleep(Duration::from_millis(30));
        assert_eq!(backend.emitted("r"), emitted);
    }
}
