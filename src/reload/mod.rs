//! Hot-reload coordinator
//!
//! Polls the binding file's modification marker and swaps the engine's
//! bindings when the file changes. An edit that fails validation or cannot
//! be applied is reported and the running bindings stay untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::{ApplyReport, Engine, EngineError};
use crate::events::{publish, EngineEvent, EventSender};
use crate::slots::{BindingSet, SlotError};

pub const DEFAULT_POLL_MS: u64 = 500;
pub const MIN_POLL_MS: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("binding file rejected: {0}")]
    Invalid(#[from] SlotError),

    #[error("bindings not applied: {0}")]
    Apply(#[from] EngineError),
}

/// Result of one poll
#[derive(Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    Unchanged,
    /// File changed but the bindings are equivalent (metadata only)
    SameBindings,
    Applied(ApplyReport),
}

/// Cheap change detector for the binding file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Absent,
    Present {
        modified: Option<SystemTime>,
        len: u64,
    },
}

impl Marker {
    fn read(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) => Marker::Present {
                modified: meta.modified().ok(),
                len: meta.len(),
            },
            Err(_) => Marker::Absent,
        }
    }
}

struct ReloadState {
    marker: Marker,
    active: BindingSet,
}

pub struct HotReloader {
    path: PathBuf,
    engine: Arc<Engine>,
    events: EventSender,
    poll_interval: Duration,
    state: Mutex<ReloadState>,
}

impl HotReloader {
    /// `active` is the set already applied to the engine; the current state
    /// of the file counts as seen.
    pub fn new(path: PathBuf, engine: Arc<Engine>, active: BindingSet, poll_interval: Duration) -> Self {
        let poll_interval = poll_interval.max(Duration::from_millis(MIN_POLL_MS));
        let marker = Marker::read(&path);
        Self {
            events: engine.events(),
            path,
            engine,
            poll_interval,
            state: Mutex::new(ReloadState { marker, active }),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn active(&self) -> BindingSet {
        self.state.lock().active.clone()
    }

    /// Check the file once and apply it if it changed
    pub fn poll_once(&self) -> Result<ReloadOutcome, ReloadError> {
        let marker = Marker::read(&self.path);
        let mut state = self.state.lock();
        if marker == state.marker {
            return Ok(ReloadOutcome::Unchanged);
        }
        // Recorded up front so a bad edit is reported once, not every tick
        state.marker = marker;
        debug!(path = ?self.path, ?marker, "binding file changed");

        let backend = self.engine.backend();
        let set = match BindingSet::load(&self.path, backend.as_ref()) {
            Ok(set) => set,
            Err(e) => {
                warn!(path = ?self.path, %e, "binding file rejected, keeping current bindings");
                publish(
                    &self.events,
                    EngineEvent::ConfigRejected {
                        reason: e.to_string(),
                    },
                );
                return Err(e.into());
            }
        };

        if set.same_bindings(&state.active) {
            debug!("bindings unchanged");
            state.active = set;
            return Ok(ReloadOutcome::SameBindings);
        }

        match self.engine.apply(&set) {
            Ok(report) => {
                let enabled = set.enabled().count();
                let total = set.slots().len();
                info!(enabled, total, "bindings reloaded");
                publish(&self.events, EngineEvent::ConfigReloaded { enabled, total });
                state.active = set;
                Ok(ReloadOutcome::Applied(report))
            }
            Err(e) => {
                warn!(%e, "reload failed, keeping current bindings");
                publish(
                    &self.events,
                    EngineEvent::ConfigRejected {
                        reason: e.to_string(),
                    },
                );
                Err(e.into())
            }
        }
    }

    /// Poll until `shutdown` turns true or its sender goes away
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(path = ?self.path, interval_ms = self.poll_interval.as_millis() as u64, "watching binding file");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let reloader = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || reloader.poll_once()).await {
                        Ok(Ok(outcome)) => {
                            if outcome != ReloadOutcome::Unchanged {
                                debug!(?outcome, "poll finished");
                            }
                        }
                        // Already logged and published by poll_once
                        Ok(Err(_)) => {}
                        Err(e) => error!(%e, "reload poll panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("reload loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::broadcast;

    use super::*;
    use crate::backend::mock::{Call, MockBackend};
    use crate::backend::InputBackend;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        backend: Arc<MockBackend>,
        engine: Arc<Engine>,
        events: broadcast::Receiver<EngineEvent>,
    }

    fn write(path: &Path, doc: serde_json::Value) {
        fs::write(path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    }

    fn fixture() -> (Fixture, HotReloader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autofire.json");
        write(&path, json!({"slots": [{"triggerKey": "e", "outputKey": "r", "intervalMs": 10}]}));

        let backend = MockBackend::new();
        let (tx, events) = broadcast::channel(64);
        let engine = Arc::new(Engine::new(Arc::clone(&backend) as Arc<dyn InputBackend>, tx));
        let initial = BindingSet::load(&path, backend.as_ref()).unwrap();
        engine.apply(&initial).unwrap();

        let reloader = HotReloader::new(path.clone(), Arc::clone(&engine), initial, Duration::from_millis(100));
        (
            Fixture {
                _dir: dir,
                path,
                backend,
                engine,
                events,
            },
            reloader,
        )
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_unchanged_file_is_noop() {
        let (fx, reloader) = fixture();
        fx.backend.clear_calls();
        assert_eq!(reloader.poll_once().unwrap(), ReloadOutcome::Unchanged);
        assert!(fx.backend.calls().is_empty());
    }

    #[test]
    fn test_valid_edit_is_applied() {
        let (mut fx, reloader) = fixture();
        drain(&mut fx.events);
        write(
            &fx.path,
            json!({"slots": [
                {"triggerKey": "q", "outputKey": "w", "intervalMs": 20},
                {"triggerKey": "f", "outputKey": "g", "enabled": false}
            ]}),
        );

        assert!(matches!(reloader.poll_once().unwrap(), ReloadOutcome::Applied(_)));
        assert_eq!(fx.engine.active_slots()[0].trigger_key(), "q");
        assert_eq!(reloader.active().slots().len(), 2);
        assert_eq!(fx.backend.count(&Call::OnPress("q".to_string())), 1);
        assert!(drain(&mut fx.events).contains(&EngineEvent::ConfigReloaded { enabled: 1, total: 2 }));
        assert_eq!(reloader.poll_once().unwrap(), ReloadOutcome::Unchanged);
    }

    #[test]
    fn test_invalid_edit_keeps_running_bindings() {
        let (mut fx, reloader) = fixture();
        drain(&mut fx.events);
        write(&fx.path, json!({"slots": [{"triggerKey": "e", "outputKey": "r", "intervalMs": 0}]}));

        assert!(matches!(reloader.poll_once(), Err(ReloadError::Invalid(_))));
        assert!(drain(&mut fx.events)
            .iter()
            .any(|e| matches!(e, EngineEvent::ConfigRejected { .. })));
        // Reported once per change
        assert_eq!(reloader.poll_once().unwrap(), ReloadOutcome::Unchanged);

        fx.backend.key_down("e");
        assert!(fx.engine.is_running());
        fx.backend.key_up("e");
        assert_eq!(reloader.active().slots()[0].interval_ms(), 10);
    }

    #[test]
    fn test_unparsable_file_is_rejected() {
        let (fx, reloader) = fixture();
        fs::write(&fx.path, "{ \"slots\": [").unwrap();
        assert!(matches!(reloader.poll_once(), Err(ReloadError::Invalid(SlotError::Json(_)))));
        assert_eq!(fx.engine.active_slots().len(), 1);
    }

    #[test]
    fn test_language_only_change_keeps_registrations() {
        let (fx, reloader) = fixture();
        fx.backend.clear_calls();
        write(
            &fx.path,
            json!({"slots": [{"triggerKey": "e", "outputKey": "r", "intervalMs": 10}], "language": "zh_TW"}),
        );
        assert_eq!(reloader.poll_once().unwrap(), ReloadOutcome::SameBindings);
        assert!(fx.backend.calls().is_empty());
        assert_eq!(reloader.active().language(), "zh_TW");
    }

    #[test]
    fn test_unusable_edit_keeps_previous_set() {
        let (fx, reloader) = fixture();
        fx.backend.fail_hook("q");
        write(&fx.path, json!({"slots": [{"triggerKey": "q", "outputKey": "w", "intervalMs": 200}]}));

        assert!(matches!(reloader.poll_once(), Err(ReloadError::Apply(EngineError::NoBindings { .. }))));
        assert_eq!(reloader.active().slots()[0].trigger_key(), "e");
        fx.backend.key_down("e");
        assert!(fx.engine.is_running());
        fx.backend.key_up("e");
    }

    #[test]
    fn test_deleted_file_falls_back_to_default() {
        let (fx, reloader) = fixture();
        fs::remove_file(&fx.path).unwrap();
        assert!(matches!(reloader.poll_once().unwrap(), ReloadOutcome::Applied(_)));
        assert_eq!(reloader.active(), BindingSet::default());
    }

    #[test]
    fn test_poll_interval_is_clamped() {
        let (fx, _) = fixture();
        let reloader = HotReloader::new(
            fx.path.clone(),
            Arc::clone(&fx.engine),
            BindingSet::default(),
            Duration::from_millis(5),
        );
        assert_eq!(reloader.poll_interval(), Duration::from_millis(MIN_POLL_MS));
    }

    #[test]
    fn test_run_exits_when_shutdown_already_set() {
        let (_fx, reloader) = fixture();
        let (_tx, rx) = watch::channel(true);
        tokio_test::block_on(Arc::new(reloader).run(rx));
    }

    #[tokio::test]
    async fn test_run_applies_edits() {
        let (mut fx, reloader) = fixture();
        drain(&mut fx.events);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::new(reloader).run(shutdown_rx));

        write(&fx.path, json!({"slots": [{"triggerKey": "q", "outputKey": "w", "intervalMs": 250}]}));
        let reloaded = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match fx.events.recv().await {
                    Ok(EngineEvent::ConfigReloaded { .. }) => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel: {}", e),
                }
            }
        })
        .await;
        assert!(reloaded.is_ok());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
