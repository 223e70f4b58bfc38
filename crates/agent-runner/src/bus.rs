//! Event bus
//!
//! Each run publishes through a [`RunEmitter`] bound to its task with a
//! task-local, so nested code can call [`emit`] without threading a handle
//! through every signature and concurrent runs never publish into each
//! other's streams. An emitter fans out to the run's live channel and, for
//! whitelisted names only, to the durable sink. Publishing never fails the
//! caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use cua_core::event::RunEvent;

use crate::error::Result;

/// Default interval between keepalive events
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

const LIVE_CHANNEL_CAPACITY: usize = 1000;

tokio::task_local! {
    static CURRENT_EMITTER: RunEmitter;
}

/// Durable store for the whitelisted subset of events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist(&self, event: &RunEvent) -> Result<()>;
}

/// Live per-run channels that stream endpoints subscribe to
#[derive(Debug, Default)]
pub struct EventHub {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<RunEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the live channel for a run
    pub fn channel(&self, run_id: Uuid) -> broadcast::Sender<RunEvent> {
        if let Some(sender) = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&run_id)
        {
            return sender.clone();
        }

        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(LIVE_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a run's live events
    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<RunEvent> {
        self.channel(run_id).subscribe()
    }

    /// Drop a run's channel; existing receivers see the stream close
    pub fn close(&self, run_id: Uuid) {
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&run_id);
    }

    pub fn is_open(&self, run_id: Uuid) -> bool {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&run_id)
    }
}

/// Publisher bound to a single run
#[derive(Clone)]
pub struct RunEmitter {
    run_id: Uuid,
    live: Option<broadcast::Sender<RunEvent>>,
    durable: Option<Arc<dyn EventSink>>,
}

impl RunEmitter {
    pub fn new(
        run_id: Uuid,
        live: Option<broadcast::Sender<RunEvent>>,
        durable: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            run_id,
            live,
            durable,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn emit(&self, name: &str, payload: serde_json::Value) {
        self.publish(RunEvent::new(self.run_id, name, payload)).await;
    }

    /// Fan an event out to the live channel and, if whitelisted, the
    /// durable sink. Failures are logged and swallowed.
    pub async fn publish(&self, event: RunEvent) {
        if let Some(live) = &self.live {
            // No receivers is not a failure: nobody is watching the stream.
            if live.send(event.clone()).is_err() {
                debug!("No live subscriber for run {} ({})", self.run_id, event.name);
            }
        }

        if event.is_persisted() {
            if let Some(sink) = &self.durable {
                if let Err(err) = sink.persist(&event).await {
                    warn!(
                        "Failed to persist event {} for run {}: {}",
                        event.name, self.run_id, err
                    );
                }
            }
        }
    }

    /// Emit a keepalive event every `interval` until the guard is dropped
    pub fn spawn_keepalive(&self, interval: Duration) -> KeepaliveGuard {
        let emitter = self.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                emitter.publish(RunEvent::keepalive(emitter.run_id)).await;
            }
        });
        KeepaliveGuard { handle }
    }
}

/// Cancels the keepalive task when dropped
#[derive(Debug)]
pub struct KeepaliveGuard {
    handle: JoinHandle<()>,
}

impl Drop for KeepaliveGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Access to the emitter bound to the current task
pub struct EventBus;

impl EventBus {
    /// Run `fut` with `emitter` as the current task's emitter
    pub async fn scope<F: Future>(emitter: RunEmitter, fut: F) -> F::Output {
        CURRENT_EMITTER.scope(emitter, fut).await
    }

    pub fn current() -> Option<RunEmitter> {
        CURRENT_EMITTER.try_with(|emitter| emitter.clone()).ok()
    }
}

/// Publish through the current task's emitter; a no-op when none is bound
pub async fn emit(name: &str, payload: serde_json::Value) {
    match EventBus::current() {
        Some(emitter) => emitter.emit(name, payload).await,
        None => debug!("No emitter bound to task; dropping event {}", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;
    use cua_core::event::{KEEPALIVE, STEP_COMPLETED, STEP_PREDICTED};
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        events: Mutex<Vec<RunEvent>>,
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn persist(&self, event: &RunEvent) -> Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn persist(&self, _event: &RunEvent) -> Result<()> {
            Err(RunnerError::setup("disk full"))
        }
    }

    #[tokio::test]
    async fn test_emit_without_emitter_is_noop() {
        emit(STEP_COMPLETED, json!({ "step": 1 })).await;
        assert!(EventBus::current().is_none());
    }

    #[tokio::test]
    async fn test_only_whitelisted_events_are_persisted() {
        let hub = EventHub::new();
        let run_id = Uuid::new_v4();
        let sink = Arc::new(MemorySink::default());
        let mut rx = hub.subscribe(run_id);
        let emitter = RunEmitter::new(run_id, Some(hub.channel(run_id)), Some(sink.clone()));

        EventBus::scope(emitter, async {
            emit(STEP_PREDICTED, json!({ "step": 1 })).await;
            emit(STEP_COMPLETED, json!({ "step": 1 })).await;
        })
        .await;

        assert_eq!(rx.recv().await.unwrap().name, STEP_PREDICTED);
        assert_eq!(rx.recv().await.unwrap().name, STEP_COMPLETED);
        let persisted = sink.events.lock().await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].name, STEP_COMPLETED);
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let run_id = Uuid::new_v4();
        let emitter = RunEmitter::new(run_id, None, Some(Arc::new(FailingSink)));

        emitter.emit(STEP_COMPLETED, json!({})).await;
    }

    #[tokio::test]
    async fn test_events_preserve_order_and_never_cross_runs() {
        let hub = Arc::new(EventHub::new());
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();
        let mut rx_a = hub.subscribe(run_a);
        let mut rx_b = hub.subscribe(run_b);

        let mut handles = Vec::new();
        for run_id in [run_a, run_b] {
            let emitter = RunEmitter::new(run_id, Some(hub.channel(run_id)), None);
            handles.push(tokio::spawn(EventBus::scope(emitter, async move {
                for step in 0..50 {
                    emit(STEP_COMPLETED, json!({ "step": step })).await;
                    tokio::task::yield_now().await;
                }
            })));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for (rx, run_id) in [(&mut rx_a, run_a), (&mut rx_b, run_b)] {
            for expected in 0..50 {
                let event = rx.recv().await.unwrap();
                assert_eq!(event.run_id, run_id);
                assert_eq!(event.payload["step"], expected);
            }
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_stops_when_guard_dropped() {
        let hub = EventHub::new();
        let run_id = Uuid::new_v4();
        let mut rx = hub.subscribe(run_id);
        let emitter = RunEmitter::new(run_id, Some(hub.channel(run_id)), None);

        let guard = emitter.spawn_keepalive(Duration::from_secs(15));
        tokio::time::sleep(Duration::from_secs(31)).await;
        drop(guard);
        tokio::time::sleep(Duration::from_secs(60)).await;

        let mut keepalives = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.name, KEEPALIVE);
            keepalives += 1;
        }
        assert_eq!(keepalives, 2);
    }

    #[test]
    fn test_hub_close_removes_channel() {
        let hub = EventHub::new();
        let run_id = Uuid::new_v4();
        let _rx = hub.subscribe(run_id);
        assert!(hub.is_open(run_id));

        hub.close(run_id);
        assert!(!hub.is_open(run_id));
    }
}
