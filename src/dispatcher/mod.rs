//! Request dispatching and result routing.
//!
//! The dispatcher deduplicates incoming channel update requests by retrieval
//! key, owns the pending-request and active-worker tables, and routes worker
//! results into the buffer store through the window merge. All dispatcher
//! state lives behind one lock; workers communicate with the coordinator
//! exclusively through an mpsc event channel, so results for one key arrive
//! in the order the worker produced them.

use crate::config::{resolve_endpoint, ChannelConfig, EngineConfig, ResolvedRequest};
use crate::key::{AxisRole, ChannelKey, RetrievalKey};
use crate::perf::PerformanceTracker;
use crate::store::{BufferRef, BufferStore};
use crate::transport::{epoch_seconds_now, HttpTransport};
use crate::window;
use crate::worker::{spawn_worker, WorkerEvent, WorkerHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Window extension is capped so a channel that never returns data cannot
/// grow its requests without bound.
const MAX_WINDOW_EXTENSION_SECONDS: u64 = 7 * 86_400;

/// One entry of an update batch.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub key: ChannelKey,
    pub config: ChannelConfig,
    pub buffer: BufferRef,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    key: ChannelKey,
    config: ChannelConfig,
    buffer: BufferRef,
}

#[derive(Default)]
struct DispatcherState {
    /// Retrieval key -> channel keys awaiting service from its worker.
    pending: HashMap<RetrievalKey, Vec<PendingEntry>>,
    /// At most one live worker per retrieval key.
    active: HashMap<RetrievalKey, WorkerHandle>,
    /// Accumulated window-length extension per channel, fed back into the
    /// next request when a final result arrives on an inactive worker.
    window_extension: HashMap<ChannelKey, u64>,
    /// Transiently set during abort handling; batches submitted while set
    /// are dropped entirely.
    suspended: bool,
    /// Cleared by shutdown; no new batches are accepted afterwards.
    accepting: bool,
}

pub(crate) struct Dispatcher {
    state: Mutex<DispatcherState>,
    store: Arc<dyn BufferStore>,
    perf: PerformanceTracker,
    client: reqwest::Client,
    config: EngineConfig,
    events_tx: mpsc::Sender<WorkerEvent>,
}

impl Dispatcher {
    fn lock(&self) -> std::sync::MutexGuard<'_, DispatcherState> {
        self.state.lock().expect("dispatcher lock poisoned")
    }

    fn submit(&self, batch: Vec<UpdateRequest>) {
        let mut state = self.lock();
        if state.suspended {
            tracing::debug!("dispatcher suspended, dropping update batch");
            return;
        }
        if !state.accepting {
            tracing::debug!("dispatcher shut down, dropping update batch");
            return;
        }

        for request in batch {
            let rkey = request.key.retrieval_key();
            let entry = PendingEntry {
                key: request.key.clone(),
                config: request.config.clone(),
                buffer: request.buffer,
            };

            // An existing pending set means a worker is (or was) in flight
            // for this retrieval key; its eventual result feeds this entry.
            if let Some(entries) = state.pending.get_mut(&rkey) {
                match entries.iter_mut().find(|e| e.key == entry.key) {
                    Some(existing) => *existing = entry,
                    None => entries.push(entry),
                }
                continue;
            }

            let perf = self.perf.ensure(&rkey);
            let resolved = self.resolve(&state, &request, &rkey);
            state.pending.insert(rkey.clone(), vec![entry]);

            tracing::debug!(key = %rkey, endpoint = %resolved.endpoint, "spawning retrieval worker");
            let handle = spawn_worker(
                resolved,
                self.client.clone(),
                Duration::from_secs(self.config.request_timeout_seconds),
                self.config.max_continuations,
                self.events_tx.clone(),
                perf,
            );
            state.active.insert(rkey, handle);
            metrics::gauge!("archiver_active_workers").set(state.active.len() as f64);
        }
    }

    /// Resolve the effective configuration for a fresh retrieval. Missing
    /// per-channel configuration warns on the first request only.
    fn resolve(
        &self,
        state: &DispatcherState,
        request: &UpdateRequest,
        rkey: &RetrievalKey,
    ) -> ResolvedRequest {
        let config = &request.config;

        if config.bin_count < 0 && config.init {
            tracing::warn!(
                channel = %request.key.channel,
                widget = %request.key.widget,
                "no bin count configured for widget, defaulting to maximum number of points"
            );
        }
        match &config.backend {
            Some(hint) if !hint.is_known() => {
                tracing::warn!(
                    channel = %request.key.channel,
                    backend = %hint,
                    "backend configured but not known (use archiver-appliance or data-buffer), passing through"
                );
            }
            None if config.init => {
                tracing::warn!(
                    channel = %request.key.channel,
                    "no backend configured for widget, the server default applies"
                );
            }
            _ => {}
        }

        let extension = state
            .window_extension
            .get(&request.key)
            .copied()
            .unwrap_or(0);

        ResolvedRequest {
            key: rkey.clone(),
            endpoint: resolve_endpoint(&request.key, config, &self.config),
            channel: request.key.channel.clone(),
            seconds_past: config.seconds_past + extension,
            bin_count: config.bin_count,
            backend: config.backend.clone(),
            absolute_time_axis: config.absolute_time_axis,
        }
    }

    fn handle_result(&self, event: WorkerEvent) {
        let now = epoch_seconds_now();
        let mut state = self.lock();

        let Some(handle) = state.active.get(&event.key) else {
            // Already cancelled or cleaned up.
            tracing::debug!(key = %event.key, "discarding stale retrieval result");
            return;
        };
        let is_active = handle.is_active();
        let got_points = !event.x.is_empty();

        if got_points && is_active {
            if let Some(entries) = state.pending.get(&event.key) {
                for entry in entries {
                    let y = select_axis(&event, entry);
                    match window::apply_update(
                        self.store.as_ref(),
                        entry.buffer,
                        &event.x,
                        y,
                        entry.config.seconds_past,
                        now,
                        &event.backend,
                    ) {
                        Ok(outcome) => tracing::trace!(
                            key = %entry.key,
                            total = outcome.total,
                            retained = outcome.retained,
                            "buffer updated"
                        ),
                        // Recoverable: this channel's update is skipped,
                        // everything else proceeds.
                        Err(e) => tracing::warn!(
                            key = %entry.key,
                            error = %e,
                            "skipping channel update"
                        ),
                    }
                }
            }
        }

        if event.is_final {
            state.active.remove(&event.key);
            metrics::gauge!("archiver_active_workers").set(state.active.len() as f64);

            if let Some(entries) = state.pending.remove(&event.key) {
                if !is_active {
                    // Cancelled worker: returned points are not merged, only
                    // the window-length bookkeeping moves so the next request
                    // covers the gap.
                    for entry in entries {
                        let slot = state.window_extension.entry(entry.key).or_insert(0);
                        if got_points {
                            *slot = 0;
                        } else {
                            *slot = (*slot + entry.config.seconds_past)
                                .min(MAX_WINDOW_EXTENSION_SECONDS);
                        }
                    }
                }
            }

            if let Some(error) = &event.error {
                tracing::debug!(key = %event.key, error = %error, "retrieval finished with error");
            }
        }
    }

    fn abort(&self, key: &RetrievalKey) {
        let mut state = self.lock();
        state.suspended = true;

        if let Some(handle) = state.active.get(key) {
            handle.set_active(false);
            handle.cancel_transport();
            tracing::debug!(key = %key, "abort requested for in-flight retrieval");
        }

        // Table entries are not removed here; the cancelled transport's
        // final empty result releases them through the normal path.
        state.suspended = false;
    }

    fn clear(&self, key: &ChannelKey) {
        let mut state = self.lock();
        let rkey = key.retrieval_key();
        let mut drop_key = false;
        if let Some(entries) = state.pending.get_mut(&rkey) {
            entries.retain(|e| e.key != *key);
            drop_key = entries.is_empty();
        }
        if drop_key {
            state.pending.remove(&rkey);
            self.perf.remove(&rkey);
        }
        state.window_extension.remove(key);
    }

    async fn drain(&self) {
        loop {
            if self.lock().active.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Pick the value array a pending entry should receive: min/max bands get
/// their envelope arrays when binning is enabled, everything else the mean.
fn select_axis<'a>(event: &'a WorkerEvent, entry: &PendingEntry) -> &'a [f64] {
    if entry.config.bin_count > 0 {
        match entry.key.axis {
            AxisRole::MinBand if !event.min.is_empty() => &event.min,
            AxisRole::MaxBand if !event.max.is_empty() => &event.max,
            _ => &event.mean,
        }
    } else {
        &event.mean
    }
}

/// Host-facing retrieval engine.
///
/// Owns the dispatcher and the coordinator task that consumes worker events.
/// All host operations go through this handle.
pub struct ArchiveEngine {
    dispatcher: Arc<Dispatcher>,
    coordinator: JoinHandle<()>,
}

impl ArchiveEngine {
    /// Build the engine. Must be called within a tokio runtime: the
    /// coordinator task and all workers are spawned on it.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn BufferStore>,
    ) -> Result<Self, reqwest::Error> {
        let client = HttpTransport::build_client(config.accept_invalid_certs)?;
        let (events_tx, mut events_rx) = mpsc::channel(config.event_queue_depth.max(1));

        let dispatcher = Arc::new(Dispatcher {
            state: Mutex::new(DispatcherState {
                accepting: true,
                ..Default::default()
            }),
            store,
            perf: PerformanceTracker::new(),
            client,
            config,
            events_tx,
        });

        let coordinator = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    dispatcher.handle_result(event);
                }
            })
        };

        Ok(Self {
            dispatcher,
            coordinator,
        })
    }

    /// Submit an update batch. Entries whose retrieval key already has a
    /// pending set join it and are fed by the in-flight worker's result;
    /// everything else gets a fresh worker. The whole batch is dropped if
    /// the dispatcher is suspended or shut down.
    pub fn submit(&self, batch: Vec<UpdateRequest>) {
        self.dispatcher.submit(batch);
    }

    /// Abort the in-flight retrieval for a key. Returns immediately; the
    /// worker's final empty result still arrives and releases the tables.
    pub fn abort(&self, key: &RetrievalKey) {
        self.dispatcher.abort(key);
    }

    /// Forget a channel: drops its pending entry, performance record (when
    /// no sibling entries remain) and window bookkeeping.
    pub fn clear(&self, key: &ChannelKey) {
        self.dispatcher.clear(key);
    }

    /// Render the diagnostic report for a key's last retrieval.
    pub fn generate_report(&self, key: &RetrievalKey) -> Option<String> {
        self.dispatcher.perf.generate_report(key)
    }

    /// Wait until no worker is in flight.
    pub async fn drain(&self) {
        self.dispatcher.drain().await;
    }

    /// Stop accepting batches and let in-flight workers drain.
    pub async fn shutdown(&self) {
        self.dispatcher.lock().accepting = false;
        self.dispatcher.drain().await;
    }

    pub fn active_worker_count(&self) -> usize {
        self.dispatcher.lock().active.len()
    }

    pub fn pending_key_count(&self) -> usize {
        self.dispatcher.lock().pending.len()
    }
}

impl Drop for ArchiveEngine {
    fn drop(&mut self) {
        self.coordinator.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::WidgetId;
    use crate::store::{MemoryBufferStore, Slot};

    fn entry(axis: AxisRole, bin_count: i32) -> PendingEntry {
        PendingEntry {
            key: ChannelKey::new("CH:A", 0, WidgetId::new("plot-1"), axis),
            config: ChannelConfig {
                bin_count,
                ..Default::default()
            },
            buffer: BufferRef::new(0, 1),
        }
    }

    fn event() -> WorkerEvent {
        WorkerEvent {
            key: RetrievalKey::new("CH:A", WidgetId::new("plot-1")),
            x: vec![1.0, 2.0],
            mean: vec![10.0, 20.0],
            min: vec![5.0, 15.0],
            max: vec![15.0, 25.0],
            backend: "data-buffer".to_string(),
            is_final: true,
            error: None,
        }
    }

    #[test]
    fn test_select_axis_binned_bands() {
        let ev = event();
        assert_eq!(select_axis(&ev, &entry(AxisRole::Primary, 500)), &[10.0, 20.0]);
        assert_eq!(select_axis(&ev, &entry(AxisRole::MinBand, 500)), &[5.0, 15.0]);
        assert_eq!(select_axis(&ev, &entry(AxisRole::MaxBand, 500)), &[15.0, 25.0]);
    }

    #[test]
    fn test_select_axis_unbinned_ignores_role() {
        let ev = event();
        assert_eq!(select_axis(&ev, &entry(AxisRole::MinBand, -1)), &[10.0, 20.0]);
    }

    #[test]
    fn test_select_axis_falls_back_to_mean_without_bands() {
        let mut ev = event();
        ev.min.clear();
        ev.max.clear();
        assert_eq!(select_axis(&ev, &entry(AxisRole::MinBand, 500)), &[10.0, 20.0]);
    }

    fn test_dispatcher(store: Arc<MemoryBufferStore>) -> Dispatcher {
        let (events_tx, _events_rx) = mpsc::channel(8);
        Dispatcher {
            state: Mutex::new(DispatcherState {
                accepting: true,
                ..Default::default()
            }),
            store,
            perf: PerformanceTracker::new(),
            client: HttpTransport::build_client(false).unwrap(),
            config: EngineConfig::default(),
            events_tx,
        }
    }

    // A worker deactivated by abort can still deliver a final result that
    // carries points. The upstream behavior is to discard those points and
    // only move the window-length bookkeeping; this test pins that down so
    // a change here is a conscious one.
    #[tokio::test]
    async fn test_final_result_on_inactive_worker_updates_bookkeeping_only() {
        let store = Arc::new(MemoryBufferStore::new());
        store.insert(0, Slot::default());
        store.insert(1, Slot::default());
        let dispatcher = test_dispatcher(store.clone());

        let key = ChannelKey::new("CH:A", 0, WidgetId::new("plot-1"), AxisRole::Primary);
        let rkey = key.retrieval_key();
        dispatcher.submit(vec![UpdateRequest {
            key,
            config: ChannelConfig {
                endpoint_override: Some("http://127.0.0.1:9/".to_string()),
                ..Default::default()
            },
            buffer: BufferRef::new(0, 1),
        }]);
        dispatcher.lock().active.get(&rkey).unwrap().set_active(false);

        let mut ev = event();
        ev.key = rkey.clone();
        dispatcher.handle_result(ev);

        // Points discarded, tables released.
        assert!(store.read(0).unwrap().data.is_empty());
        assert!(dispatcher.lock().pending.is_empty());
        assert!(dispatcher.lock().active.is_empty());
    }

    #[tokio::test]
    async fn test_final_empty_result_on_inactive_worker_extends_window() {
        let store = Arc::new(MemoryBufferStore::new());
        store.insert(0, Slot::default());
        store.insert(1, Slot::default());
        let dispatcher = test_dispatcher(store);

        let key = ChannelKey::new("CH:A", 0, WidgetId::new("plot-1"), AxisRole::Primary);
        let rkey = key.retrieval_key();
        dispatcher.submit(vec![UpdateRequest {
            key: key.clone(),
            config: ChannelConfig {
                seconds_past: 3600,
                endpoint_override: Some("http://127.0.0.1:9/".to_string()),
                ..Default::default()
            },
            buffer: BufferRef::new(0, 1),
        }]);
        dispatcher.lock().active.get(&rkey).unwrap().set_active(false);

        let mut ev = event();
        ev.key = rkey;
        ev.x.clear();
        ev.mean.clear();
        ev.min.clear();
        ev.max.clear();
        ev.error = Some("retrieval was aborted".to_string());
        dispatcher.handle_result(ev);

        assert_eq!(
            dispatcher.lock().window_extension.get(&key).copied(),
            Some(3600)
        );
    }
}
