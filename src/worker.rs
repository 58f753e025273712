//! Retrieval worker.
//!
//! One worker exists per retrieval key while a fetch is in flight. It owns
//! one [`HttpTransport`], runs the blocking fetch-and-parse sequence on its
//! own task, follows one redirect, chases `continueAt` continuations, and
//! reports everything to the coordinator as [`WorkerEvent`] messages.
//! Failures never cross this boundary as errors: they become events carrying
//! zero points plus an error string.

use crate::config::ResolvedRequest;
use crate::key::RetrievalKey;
use crate::perf::SharedPerfRecord;
use crate::transport::{
    epoch_seconds_now, FetchOutcome, HttpTransport, ParsedSeries, UrlBuilder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result message from a worker to the coordinator.
#[derive(Debug)]
pub struct WorkerEvent {
    pub key: RetrievalKey,
    /// Projected time axis, window-filtered.
    pub x: Vec<f64>,
    /// Mean (or plain) values, position-aligned with `x`.
    pub mean: Vec<f64>,
    /// Bin minima; empty for unbinned retrievals.
    pub min: Vec<f64>,
    /// Bin maxima; empty for unbinned retrievals.
    pub max: Vec<f64>,
    /// Backend that served the data.
    pub backend: String,
    /// Last event from this worker; the coordinator releases tables on it.
    pub is_final: bool,
    /// Error text for failed retrievals, `None` on success.
    pub error: Option<String>,
}

/// Handle to a live worker, kept in the dispatcher's active table. The task
/// itself is not tracked here: it always ends by delivering a final event,
/// and the dispatcher deregisters the handle on receipt.
pub struct WorkerHandle {
    active: Arc<AtomicBool>,
    transport: Arc<HttpTransport>,
}

impl WorkerHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Request cancellation of the in-flight transport. Asynchronous: the
    /// worker's final (empty) event still arrives through the normal path.
    pub fn cancel_transport(&self) {
        self.transport.cancel();
    }
}

/// Spawn a worker for `request` on its own task.
pub fn spawn_worker(
    request: ResolvedRequest,
    client: reqwest::Client,
    timeout: Duration,
    max_continuations: u32,
    events: mpsc::Sender<WorkerEvent>,
    perf: SharedPerfRecord,
) -> WorkerHandle {
    let transport = Arc::new(HttpTransport::new(client, timeout));
    let active = Arc::new(AtomicBool::new(true));
    let worker = RetrievalWorker {
        request,
        transport: transport.clone(),
        max_continuations,
        events,
        perf,
    };
    tokio::spawn(worker.run());
    WorkerHandle { active, transport }
}

struct RetrievalWorker {
    request: ResolvedRequest,
    transport: Arc<HttpTransport>,
    max_continuations: u32,
    events: mpsc::Sender<WorkerEvent>,
    perf: SharedPerfRecord,
}

impl RetrievalWorker {
    async fn run(self) {
        let mut builder = UrlBuilder::from_request(&self.request, epoch_seconds_now());
        let mut redirects = 0u32;
        let mut continuations = 0u32;

        loop {
            let url = builder.assemble();
            {
                let mut perf = self.perf.lock().expect("perf record lock poisoned");
                perf.begin(&url);
            }

            let started = std::time::Instant::now();
            let report = self.transport.fetch(&url, &self.request).await;
            metrics::histogram!(
                "archiver_retrieval_duration_seconds",
                "channel" => self.request.channel.clone()
            )
            .record(started.elapsed().as_secs_f64());
            metrics::histogram!("archiver_retrieval_bytes").record(report.response_bytes as f64);

            match report.outcome {
                FetchOutcome::Redirect { location } => {
                    if redirects == 0 {
                        redirects += 1;
                        tracing::warn!(
                            key = %self.request.key,
                            location = %location,
                            "re-targeting retrieval after redirect"
                        );
                        self.finish_perf(0, 0, Some(&format!("redirected to {location}")));
                        builder.set_base(location);
                        continue;
                    }
                    let error = format!("redirected again to {location}, giving up");
                    tracing::warn!(key = %self.request.key, "{error}");
                    self.finish_perf(0, 0, Some(&error));
                    self.emit_empty(Some(error)).await;
                    break;
                }
                FetchOutcome::Aborted => {
                    let error = "retrieval was aborted".to_string();
                    self.finish_perf(0, 0, Some(&error));
                    self.emit_empty(Some(error)).await;
                    break;
                }
                FetchOutcome::Failed(err) => {
                    let error = err.to_string();
                    tracing::debug!(key = %self.request.key, error = %error, "retrieval failed");
                    self.finish_perf(report.response_bytes, 0, Some(&error));
                    self.emit_empty(Some(error)).await;
                    break;
                }
                FetchOutcome::Data(series) => {
                    self.finish_perf(report.response_bytes, series.len(), None);
                    match series.continue_at {
                        Some(at) if continuations < self.max_continuations => {
                            continuations += 1;
                            tracing::debug!(
                                key = %self.request.key,
                                continue_at = %at,
                                "continuation present, advancing window start"
                            );
                            self.emit_series(series, false).await;
                            builder.set_begin(at);
                            continue;
                        }
                        _ => {
                            self.emit_series(series, true).await;
                            break;
                        }
                    }
                }
            }
        }

        self.transport.mark_done();
    }

    async fn emit_series(&self, series: ParsedSeries, is_final: bool) {
        let event = WorkerEvent {
            key: self.request.key.clone(),
            x: series.x,
            mean: series.mean,
            min: series.min,
            max: series.max,
            backend: series.backend,
            is_final,
            error: None,
        };
        self.emit(event).await;
    }

    async fn emit_empty(&self, error: Option<String>) {
        let event = WorkerEvent {
            key: self.request.key.clone(),
            x: Vec::new(),
            mean: Vec::new(),
            min: Vec::new(),
            max: Vec::new(),
            backend: self
                .request
                .backend
                .as_ref()
                .map(|b| b.as_str().to_string())
                .unwrap_or_default(),
            is_final: true,
            error,
        };
        self.emit(event).await;
    }

    async fn emit(&self, event: WorkerEvent) {
        // Coordinator gone means the engine is shutting down; nothing to do.
        if self.events.send(event).await.is_err() {
            tracing::debug!(key = %self.request.key, "coordinator closed, dropping result");
        }
    }

    fn finish_perf(&self, bytes: usize, points: usize, error: Option<&str>) {
        let mut perf = self.perf.lock().expect("perf record lock poisoned");
        perf.finish(bytes, points, error);
    }
}
