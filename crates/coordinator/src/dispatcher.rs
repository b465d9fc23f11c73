//! Request dispatch
//!
//! The dispatcher binds the worker registry to the request tracker. It turns
//! transport events (connect, disconnect, heartbeat, worker output) and API
//! events (accept, cancel) into registry and tracker operations, and runs
//! the periodic sweeps.

use crate::channel::{result_channel, ResultEvent, ResultReceiver, WorkerChannel, WorkerJob};
use crate::clock::{elapsed, Clock, SystemClock};
use crate::registry::{PoolStats, WorkerRegistry, WorkerSnapshot};
use crate::tracker::{RequestOutcome, RequestSnapshot, RequestTracker, TrackerStats};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workerbridge_common::config::{BridgeConfig, MaintenanceConfig, WORKER_TOKENS_ENV};
use workerbridge_common::error::{BridgeError, Result};
use workerbridge_common::METRICS;

/// A generation request arriving from the API side
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request_id: Option<String>,
    pub model_name: String,
    pub payload: serde_json::Value,
    pub timeout: Option<Duration>,
}

impl InboundRequest {
    pub fn new(model_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            request_id: None,
            model_name: model_name.into(),
            payload,
            timeout: None,
        }
    }

    pub fn with_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An accepted request and the stream of its results
#[derive(Debug)]
pub struct Submission {
    pub request_id: String,
    pub worker_id: String,
    pub events: ResultReceiver,
}

impl Submission {
    /// Results as a `Stream`, for gateways that forward them as SSE
    pub fn into_stream(self) -> ReceiverStream<ResultEvent> {
        ReceiverStream::new(self.events)
    }
}

/// Output reported by a worker for the request it holds
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    Chunk(serde_json::Value),
    Finished,
    Failed(String),
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub workers_evicted: usize,
    pub requests_failed: usize,
    pub requests_expired: usize,
}

/// Monitoring view of the whole dispatcher
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub workers: PoolStats,
    pub requests: TrackerStats,
}

/// Dispatcher of requests onto workers
pub struct Dispatcher {
    registry: WorkerRegistry,
    tracker: RequestTracker,
    clock: Arc<dyn Clock>,
    maintenance: MaintenanceConfig,
    metrics_enabled: bool,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Dispatcher {
    /// Create a dispatcher; `env_tokens` overrides the configured tokens
    pub fn new(config: &BridgeConfig, env_tokens: Option<&str>, clock: Arc<dyn Clock>) -> Self {
        let registry = WorkerRegistry::new(&config.worker_settings, env_tokens, Arc::clone(&clock));
        let tracker = RequestTracker::new(
            &config.queue_settings,
            config.maintenance.delivery_timeout(),
            Arc::clone(&clock),
        );
        let (shutdown_tx, _) = watch::channel(false);

        if !config.queue_settings.reject_when_no_workers {
            warn!("reject_when_no_workers is disabled, but requests are never queued");
        }

        Self {
            registry,
            tracker,
            clock,
            maintenance: config.maintenance.clone(),
            metrics_enabled: config.observability.enable_metrics,
            closing: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Create a dispatcher on the system clock, reading `WORKER_TOKENS`
    pub fn from_config(config: &BridgeConfig) -> Self {
        let env_tokens = std::env::var(WORKER_TOKENS_ENV).ok();
        Self::new(config, env_tokens.as_deref(), Arc::new(SystemClock))
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// A worker connected
    pub fn connect(&self, worker_id: &str, token: &str, channel: Arc<dyn WorkerChannel>) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown(format!(
                "worker '{}' refused",
                worker_id
            )));
        }
        self.registry.register(worker_id, token, channel)
    }

    /// A worker's connection dropped. Its in-flight request, if any, fails.
    pub async fn disconnect(&self, worker_id: &str) -> bool {
        let Some(worker) = self.registry.unregister(worker_id) else {
            return false;
        };
        if let Some(request_id) = worker.current_request_id {
            self.fail_request(&request_id, "Worker disconnected").await;
        }
        true
    }

    /// A worker is alive; false means it must register again
    pub fn heartbeat(&self, worker_id: &str) -> bool {
        self.registry.heartbeat(worker_id)
    }

    /// Accept a request and hand it to the least-loaded idle worker.
    ///
    /// Fails immediately when no worker is available; nothing is queued.
    pub async fn accept(&self, request: InboundRequest) -> Result<Submission> {
        if self.closing.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown("request refused".to_string()));
        }

        let request_id = request
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(claim) = self.registry.select_and_claim(&request_id) else {
            METRICS.pool.no_workers_available.inc();
            return Err(BridgeError::worker_unavailable(
                "No available workers. Please try again later.",
            ));
        };

        let (tx, events) = result_channel(self.maintenance.result_buffer_size);
        if let Err(e) = self.tracker.track(
            &request_id,
            request.payload.clone(),
            &request.model_name,
            tx,
            request.timeout,
        ) {
            self.registry.release(&claim.worker_id, None);
            return Err(e);
        }
        self.tracker.assign(&request_id, &claim.worker_id);

        let job = WorkerJob {
            request_id: request_id.clone(),
            model_name: request.model_name,
            payload: request.payload,
        };
        if let Err(e) = claim.channel.send(job) {
            warn!(
                "Forwarding request '{}' to worker '{}' failed: {}",
                request_id, claim.worker_id, e
            );
            self.tracker.remove(&request_id, RequestOutcome::Failed);
            self.registry.release(&claim.worker_id, Some(e.to_string()));
            return Err(e);
        }

        info!(
            "Request '{}' dispatched to worker '{}'",
            request_id, claim.worker_id
        );
        Ok(Submission {
            request_id,
            worker_id: claim.worker_id,
            events,
        })
    }

    /// Relay output from `worker_id` for `request_id` to the caller
    pub async fn worker_result(&self, worker_id: &str, request_id: &str, output: WorkerOutput) -> bool {
        let Some(request) = self.tracker.get(request_id) else {
            // Timed out or cancelled while the worker was still busy with it
            if matches!(output, WorkerOutput::Finished | WorkerOutput::Failed(_)) {
                self.release_if_holding(worker_id, request_id);
            }
            debug!(
                "Dropping output from worker '{}' for untracked request '{}'",
                worker_id, request_id
            );
            return false;
        };

        if request.assigned_worker_id.as_deref() != Some(worker_id) {
            warn!(
                "Worker '{}' reported output for request '{}' it does not hold",
                worker_id, request_id
            );
            return false;
        }

        match output {
            WorkerOutput::Chunk(data) => self.tracker.publish(request_id, ResultEvent::Data(data)).await,
            WorkerOutput::Finished => {
                self.tracker.publish(request_id, ResultEvent::Done).await;
                self.complete(worker_id, request_id, RequestOutcome::Completed, None)
            }
            WorkerOutput::Failed(message) => {
                self.tracker
                    .publish(request_id, ResultEvent::Error(message.clone()))
                    .await;
                self.tracker.publish(request_id, ResultEvent::Done).await;
                self.complete(worker_id, request_id, RequestOutcome::Failed, Some(message))
            }
        }
    }

    /// The caller abandoned a request. Its worker is freed once it reports
    /// the end of that request.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.tracker
            .remove(request_id, RequestOutcome::Cancelled)
            .is_some()
    }

    fn complete(
        &self,
        worker_id: &str,
        request_id: &str,
        outcome: RequestOutcome,
        error: Option<String>,
    ) -> bool {
        let Some(removed) = self.tracker.remove(request_id, outcome) else {
            // Swept or cancelled while the final events were being delivered
            self.release_if_holding(worker_id, request_id);
            return false;
        };
        let processing_time = elapsed(removed.created_at, self.clock.now());
        self.registry.mark_idle(worker_id, processing_time, error)
    }

    fn release_if_holding(&self, worker_id: &str, request_id: &str) {
        let holding = self
            .registry
            .get(worker_id)
            .is_some_and(|w| w.current_request_id.as_deref() == Some(request_id));
        if holding {
            self.registry.release(worker_id, None);
        }
    }

    async fn fail_request(&self, request_id: &str, reason: &str) -> bool {
        if self.tracker.get(request_id).is_none() {
            return false;
        }
        self.tracker
            .publish(request_id, ResultEvent::Error(reason.to_string()))
            .await;
        self.tracker.publish(request_id, ResultEvent::Done).await;
        self.tracker.remove(request_id, RequestOutcome::Failed).is_some()
    }

    /// Evict unhealthy workers and fail the requests they held
    pub async fn sweep_workers(&self) -> (Vec<WorkerSnapshot>, usize) {
        let evicted = self.registry.sweep_unhealthy();
        let mut failed = 0;
        for worker in &evicted {
            if let Some(request_id) = &worker.current_request_id {
                if self.fail_request(request_id, "Worker stopped responding").await {
                    failed += 1;
                }
            }
        }
        (evicted, failed)
    }

    /// Evict expired requests
    pub async fn sweep_requests(&self) -> usize {
        self.tracker.sweep_expired().await
    }

    /// Run both sweeps once
    pub async fn sweep(&self) -> SweepReport {
        let (evicted, requests_failed) = self.sweep_workers().await;
        let requests_expired = self.sweep_requests().await;

        SweepReport {
            workers_evicted: evicted.len(),
            requests_failed,
            requests_expired,
        }
    }

    /// Start the periodic sweeps; the task ends on `shutdown`
    pub fn spawn_maintenance(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if *shutdown_rx.borrow_and_update() {
                debug!("Dispatcher already shut down, maintenance not started");
                return;
            }
            let mut worker_tick = tokio::time::interval(self.maintenance.worker_sweep_interval());
            let mut request_tick = tokio::time::interval(self.maintenance.request_sweep_interval());

            loop {
                tokio::select! {
                    _ = worker_tick.tick() => {
                        let (evicted, failed) = self.sweep_workers().await;
                        if !evicted.is_empty() {
                            info!("Health sweep evicted {} worker(s), failed {} request(s)", evicted.len(), failed);
                        }
                    }
                    _ = request_tick.tick() => {
                        self.sweep_requests().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Maintenance loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Stop accepting work, terminate every tracked request and close worker
    /// connections. Only the first call has any effect.
    pub async fn shutdown(&self, reason: &str) -> usize {
        if self.closing.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.shutdown_tx.send_replace(true);

        let drained = self.tracker.drain_all(reason).await;
        for (worker_id, channel) in self.registry.channels() {
            debug!("Closing connection to worker '{}'", worker_id);
            channel.close(reason);
        }

        info!("Dispatcher shut down, {} request(s) drained", drained);
        drained
    }

    /// Pool and request aggregates
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            workers: self.registry.stats(),
            requests: self.tracker.stats(),
        }
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.registry.snapshot()
    }

    pub fn requests(&self) -> Vec<RequestSnapshot> {
        self.tracker.active()
    }

    /// Prometheus exposition text; empty when metrics are disabled
    pub fn metrics_text(&self) -> String {
        if !self.metrics_enabled {
            return String::new();
        }
        METRICS.gather()
    }
}
