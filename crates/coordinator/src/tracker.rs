//! In-flight request bookkeeping
//!
//! The tracker holds one record per accepted request together with the send
//! side of its result channel. It never talks to workers; it only knows when
//! a request started, who is handling it and how to terminate its stream when
//! the request expires or the coordinator shuts down.

use crate::channel::{deliver, ResultEvent, ResultSender};
use crate::clock::{elapsed, Clock};
use crate::round2;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use workerbridge_common::config::QueueSettings;
use workerbridge_common::error::{BridgeError, Result};
use workerbridge_common::METRICS;

/// How a tracked request left the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    Cancelled,
    TimedOut,
    /// Worker reported an error or disconnected mid-request
    Failed,
}

/// A request accepted for processing
pub struct TrackedRequest {
    pub id: String,
    pub payload: serde_json::Value,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    pub assigned_worker_id: Option<String>,
    result_tx: ResultSender,
}

impl TrackedRequest {
    pub fn wait_time(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.created_at, now)
    }

    /// Expired once the wait strictly exceeds the timeout
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.wait_time(now) > self.timeout
    }

    fn snapshot(&self, now: DateTime<Utc>) -> RequestSnapshot {
        RequestSnapshot {
            request_id: self.id.clone(),
            model_name: self.model_name.clone(),
            payload: self.payload.clone(),
            created_at: self.created_at,
            wait_time: round2(self.wait_time(now).as_secs_f64()),
            timeout_seconds: self.timeout.as_secs_f64(),
            assigned_worker_id: self.assigned_worker_id.clone(),
            is_expired: self.is_expired(now),
        }
    }
}

/// Point-in-time view of a tracked request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSnapshot {
    pub request_id: String,
    pub model_name: String,
    #[serde(skip)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub wait_time: f64,
    pub timeout_seconds: f64,
    pub assigned_worker_id: Option<String>,
    pub is_expired: bool,
}

/// Tracker-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerStats {
    pub active_requests: usize,
    pub total_requests: u64,
    pub total_completed: u64,
    pub total_timeouts: u64,
    pub total_cancelled: u64,
    pub total_failed: u64,
    pub avg_wait_time: f64,
    pub max_wait_seconds: u64,
    pub reject_when_no_workers: bool,
}

#[derive(Default)]
struct TrackerState {
    requests: HashMap<String, TrackedRequest>,
    total_requests: u64,
    total_completed: u64,
    total_timeouts: u64,
    total_cancelled: u64,
    total_failed: u64,
    drained: bool,
}

impl TrackerState {
    fn record(&mut self, request: &TrackedRequest, outcome: RequestOutcome, now: DateTime<Utc>) {
        let wait = request.wait_time(now);
        match outcome {
            RequestOutcome::Completed => {
                self.total_completed += 1;
                METRICS.requests.completed.inc();
                info!(
                    "Request '{}' completed in {:.2}s by worker '{}'",
                    request.id,
                    wait.as_secs_f64(),
                    request.assigned_worker_id.as_deref().unwrap_or("-")
                );
            }
            RequestOutcome::TimedOut => {
                self.total_timeouts += 1;
                METRICS.requests.timed_out.inc();
                warn!(
                    "Request '{}' timed out after {:.2}s",
                    request.id,
                    wait.as_secs_f64()
                );
            }
            RequestOutcome::Cancelled => {
                self.total_cancelled += 1;
                METRICS.requests.cancelled.inc();
                info!("Request '{}' cancelled", request.id);
            }
            RequestOutcome::Failed => {
                self.total_failed += 1;
                METRICS.requests.failed.inc();
                warn!("Request '{}' failed", request.id);
            }
        }
        METRICS.requests.duration.observe(wait.as_secs_f64());
        METRICS.requests.active.set(self.requests.len() as i64);
    }
}

/// Tracker of in-flight requests
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    max_wait: Duration,
    reject_when_no_workers: bool,
    delivery_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RequestTracker {
    /// Create a new tracker
    pub fn new(settings: &QueueSettings, delivery_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        info!(
            "RequestTracker initialized. Max wait: {}s, reject when no workers: {}",
            settings.max_wait_seconds, settings.reject_when_no_workers
        );

        Self {
            state: Mutex::new(TrackerState::default()),
            max_wait: settings.max_wait(),
            reject_when_no_workers: settings.reject_when_no_workers,
            delivery_timeout,
            clock,
        }
    }

    /// Start tracking a request; `timeout` falls back to `max_wait_seconds`
    pub fn track(
        &self,
        request_id: &str,
        payload: serde_json::Value,
        model_name: &str,
        result_tx: ResultSender,
        timeout: Option<Duration>,
    ) -> Result<RequestSnapshot> {
        let mut state = self.state.lock();

        if state.drained {
            return Err(BridgeError::ShuttingDown(format!(
                "request '{}' refused",
                request_id
            )));
        }
        if state.requests.contains_key(request_id) {
            warn!("Request '{}' is already being tracked", request_id);
            return Err(BridgeError::DuplicateRequest(request_id.to_string()));
        }

        let now = self.clock.now();
        let request = TrackedRequest {
            id: request_id.to_string(),
            payload,
            model_name: model_name.to_string(),
            created_at: now,
            timeout: timeout.unwrap_or(self.max_wait),
            assigned_worker_id: None,
            result_tx,
        };
        let snapshot = request.snapshot(now);

        state.requests.insert(request_id.to_string(), request);
        state.total_requests += 1;
        METRICS.requests.accepted.inc();
        METRICS.requests.active.set(state.requests.len() as i64);

        info!(
            "Request '{}' added to tracking. Total active: {}",
            request_id,
            state.requests.len()
        );
        Ok(snapshot)
    }

    /// Record which worker handles a request
    pub fn assign(&self, request_id: &str, worker_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.requests.get_mut(request_id) {
            Some(request) => {
                request.assigned_worker_id = Some(worker_id.to_string());
                info!("Request '{}' assigned to worker '{}'", request_id, worker_id);
                true
            }
            None => {
                error!("Request assign: '{}' not found", request_id);
                false
            }
        }
    }

    /// Snapshot of a tracked request
    pub fn get(&self, request_id: &str) -> Option<RequestSnapshot> {
        let state = self.state.lock();
        state
            .requests
            .get(request_id)
            .map(|r| r.snapshot(self.clock.now()))
    }

    /// Push an event into a tracked request's result channel
    pub async fn publish(&self, request_id: &str, event: ResultEvent) -> bool {
        let tx = {
            let state = self.state.lock();
            match state.requests.get(request_id) {
                Some(request) => request.result_tx.clone(),
                None => {
                    debug!("Publish: request '{}' not tracked", request_id);
                    return false;
                }
            }
        };

        match deliver(&tx, event, self.delivery_timeout).await {
            Ok(()) => true,
            Err(e) => {
                METRICS.requests.delivery_failures.inc();
                warn!("Result for request '{}' dropped: {}", request_id, e);
                false
            }
        }
    }

    /// Stop tracking a request
    pub fn remove(&self, request_id: &str, outcome: RequestOutcome) -> Option<RequestSnapshot> {
        let mut state = self.state.lock();
        let now = self.clock.now();

        let Some(request) = state.requests.remove(request_id) else {
            warn!("Request remove: '{}' not found", request_id);
            return None;
        };
        state.record(&request, outcome, now);
        Some(request.snapshot(now))
    }

    /// Evict expired requests, terminating each stream with a timeout error
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<TrackedRequest> = {
            let mut state = self.state.lock();
            let now = self.clock.now();

            let ids: Vec<String> = state
                .requests
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.id.clone())
                .collect();

            let mut expired = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(request) = state.requests.remove(&id) {
                    state.record(&request, RequestOutcome::TimedOut, now);
                    expired.push(request);
                }
            }
            expired
        };

        for request in &expired {
            let message = format!(
                "Request timed out after {} seconds",
                request.timeout.as_secs_f64()
            );
            self.terminate(request, message).await;
        }

        if !expired.is_empty() {
            info!("Removed {} expired request(s)", expired.len());
        }
        expired.len()
    }

    /// Terminate every tracked request for shutdown. Only the first call has
    /// any effect; later calls return 0.
    pub async fn drain_all(&self, reason: &str) -> usize {
        let drained: Vec<TrackedRequest> = {
            let mut state = self.state.lock();
            if state.drained {
                debug!("Tracker already drained");
                return 0;
            }
            state.drained = true;

            let now = self.clock.now();
            let requests: Vec<TrackedRequest> = state.requests.drain().map(|(_, r)| r).collect();
            for request in &requests {
                state.record(request, RequestOutcome::Cancelled, now);
            }
            requests
        };

        for request in &drained {
            self.terminate(request, reason.to_string()).await;
        }

        if !drained.is_empty() {
            info!("Cleared {} pending request(s)", drained.len());
        }
        drained.len()
    }

    async fn terminate(&self, request: &TrackedRequest, message: String) {
        // Each event is attempted on its own
        let error = deliver(&request.result_tx, ResultEvent::Error(message), self.delivery_timeout).await;
        let done = deliver(&request.result_tx, ResultEvent::Done, self.delivery_timeout).await;

        for e in [error.err(), done.err()].into_iter().flatten() {
            METRICS.requests.delivery_failures.inc();
            warn!(
                "Could not deliver termination to request '{}': {}",
                request.id, e
            );
        }
    }

    /// Snapshots of every tracked request
    pub fn active(&self) -> Vec<RequestSnapshot> {
        let state = self.state.lock();
        let now = self.clock.now();
        let mut snapshots: Vec<RequestSnapshot> =
            state.requests.values().map(|r| r.snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Tracker statistics
    pub fn stats(&self) -> TrackerStats {
        let state = self.state.lock();
        let now = self.clock.now();

        let active = state.requests.len();
        let avg_wait = if active > 0 {
            let total: f64 = state
                .requests
                .values()
                .map(|r| r.wait_time(now).as_secs_f64())
                .sum();
            total / active as f64
        } else {
            0.0
        };

        TrackerStats {
            active_requests: active,
            total_requests: state.total_requests,
            total_completed: state.total_completed,
            total_timeouts: state.total_timeouts,
            total_cancelled: state.total_cancelled,
            total_failed: state.total_failed,
            avg_wait_time: round2(avg_wait),
            max_wait_seconds: self.max_wait.as_secs(),
            reject_when_no_workers: self.reject_when_no_workers,
        }
    }

    /// Number of tracked requests
    pub fn len(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().requests.is_empty()
    }
}
