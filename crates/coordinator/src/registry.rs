//! Worker pool management
//!
//! The registry is the single authority over which workers are connected,
//! whether they are healthy, and which of them holds which request. All pool
//! state sits behind one mutex; operations that read and then mutate the
//! pool (admission, select-and-claim, the health sweep) complete inside a
//! single critical section.

use crate::channel::WorkerChannel;
use crate::clock::{elapsed, Clock};
use crate::round2;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use workerbridge_common::config::{WorkerSettings, WORKER_TOKENS_ENV};
use workerbridge_common::error::{BridgeError, Result};
use workerbridge_common::METRICS;

/// Worker availability. A worker absent from the pool is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// A connected worker
pub struct Worker {
    pub id: String,
    auth_token: String,
    channel: Arc<dyn WorkerChannel>,
    pub status: WorkerStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_request_id: Option<String>,
    pub requests_processed: u64,
    pub total_processing_time: Duration,
    pub last_error: Option<String>,
}

impl Worker {
    fn new(id: String, auth_token: String, channel: Arc<dyn WorkerChannel>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            auth_token,
            channel,
            status: WorkerStatus::Idle,
            connected_at: now,
            last_heartbeat: now,
            current_request_id: None,
            requests_processed: 0,
            total_processing_time: Duration::ZERO,
            last_error: None,
        }
    }

    /// Mean processing time in seconds, 0 for a worker with no history
    pub fn avg_response_time(&self) -> f64 {
        if self.requests_processed == 0 {
            return 0.0;
        }
        self.total_processing_time.as_secs_f64() / self.requests_processed as f64
    }

    /// Whether the last heartbeat is more recent than `timeout`
    pub fn is_healthy(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        elapsed(self.last_heartbeat, now) < timeout
    }

    fn is_available(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == WorkerStatus::Idle && self.is_healthy(now, timeout)
    }

    fn snapshot(&self, now: DateTime<Utc>, timeout: Duration) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.id.clone(),
            status: self.status,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
            current_request_id: self.current_request_id.clone(),
            requests_processed: self.requests_processed,
            avg_response_time: round2(self.avg_response_time()),
            is_healthy: self.is_healthy(now, timeout),
            last_error: self.last_error.clone(),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("current_request_id", &self.current_request_id)
            .field("requests_processed", &self.requests_processed)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a worker for monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_request_id: Option<String>,
    pub requests_processed: u64,
    pub avg_response_time: f64,
    pub is_healthy: bool,
    pub last_error: Option<String>,
}

/// A worker claimed for one request
#[derive(Clone)]
pub struct WorkerClaim {
    pub worker_id: String,
    pub channel: Arc<dyn WorkerChannel>,
}

impl fmt::Debug for WorkerClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerClaim")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// Pool-wide aggregates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub unhealthy_workers: usize,
    pub total_requests_processed: u64,
    pub avg_response_time: f64,
    pub max_workers: usize,
}

/// Build the accepted token set.
///
/// A non-empty comma-separated `env_tokens` list wins over the static list.
pub fn load_auth_tokens(settings: &WorkerSettings, env_tokens: Option<&str>) -> HashSet<String> {
    if let Some(raw) = env_tokens.map(str::trim).filter(|raw| !raw.is_empty()) {
        let tokens: HashSet<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        info!(
            "Loaded {} worker token(s) from {} environment variable",
            tokens.len(),
            WORKER_TOKENS_ENV
        );
        return tokens;
    }

    let tokens: HashSet<String> = settings.valid_tokens.iter().cloned().collect();
    if tokens.is_empty() {
        warn!(
            "No valid worker tokens configured. Set {} or add valid_tokens to the config file",
            WORKER_TOKENS_ENV
        );
    } else {
        info!("Loaded {} worker token(s) from config file", tokens.len());
    }
    tokens
}

/// Registry of connected workers
pub struct WorkerRegistry {
    workers: Mutex<HashMap<String, Worker>>,
    valid_tokens: HashSet<String>,
    require_authentication: bool,
    max_workers: usize,
    health_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl WorkerRegistry {
    /// Create a registry; `env_tokens` overrides the configured token list
    pub fn new(settings: &WorkerSettings, env_tokens: Option<&str>, clock: Arc<dyn Clock>) -> Self {
        let registry = Self {
            workers: Mutex::new(HashMap::new()),
            valid_tokens: load_auth_tokens(settings, env_tokens),
            require_authentication: settings.require_authentication,
            max_workers: settings.max_workers,
            health_timeout: settings.health_timeout(),
            clock,
        };

        info!(
            "WorkerRegistry initialized. Max workers: {}, health timeout: {:?}",
            registry.max_workers, registry.health_timeout
        );
        registry
    }

    /// Check a worker token
    pub fn authenticate(&self, token: &str) -> bool {
        if !self.require_authentication {
            debug!("Worker authentication is disabled");
            return true;
        }

        let valid = self.valid_tokens.contains(token);
        if !valid {
            let prefix: String = token.chars().take(4).collect();
            warn!("Authentication failed for token: {}...", prefix);
        }
        valid
    }

    /// Admit a new worker
    pub fn register(&self, worker_id: &str, token: &str, channel: Arc<dyn WorkerChannel>) -> Result<()> {
        let mut workers = self.workers.lock();

        let admission = if workers.len() >= self.max_workers {
            Err(BridgeError::PoolFull(self.max_workers))
        } else if workers.contains_key(worker_id) {
            Err(BridgeError::DuplicateWorker(worker_id.to_string()))
        } else if !self.authenticate(token) {
            Err(BridgeError::Unauthorized(worker_id.to_string()))
        } else {
            Ok(())
        };

        if let Err(e) = admission {
            METRICS.pool.registrations_rejected.inc();
            warn!("Worker register rejected: {}", e);
            return Err(e);
        }

        let worker = Worker::new(
            worker_id.to_string(),
            token.to_string(),
            channel,
            self.clock.now(),
        );
        workers.insert(worker_id.to_string(), worker);
        Self::publish_gauges(&workers);

        info!(
            "Worker '{}' registered. Total workers: {}",
            worker_id,
            workers.len()
        );
        Ok(())
    }

    /// Remove a worker; the returned snapshot shows any request it was holding
    pub fn unregister(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        let mut workers = self.workers.lock();
        let now = self.clock.now();

        let Some(worker) = workers.remove(worker_id) else {
            warn!("Worker unregister: '{}' not found", worker_id);
            return None;
        };
        Self::publish_gauges(&workers);

        if let Some(request_id) = &worker.current_request_id {
            warn!(
                "Worker '{}' disconnected while processing request '{}'",
                worker_id, request_id
            );
        }
        info!(
            "Worker '{}' removed. Remaining workers: {}",
            worker_id,
            workers.len()
        );
        Some(worker.snapshot(now, self.health_timeout))
    }

    fn pick<'a>(
        workers: &'a HashMap<String, Worker>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Option<&'a Worker> {
        workers
            .values()
            .filter(|w| w.is_available(now, timeout))
            .min_by(|a, b| {
                a.avg_response_time()
                    .partial_cmp(&b.avg_response_time())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.requests_processed.cmp(&b.requests_processed))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    /// Least-loaded idle and healthy worker, without claiming it
    pub fn select_worker(&self) -> Option<WorkerSnapshot> {
        let workers = self.workers.lock();
        let now = self.clock.now();

        match Self::pick(&workers, now, self.health_timeout) {
            Some(worker) => {
                debug!(
                    "Selected worker '{}' (processed: {}, avg time: {:.2}s)",
                    worker.id,
                    worker.requests_processed,
                    worker.avg_response_time()
                );
                Some(worker.snapshot(now, self.health_timeout))
            }
            None => {
                debug!("No available workers found");
                None
            }
        }
    }

    /// Select the least-loaded worker and mark it busy with `request_id`
    pub fn select_and_claim(&self, request_id: &str) -> Option<WorkerClaim> {
        let mut workers = self.workers.lock();
        let now = self.clock.now();

        let Some(worker_id) = Self::pick(&workers, now, self.health_timeout).map(|w| w.id.clone()) else {
            warn!("No available worker for request '{}'", request_id);
            return None;
        };
        let worker = workers.get_mut(&worker_id)?;
        worker.status = WorkerStatus::Busy;
        worker.current_request_id = Some(request_id.to_string());
        let claim = WorkerClaim {
            worker_id,
            channel: Arc::clone(&worker.channel),
        };

        METRICS.pool.selections.inc();
        Self::publish_gauges(&workers);
        info!(
            "Worker '{}' claimed for request '{}'",
            claim.worker_id, request_id
        );
        Some(claim)
    }

    /// Mark a worker busy with `request_id`
    pub fn mark_busy(&self, worker_id: &str, request_id: &str) -> bool {
        let mut workers = self.workers.lock();
        let Some(worker) = workers.get_mut(worker_id) else {
            warn!("Mark busy: worker '{}' not found", worker_id);
            return false;
        };

        worker.status = WorkerStatus::Busy;
        worker.current_request_id = Some(request_id.to_string());
        Self::publish_gauges(&workers);
        info!("Worker '{}' now processing request '{}'", worker_id, request_id);
        true
    }

    /// Return a worker to idle after it finished a request
    pub fn mark_idle(&self, worker_id: &str, processing_time: Duration, error: Option<String>) -> bool {
        let mut workers = self.workers.lock();
        let Some(worker) = workers.get_mut(worker_id) else {
            warn!("Mark idle: worker '{}' not found", worker_id);
            return false;
        };

        worker.status = WorkerStatus::Idle;
        worker.requests_processed += 1;
        worker.total_processing_time += processing_time;
        worker.current_request_id = None;
        match &error {
            Some(e) => info!(
                "Worker '{}' failed: {}. Total processed: {}",
                worker_id, e, worker.requests_processed
            ),
            None => info!(
                "Worker '{}' completed. Total processed: {}",
                worker_id, worker.requests_processed
            ),
        }
        worker.last_error = error;

        METRICS.pool.processing_time.observe(processing_time.as_secs_f64());
        Self::publish_gauges(&workers);
        true
    }

    /// Undo a claim without counting a processed request. An error, if
    /// given, is kept as the worker's `last_error`.
    pub fn release(&self, worker_id: &str, error: Option<String>) -> bool {
        let mut workers = self.workers.lock();
        let Some(worker) = workers.get_mut(worker_id) else {
            warn!("Release: worker '{}' not found", worker_id);
            return false;
        };

        worker.status = WorkerStatus::Idle;
        worker.current_request_id = None;
        if error.is_some() {
            worker.last_error = error;
        }
        Self::publish_gauges(&workers);
        debug!("Worker '{}' released without processing", worker_id);
        true
    }

    /// Refresh a worker's heartbeat; false means it must re-register
    pub fn heartbeat(&self, worker_id: &str) -> bool {
        let mut workers = self.workers.lock();
        match workers.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = self.clock.now();
                true
            }
            None => {
                debug!("Heartbeat from unknown worker '{}'", worker_id);
                false
            }
        }
    }

    /// Remove every worker whose heartbeat is older than the health timeout
    pub fn sweep_unhealthy(&self) -> Vec<WorkerSnapshot> {
        let mut workers = self.workers.lock();
        let now = self.clock.now();

        let unhealthy: Vec<String> = workers
            .values()
            .filter(|w| !w.is_healthy(now, self.health_timeout))
            .map(|w| w.id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(unhealthy.len());
        for worker_id in unhealthy {
            if let Some(worker) = workers.remove(&worker_id) {
                warn!(
                    "Removing unhealthy worker '{}' (last heartbeat {})",
                    worker_id, worker.last_heartbeat
                );
                evicted.push(worker.snapshot(now, self.health_timeout));
            }
        }

        if !evicted.is_empty() {
            METRICS.pool.workers_evicted.inc_by(evicted.len() as u64);
            Self::publish_gauges(&workers);
            info!("Removed {} unhealthy worker(s)", evicted.len());
        }
        evicted
    }

    /// Snapshot of a single worker
    pub fn get(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        let workers = self.workers.lock();
        workers
            .get(worker_id)
            .map(|w| w.snapshot(self.clock.now(), self.health_timeout))
    }

    /// Channel of a connected worker
    pub fn channel(&self, worker_id: &str) -> Option<Arc<dyn WorkerChannel>> {
        let workers = self.workers.lock();
        workers.get(worker_id).map(|w| Arc::clone(&w.channel))
    }

    /// Whether `token` is the one `worker_id` registered with
    pub fn owns_token(&self, worker_id: &str, token: &str) -> bool {
        let workers = self.workers.lock();
        workers.get(worker_id).is_some_and(|w| w.auth_token == token)
    }

    /// Snapshots of every worker, ordered by id
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.lock();
        let now = self.clock.now();
        let mut snapshots: Vec<WorkerSnapshot> = workers
            .values()
            .map(|w| w.snapshot(now, self.health_timeout))
            .collect();
        snapshots.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        snapshots
    }

    /// Channels of every worker, for shutdown
    pub fn channels(&self) -> Vec<(String, Arc<dyn WorkerChannel>)> {
        let workers = self.workers.lock();
        workers
            .values()
            .map(|w| (w.id.clone(), Arc::clone(&w.channel)))
            .collect()
    }

    /// Pool-wide statistics
    pub fn stats(&self) -> PoolStats {
        let workers = self.workers.lock();
        let now = self.clock.now();

        let total_requests: u64 = workers.values().map(|w| w.requests_processed).sum();
        let total_time: f64 = workers
            .values()
            .map(|w| w.avg_response_time() * w.requests_processed as f64)
            .sum();
        let avg_response_time = if total_requests > 0 {
            total_time / total_requests as f64
        } else {
            0.0
        };

        PoolStats {
            total_workers: workers.len(),
            idle_workers: workers
                .values()
                .filter(|w| w.is_available(now, self.health_timeout))
                .count(),
            busy_workers: workers
                .values()
                .filter(|w| w.status == WorkerStatus::Busy)
                .count(),
            unhealthy_workers: workers
                .values()
                .filter(|w| !w.is_healthy(now, self.health_timeout))
                .count(),
            total_requests_processed: total_requests,
            avg_response_time: round2(avg_response_time),
            max_workers: self.max_workers,
        }
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    fn publish_gauges(workers: &HashMap<String, Worker>) {
        METRICS.pool.registered_workers.set(workers.len() as i64);
        METRICS.pool.busy_workers.set(
            workers
                .values()
                .filter(|w| w.status == WorkerStatus::Busy)
                .count() as i64,
        );
    }
}
