//! End-to-end dispatch scenarios driven through the public API.
//!
//! Time is controlled with [`ManualClock`]; no test sleeps on the wall clock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use workerbridge_common::config::{BridgeConfig, WorkerSettings};
use workerbridge_common::BridgeError;
use workerbridge_coordinator::channel::result_channel;
use workerbridge_coordinator::{
    Dispatcher, InboundRequest, ManualClock, MpscWorkerChannel, RequestTracker, ResultEvent,
    WorkerMessage, WorkerOutput, WorkerRegistry, WorkerStatus,
};

fn config(max_workers: usize) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.worker_settings = WorkerSettings {
        max_workers,
        valid_tokens: vec!["token-a".to_string()],
        ..WorkerSettings::default()
    };
    config
}

fn worker_channel() -> Arc<MpscWorkerChannel> {
    let (channel, _rx) = MpscWorkerChannel::new();
    Arc::new(channel)
}

// ---------------------------------------------------------------------------
// Registry scenarios
// ---------------------------------------------------------------------------

/// Register, claim, finish, and select again with the updated average.
#[test]
fn worker_busy_idle_round_trip() {
    let clock = ManualClock::new();
    let registry = WorkerRegistry::new(&config(10).worker_settings, None, Arc::new(clock));

    registry.register("w1", "token-a", worker_channel()).unwrap();
    let stats = registry.stats();
    assert_eq!((stats.total_workers, stats.idle_workers), (1, 1));

    assert_eq!(registry.select_worker().unwrap().worker_id, "w1");
    assert!(registry.mark_busy("w1", "r1"));
    assert!(registry.select_worker().is_none());

    assert!(registry.mark_idle("w1", Duration::from_secs_f64(2.5), None));
    let worker = registry.select_worker().unwrap();
    assert_eq!(worker.worker_id, "w1");
    assert_eq!(worker.avg_response_time, 2.5);
}

/// A pool of one admits a second worker only after the first leaves.
#[test]
fn capacity_is_enforced() {
    let registry = WorkerRegistry::new(&config(1).worker_settings, None, Arc::new(ManualClock::new()));

    registry.register("w1", "token-a", worker_channel()).unwrap();
    let err = registry.register("w2", "token-a", worker_channel()).unwrap_err();
    assert!(err.is_admission());

    registry.unregister("w1");
    registry.register("w2", "token-a", worker_channel()).unwrap();
}

/// Environment tokens replace the configured list entirely.
#[test]
fn env_tokens_override_config() {
    let registry = WorkerRegistry::new(
        &config(10).worker_settings,
        Some("env-1,env-2"),
        Arc::new(ManualClock::new()),
    );

    assert!(registry.authenticate("env-2"));
    assert!(!registry.authenticate("token-a"));
}

/// Racing registrations of one id admit exactly one worker.
#[test]
fn concurrent_duplicate_registration() {
    let registry = Arc::new(WorkerRegistry::new(
        &config(10).worker_settings,
        None,
        Arc::new(ManualClock::new()),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.register("same", "token-a", worker_channel()))
        })
        .collect();
    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(Result::is_ok)
        .count();

    assert_eq!(admitted, 1);
    assert_eq!(registry.len(), 1);
}

// ---------------------------------------------------------------------------
// Tracker scenarios
// ---------------------------------------------------------------------------

/// A zero-second request is evicted by the first sweep after any time passes.
#[tokio::test]
async fn zero_timeout_request_is_swept() {
    let clock = ManualClock::new();
    let tracker = RequestTracker::new(
        &BridgeConfig::default().queue_settings,
        Duration::from_millis(100),
        Arc::new(clock.clone()),
    );
    let (tx, mut rx) = result_channel(4);
    tracker
        .track("r1", serde_json::json!({}), "model-a", tx, Some(Duration::ZERO))
        .unwrap();

    clock.advance(Duration::from_millis(1));
    assert_eq!(tracker.sweep_expired().await, 1);

    assert!(matches!(rx.recv().await, Some(ResultEvent::Error(msg)) if msg.contains("timed out")));
    assert_eq!(rx.recv().await, Some(ResultEvent::Done));
    assert_eq!(rx.recv().await, None);
}

// ---------------------------------------------------------------------------
// Dispatcher scenarios
// ---------------------------------------------------------------------------

/// Many concurrent callers never share a worker; the surplus is rejected.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_claim_distinct_workers() {
    let dispatcher = Arc::new(Dispatcher::new(&config(3), None, Arc::new(ManualClock::new())));
    let mut transports = Vec::new();
    for id in ["w1", "w2", "w3"] {
        let (channel, rx) = MpscWorkerChannel::new();
        dispatcher.connect(id, "token-a", Arc::new(channel)).unwrap();
        transports.push(rx);
    }

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .accept(InboundRequest::new("model-a", serde_json::json!(i)))
                    .await
            })
        })
        .collect();

    let mut workers = HashSet::new();
    let mut rejected = 0;
    let mut submissions = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(submission) => {
                assert!(workers.insert(submission.worker_id.clone()));
                submissions.push(submission);
            }
            Err(BridgeError::WorkerUnavailable(_)) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(workers.len(), 3);
    assert_eq!(rejected, 9);
    assert_eq!(dispatcher.stats().workers.busy_workers, 3);
    assert_eq!(dispatcher.stats().requests.active_requests, 3);
}

/// Worker output streams back to the caller and frees the worker.
#[tokio::test]
async fn streamed_request_completes() {
    let clock = ManualClock::new();
    let dispatcher = Dispatcher::new(&config(2), None, Arc::new(clock.clone()));
    let (channel, mut transport) = MpscWorkerChannel::new();
    dispatcher.connect("w1", "token-a", Arc::new(channel)).unwrap();

    let mut submission = dispatcher
        .accept(InboundRequest::new("model-a", serde_json::json!({"prompt": "hello"})))
        .await
        .unwrap();
    let request_id = submission.request_id.clone();

    let Some(WorkerMessage::Job(job)) = transport.recv().await else {
        panic!("worker did not receive the job");
    };
    assert_eq!(job.request_id, request_id);
    assert_eq!(job.model_name, "model-a");

    for chunk in ["Hel", "lo"] {
        dispatcher
            .worker_result("w1", &request_id, WorkerOutput::Chunk(serde_json::json!(chunk)))
            .await;
    }
    clock.advance(Duration::from_secs(4));
    assert!(dispatcher.heartbeat("w1"));
    dispatcher
        .worker_result("w1", &request_id, WorkerOutput::Finished)
        .await;

    let mut events = Vec::new();
    while let Some(event) = submission.events.recv().await {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            ResultEvent::Data(serde_json::json!("Hel")),
            ResultEvent::Data(serde_json::json!("lo")),
            ResultEvent::Done,
        ]
    );

    let worker = dispatcher.registry().get("w1").unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    assert_eq!(worker.avg_response_time, 4.0);
    assert_eq!(dispatcher.stats().requests.total_completed, 1);
}

/// An expired request is terminated, and its worker is freed once it
/// reports the end of the abandoned request.
#[tokio::test]
async fn expired_request_then_late_worker_output() {
    let clock = ManualClock::new();
    let dispatcher = Dispatcher::new(&config(2), None, Arc::new(clock.clone()));
    let (channel, _transport) = MpscWorkerChannel::new();
    dispatcher.connect("w1", "token-a", Arc::new(channel)).unwrap();

    let mut submission = dispatcher
        .accept(
            InboundRequest::new("model-a", serde_json::Value::Null)
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    clock.advance(Duration::from_secs(6));
    assert!(dispatcher.heartbeat("w1"));
    let report = dispatcher.sweep().await;
    assert_eq!(report.requests_expired, 1);
    assert_eq!(report.workers_evicted, 0);

    assert_eq!(
        submission.events.recv().await,
        Some(ResultEvent::Error("Request timed out after 5 seconds".to_string()))
    );
    assert_eq!(submission.events.recv().await, Some(ResultEvent::Done));

    assert!(dispatcher.registry().select_worker().is_none());
    dispatcher
        .worker_result("w1", &submission.request_id, WorkerOutput::Finished)
        .await;
    assert_eq!(dispatcher.registry().select_worker().unwrap().worker_id, "w1");
}

/// Shutdown terminates every open stream exactly once.
#[tokio::test]
async fn shutdown_drains_every_request() {
    let dispatcher = Dispatcher::new(&config(4), None, Arc::new(ManualClock::new()));
    let mut transports = Vec::new();
    for id in ["w1", "w2", "w3"] {
        let (channel, rx) = MpscWorkerChannel::new();
        dispatcher.connect(id, "token-a", Arc::new(channel)).unwrap();
        transports.push(rx);
    }

    let mut submissions = Vec::new();
    for _ in 0..3 {
        submissions.push(
            dispatcher
                .accept(InboundRequest::new("model-a", serde_json::Value::Null))
                .await
                .unwrap(),
        );
    }

    assert_eq!(dispatcher.shutdown("Server is shutting down").await, 3);
    assert_eq!(dispatcher.requests().len(), 0);

    for submission in submissions {
        let events: Vec<ResultEvent> = submission.into_stream().collect().await;
        assert_eq!(
            events,
            vec![
                ResultEvent::Error("Server is shutting down".to_string()),
                ResultEvent::Done,
            ]
        );
    }
}
