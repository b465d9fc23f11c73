//! WorkerBridge Coordinator
//!
//! Dispatch engine routing generation requests to a pool of remotely
//! connected workers.

pub mod channel;
pub mod clock;
pub mod dispatcher;
pub mod registry;
pub mod tracker;

pub use channel::{MpscWorkerChannel, ResultEvent, WorkerChannel, WorkerJob, WorkerMessage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchStats, Dispatcher, InboundRequest, Submission, SweepReport, WorkerOutput};
pub use registry::{WorkerRegistry, WorkerSnapshot, WorkerStatus};
pub use tracker::{RequestOutcome, RequestSnapshot, RequestTracker};

/// Round to two decimals for reporting
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
