//! Tussle — rate-paced workload execution and maximum sustainable throughput search.
//!
//! Tussle drives an operation (an in-process call or an external process) at a
//! precisely paced target rate, measures how long each operation took and how late it
//! completed relative to its schedule, and searches for the highest rate that keeps
//! every configured latency SLA.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Workload`]: the operation under test. Any async closure returning
//!   `Result<bool, BoxError>` is one; [`ProcessWorkload`] runs an external command.
//! - [`RateScheduler`]: paces a workload at a fixed rate for a fixed duration. Three
//!   strategies are provided ([`SingleThreadScheduler`], [`PoolScheduler`],
//!   [`AsyncScheduler`]), selected by [`SchedulerKind`].
//! - [`TimeRecorder`]: concurrent recorder for service time (`finish - start`) and
//!   response time (`finish - intended`). Periodic snapshots hand out interval
//!   histograms without stopping writers.
//! - [`MovingWindowAggregator`]: running sum of the interval histograms in the last
//!   N ms, maintained by adding new snapshots and subtracting expired ones.
//! - [`SlaRule`]: a (percentile, max ms, window) bound evaluated against a moving
//!   window.
//! - [`Scenario`]: glue binding a named workload to its scheduler.
//! - [`StepSearch`]: runs a scenario repeatedly, stepping the rate up after each
//!   accepted run and down after each rejected one until the boundary is bracketed.
//! - [`Report`] / [`Reporter`]: summaries of runs and searches, and where they go.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use tussle::{
//!     Reporter, Scenario, SchedulerKind, SlaRule, StepSearch,
//!     report::{LogReporter, SearchReport},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let scenario = Scenario::builder()
//!         .name("sleepy")
//!         .workload(Arc::new(|| async {
//!             tokio::time::sleep(Duration::from_millis(2)).await;
//!             Ok::<_, tussle::BoxError>(true)
//!         }))
//!         .scheduler(SchedulerKind::Async { max_in_flight: None }.build())
//!         .build();
//!
//!     let outcome = StepSearch::builder()
//!         .scenario(scenario)
//!         .initial_rate(500.0)
//!         .run_time(Duration::from_secs(20))
//!         .rules(vec![SlaRule::new(99.0, 10.0, 5)?])
//!         .build()
//!         .run()
//!         .await?;
//!
//!     LogReporter.report(&SearchReport::from(&outcome)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `builtins`: the `sleep` and `string` workloads in
//!   [`WorkloadRegistry::with_builtins`] and the `tussle` binary. (Enabled by default)
//! - `internals`: exposes the pacing schedule and the writer/reader phaser.

/// Error taxonomy
pub mod error;
/// Orchestrators that pace workloads
pub mod executor;
/// Aggregates and moving windows
pub mod aggregate;
pub mod config;
pub mod histogram;
/// HdrHistogram interval log output
pub mod hlog;
pub mod interval;
/// External process execution
pub mod process;
pub mod recorder;
/// Reports and Reporters
pub mod report;
/// Named workload plus scheduler
pub mod scenario;
/// Maximum sustainable rate search
pub mod search;
pub mod sla;
pub mod workload;

pub use aggregate::{Aggregate, MovingWindowAggregator};
pub use error::{BoxError, Error, Result, SearchError};
pub use executor::{
    AsyncScheduler, PoolScheduler, RateScheduler, RunResult, SchedulerKind, SingleThreadScheduler,
};
pub use histogram::HistogramSnapshot;
pub use interval::Interval;
pub use process::{ProcessOutcome, ProcessRequest, ProcessRunner};
pub use recorder::{IntervalSnapshot, TimeRecorder};
pub use report::{Report, Reporter};
pub use scenario::Scenario;
pub use search::{SearchOutcome, StepSearch, Termination};
pub use sla::{LatencyKind, SlaRule, SlaVerdict};
pub use workload::{ProcessWorkload, Workload, WorkloadParams, WorkloadRegistry};
