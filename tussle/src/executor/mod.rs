//! Executor — rate-paced execution of a workload
//!
//! A [`RateScheduler`] calls a [`Workload`] at a fixed target rate for a fixed duration
//! and records every completed operation into a shared [`TimeRecorder`]. Three
//! strategies implement the same contract:
//!
//! - [`SingleThreadScheduler`]: one dedicated thread paces and executes each operation
//!   synchronously. Simplest and most precise; an operation that takes longer than
//!   the schedule interval delays every operation behind it.
//! - [`PoolScheduler`]: one pacing thread hands each operation to whichever of `W`
//!   worker threads is free, over a rendezvous channel.
//! - [`AsyncScheduler`]: the pacing thread spawns every operation on the tokio runtime
//!   and moves on without waiting. Completions are recorded independently.
//!
//! # Pacing
//!
//! All strategies share the same schedule. With `interval = 1e9 / rate` ns, operation
//! `n` is intended to start at
//!
//! ```text
//! intended(n) = t0 + n * interval
//! ```
//!
//! Intended times never depend on when the previous operation actually ran. When the
//! system falls behind, operations start late but keep their original intended time,
//! so the backlog shows up in response time:
//!
//! ```text
//! service_time  = finish - start
//! response_time = finish - intended
//! ```
//!
//! Waiting for an intended time sleeps coarsely and busy-spins the final
//! sub-millisecond portion (see `pacing::sleep_until`).
//!
//! # Lifecycle
//! 1. Validate the rate (finite, positive) and duration (non-zero).
//! 2. Pace operations from `t0` until `t0 + duration`. No operation is issued with an
//!    intended time at or after the deadline, nor after the deadline has passed.
//! 3. Let every dispatched operation complete.
//! 4. Build the [`RunResult`]: `achieved_rate = completed / elapsed`, histograms taken
//!    from [`TimeRecorder::totals`].
//!
//! A workload returning `Ok(false)` counts as an operation error and the run goes on.
//! A workload returning `Err` or panicking aborts the run with [`Error::Execution`];
//! operations already dispatched are drained first.
//!
//! # Pitfalls
//! - The recorder's totals back the result, so use a fresh [`TimeRecorder`] per run.
//! - [`SingleThreadScheduler`] and [`PoolScheduler`] drive async workloads with
//!   `Handle::block_on` from their own threads; they must be used from inside a tokio
//!   runtime, like every scheduler.
//! - The async strategy does not bound in-flight operations by default. Overloaded
//!   targets can accumulate unbounded work; set `max_in_flight` to cap it.
mod nonblocking;
pub(crate) mod pacing;
mod pool;
mod single;

pub use nonblocking::AsyncScheduler;
pub use pool::PoolScheduler;
pub use single::SingleThreadScheduler;

#[cfg(feature = "internals")]
pub use pacing::{Schedule, sleep_until};

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::{
    error::{Error, Result},
    histogram::HistogramSnapshot,
    interval::Interval,
    recorder::{TimeRecorder, now_ms},
    workload::Workload,
};

/// Outcome of one scheduler run.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub label: String,
    pub target_rate: f64,
    /// Completed operations per second over the actual run duration.
    pub achieved_rate: f64,
    /// Completed operations, including those that reported failure.
    pub count: u64,
    pub errors: u64,
    pub duration: Duration,
    pub interval: Interval,
    pub service_time: HistogramSnapshot,
    pub response_time: HistogramSnapshot,
}

#[async_trait]
pub trait RateScheduler: Send + Sync {
    /// Run `workload` at `target_rate` ops/s for `duration`, recording into `recorder`.
    async fn run_workload(
        &self,
        label: &str,
        target_rate: f64,
        duration: Duration,
        workload: Arc<dyn Workload>,
        recorder: Arc<TimeRecorder>,
    ) -> Result<RunResult>;
}

/// Serializable choice of scheduling strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Single,
    Pool {
        threads: usize,
    },
    Async {
        #[serde(default)]
        max_in_flight: Option<usize>,
    },
}

impl SchedulerKind {
    pub fn build(&self) -> Arc<dyn RateScheduler> {
        match *self {
            Self::Single => Arc::new(SingleThreadScheduler),
            Self::Pool { threads } => Arc::new(PoolScheduler::builder().threads(threads).build()),
            Self::Async { max_in_flight } => {
                Arc::new(AsyncScheduler::builder().max_in_flight(max_in_flight).build())
            }
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::Pool { threads } => write!(f, "pool:{threads}"),
            Self::Async { max_in_flight: None } => f.write_str("async"),
            Self::Async {
                max_in_flight: Some(n),
            } => write!(f, "async:{n}"),
        }
    }
}

/// Parses `single`, `pool`, `pool:N`, `async` or `async:N`.
impl FromStr for SchedulerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s, None),
        };
        let count = |arg: &str| {
            arg.trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    Error::config(format!("invalid scheduler '{s}': expected a positive count"))
                })
        };
        match (name.trim(), arg) {
            ("single", None) => Ok(Self::Single),
            ("pool", None) => Ok(Self::Pool {
                threads: num_cpus::get(),
            }),
            ("pool", Some(n)) => Ok(Self::Pool { threads: count(n)? }),
            ("async", None) => Ok(Self::Async { max_in_flight: None }),
            ("async", Some(n)) => Ok(Self::Async {
                max_in_flight: Some(count(n)?),
            }),
            _ => Err(Error::config(format!(
                "unknown scheduler '{s}', expected single, pool[:N] or async[:N]"
            ))),
        }
    }
}

pub(crate) fn validate_run(target_rate: f64, duration: Duration) -> Result<()> {
    if !target_rate.is_finite() || target_rate <= 0.0 {
        return Err(Error::config(format!(
            "target rate must be positive and finite, got {target_rate}"
        )));
    }
    if duration.is_zero() {
        return Err(Error::config("run duration must be non-zero"));
    }
    Ok(())
}

/// Counters and failure slot shared by every thread or task of one run.
#[derive(Default)]
pub(crate) struct RunState {
    completed: AtomicU64,
    errors: AtomicU64,
    aborted: AtomicBool,
    failure: Mutex<Option<Error>>,
}

impl RunState {
    pub fn completed(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Keeps the first failure and tells everyone to stop issuing.
    pub fn fail(&self, error: Error) {
        self.aborted.store(true, Ordering::SeqCst);
        self.failure.lock().get_or_insert(error);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn finish(
        &self,
        label: &str,
        target_rate: f64,
        started_ms: i64,
        elapsed: Duration,
        recorder: &TimeRecorder,
    ) -> Result<RunResult> {
        if let Some(e) = self.failure.lock().take() {
            tracing::error!("Run '{label}' aborted: {e}");
            return Err(e);
        }
        let count = self.completed.load(Ordering::SeqCst);
        let errors = self.errors.load(Ordering::SeqCst);
        let secs = elapsed.as_secs_f64();
        let achieved_rate = if secs > 0.0 { count as f64 / secs } else { 0.0 };
        let totals = recorder.totals();
        tracing::info!(
            "Done running '{label}': {count} ops ({errors} errors) in {elapsed:.2?}, \
             {achieved_rate:.1} op/s of {target_rate:.1} target"
        );
        Ok(RunResult {
            label: label.to_string(),
            target_rate,
            achieved_rate,
            count,
            errors,
            duration: elapsed,
            interval: Interval::new(started_ms, now_ms().max(started_ms), label),
            service_time: totals.service,
            response_time: totals.response,
        })
    }
}

pub(crate) fn workload_error(label: &str, source: crate::error::BoxError) -> Error {
    Error::execution(format!("workload '{label}' failed"), source)
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> Error {
    Error::execution("scheduler thread failed", e)
}

pub(crate) fn panic_error(label: &str, payload: Box<dyn Any + Send>) -> Error {
    let message = match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast_ref::<&str>() {
            Some(message) => message.to_string(),
            None => "non-string panic payload".to_string(),
        },
    };
    Error::execution(format!("workload '{label}' panicked"), message)
}

/// One operation driven to completion from a non-runtime thread.
pub(crate) fn call_blocking(handle: &Handle, workload: &dyn Workload, label: &str) -> Result<bool> {
    match panic::catch_unwind(AssertUnwindSafe(|| handle.block_on(workload.call()))) {
        Ok(Ok(success)) => Ok(success),
        Ok(Err(e)) => Err(workload_error(label, e)),
        Err(payload) => Err(panic_error(label, payload)),
    }
}

/// One operation awaited on the runtime.
pub(crate) async fn call_async(workload: &dyn Workload, label: &str) -> Result<bool> {
    match AssertUnwindSafe(workload.call()).catch_unwind().await {
        Ok(Ok(success)) => Ok(success),
        Ok(Err(e)) => Err(workload_error(label, e)),
        Err(payload) => Err(panic_error(label, payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod validate_run {
        use super::*;

        #[test]
        fn rejects_bad_rates_and_durations() {
            let d = Duration::from_secs(1);
            assert!(validate_run(0.0, d).is_err());
            assert!(validate_run(-1.0, d).is_err());
            assert!(validate_run(f64::NAN, d).is_err());
            assert!(validate_run(f64::INFINITY, d).is_err());
            assert!(validate_run(10.0, Duration::ZERO).is_err());
            assert!(validate_run(0.5, d).is_ok());
        }
    }

    mod scheduler_kind {
        use super::*;

        #[test]
        fn parses_and_displays() {
            for s in ["single", "pool:4", "async", "async:64"] {
                let kind: SchedulerKind = s.parse().unwrap();
                assert_eq!(kind.to_string(), s);
            }
            assert!(matches!("pool".parse(), Ok(SchedulerKind::Pool { .. })));
            assert!("pool:0".parse::<SchedulerKind>().is_err());
            assert!("async:x".parse::<SchedulerKind>().is_err());
            assert!("threads".parse::<SchedulerKind>().is_err());
        }

        #[test]
        fn deserializes_tagged() {
            let k: SchedulerKind = serde_json::from_str(r#"{"kind":"pool","threads":3}"#).unwrap();
            assert_eq!(k, SchedulerKind::Pool { threads: 3 });
            let k: SchedulerKind = serde_json::from_str(r#"{"kind":"async"}"#).unwrap();
            assert_eq!(k, SchedulerKind::Async { max_in_flight: None });
        }
    }

    #[tokio::test]
    async fn every_strategy_rejects_zero_rate() {
        let workload: Arc<dyn Workload> = Arc::new(crate::workload::from_fn(|| true));
        for kind in ["single", "pool:2", "async"] {
            let scheduler = kind.parse::<SchedulerKind>().unwrap().build();
            let err = scheduler
                .run_workload(
                    "bad",
                    0.0,
                    Duration::from_secs(1),
                    workload.clone(),
                    Arc::new(TimeRecorder::new()),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{kind}");
        }
    }
}
