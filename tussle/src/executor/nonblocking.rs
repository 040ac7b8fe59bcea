use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    runtime::Handle,
    sync::{Notify, Semaphore},
};
use typed_builder::TypedBuilder;

use super::{
    RateScheduler, RunResult, RunState, call_async, join_error,
    pacing::{Schedule, sleep_until},
    validate_run,
};
use crate::{
    error::{Error, Result},
    recorder::{TimeRecorder, now_ms},
    workload::Workload,
};

/// Paces on a dedicated thread and spawns each operation on the tokio runtime.
///
/// The pacing thread never waits for an operation to complete, so a slow target does
/// not delay issuing. In-flight operations are unbounded unless `max_in_flight` is set,
/// in which case the pacing thread waits for a free slot (never past the deadline).
#[derive(Clone, Debug, Default, TypedBuilder)]
pub struct AsyncScheduler {
    #[builder(default)]
    pub max_in_flight: Option<usize>,
}

#[async_trait]
impl RateScheduler for AsyncScheduler {
    async fn run_workload(
        &self,
        label: &str,
        target_rate: f64,
        duration: Duration,
        workload: Arc<dyn Workload>,
        recorder: Arc<TimeRecorder>,
    ) -> Result<RunResult> {
        validate_run(target_rate, duration)?;
        if self.max_in_flight == Some(0) {
            return Err(Error::config("max_in_flight must be at least 1"));
        }
        tracing::info!(
            "Running '{label}' at {target_rate:.1} op/s for {duration:?} on the async runtime \
             (max in flight: {})",
            self.max_in_flight.map_or("unbounded".to_string(), |n| n.to_string())
        );

        let state = Arc::new(RunState::default());
        let in_flight = Arc::new(InFlight::default());
        let slots = self.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        let handle = Handle::current();
        let started_ms = now_ms();
        let schedule = {
            let state = state.clone();
            let recorder = recorder.clone();
            let in_flight = in_flight.clone();
            let label: Arc<str> = Arc::from(label);
            tokio::task::spawn_blocking(move || {
                let schedule = Schedule::new(Instant::now(), target_rate);
                let deadline = schedule.start() + duration;
                for n in 0.. {
                    let intended = schedule.intended(n);
                    let late = Instant::now() >= deadline;
                    if state.is_aborted() || intended >= deadline || late {
                        break;
                    }
                    sleep_until(intended);
                    let permit = match &slots {
                        Some(slots) => {
                            let acquire = slots.clone().acquire_owned();
                            let acquire = tokio::time::timeout_at(deadline.into(), acquire);
                            match handle.block_on(acquire) {
                                Ok(Ok(permit)) => Some(permit),
                                _ => break,
                            }
                        }
                        None => None,
                    };

                    let guard = in_flight.enter();
                    let workload = workload.clone();
                    let recorder = recorder.clone();
                    let state = state.clone();
                    let label = label.clone();
                    handle.spawn(async move {
                        let _guard = guard;
                        let _permit = permit;
                        if state.is_aborted() {
                            return;
                        }
                        let start = Instant::now();
                        match call_async(&*workload, &label).await {
                            Ok(success) => {
                                recorder.record_times(start, intended, Instant::now(), success);
                                state.completed(success);
                            }
                            Err(e) => state.fail(e),
                        }
                    });
                }
                schedule
            })
            .await
            .map_err(join_error)?
        };

        in_flight.drained().await;
        let elapsed = schedule.start().elapsed();
        state.finish(label, target_rate, started_ms, elapsed, &recorder)
    }
}

/// Counts operations that were spawned but have not completed yet.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
