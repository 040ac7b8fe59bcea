use std::{sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use tokio::runtime::Handle;

use super::{
    RateScheduler, RunResult, RunState, call_blocking, join_error,
    pacing::{Schedule, sleep_until},
    validate_run,
};
use crate::{
    error::Result,
    recorder::{TimeRecorder, now_ms},
    workload::Workload,
};

/// Paces and executes every operation on one dedicated thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleThreadScheduler;

#[async_trait]
impl RateScheduler for SingleThreadScheduler {
    async fn run_workload(
        &self,
        label: &str,
        target_rate: f64,
        duration: Duration,
        workload: Arc<dyn Workload>,
        recorder: Arc<TimeRecorder>,
    ) -> Result<RunResult> {
        validate_run(target_rate, duration)?;
        tracing::info!(
            "Running '{label}' at {target_rate:.1} op/s for {duration:?} on a single thread"
        );

        let state = Arc::new(RunState::default());
        let handle = Handle::current();
        let started_ms = now_ms();
        let elapsed = {
            let state = state.clone();
            let recorder = recorder.clone();
            let label = label.to_string();
            tokio::task::spawn_blocking(move || {
                let schedule = Schedule::new(Instant::now(), target_rate);
                let deadline = schedule.start() + duration;
                for n in 0.. {
                    let intended = schedule.intended(n);
                    if intended >= deadline || Instant::now() >= deadline {
                        break;
                    }
                    sleep_until(intended);
                    let start = Instant::now();
                    match call_blocking(&handle, &*workload, &label) {
                        Ok(success) => {
                            recorder.record_times(start, intended, Instant::now(), success);
                            state.completed(success);
                        }
                        Err(e) => {
                            state.fail(e);
                            break;
                        }
                    }
                }
                schedule.start().elapsed()
            })
            .await
            .map_err(join_error)?
        };

        state.finish(label, target_rate, started_ms, elapsed, &recorder)
    }
}
