use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use crossbeam::channel::{self, Receiver};
use tokio::runtime::Handle;
use typed_builder::TypedBuilder;

use super::{
    RateScheduler, RunResult, RunState, call_blocking, join_error,
    pacing::{Schedule, sleep_until},
    validate_run,
};
use crate::{
    error::{Error, Result},
    recorder::{TimeRecorder, now_ms},
    workload::Workload,
};

/// One pacing thread feeding a fixed pool of worker threads.
///
/// Operation `n` is handed over a zero-capacity channel to whichever worker is free.
/// When every worker is busy the pacing thread blocks on the hand-over, and the
/// operation still carries its original intended time.
#[derive(Clone, Debug, TypedBuilder)]
pub struct PoolScheduler {
    #[builder(default = num_cpus::get())]
    pub threads: usize,
}

#[async_trait]
impl RateScheduler for PoolScheduler {
    async fn run_workload(
        &self,
        label: &str,
        target_rate: f64,
        duration: Duration,
        workload: Arc<dyn Workload>,
        recorder: Arc<TimeRecorder>,
    ) -> Result<RunResult> {
        validate_run(target_rate, duration)?;
        if self.threads == 0 {
            return Err(Error::config("worker pool needs at least one thread"));
        }
        tracing::info!(
            "Running '{label}' at {target_rate:.1} op/s for {duration:?} on {} worker threads",
            self.threads
        );

        let state = Arc::new(RunState::default());
        let handle = Handle::current();
        let threads = self.threads;
        let started_ms = now_ms();
        let elapsed = {
            let state = state.clone();
            let recorder = recorder.clone();
            let label = label.to_string();
            tokio::task::spawn_blocking(move || {
                let (tx, rx) = channel::bounded::<Instant>(0);
                let schedule = Schedule::new(Instant::now(), target_rate);
                let deadline = schedule.start() + duration;
                std::thread::scope(|scope| {
                    for id in 0..threads {
                        let ctx = WorkerContext {
                            id,
                            rx: rx.clone(),
                            handle: &handle,
                            workload: &*workload,
                            recorder: &recorder,
                            state: &state,
                            label: &label,
                        };
                        scope.spawn(move || ctx.run());
                    }
                    drop(rx);

                    for n in 0.. {
                        let intended = schedule.intended(n);
                        let late = Instant::now() >= deadline;
                        if state.is_aborted() || intended >= deadline || late {
                            break;
                        }
                        sleep_until(intended);
                        // timed out or every worker is gone
                        if tx.send_deadline(intended, deadline).is_err() {
                            break;
                        }
                    }
                    // workers drain and exit once the sender is gone
                    drop(tx);
                });
                schedule.start().elapsed()
            })
            .await
            .map_err(join_error)?
        };

        state.finish(label, target_rate, started_ms, elapsed, &recorder)
    }
}

struct WorkerContext<'a> {
    id: usize,
    rx: Receiver<Instant>,
    handle: &'a Handle,
    workload: &'a dyn Workload,
    recorder: &'a TimeRecorder,
    state: &'a RunState,
    label: &'a str,
}

impl WorkerContext<'_> {
    fn run(self) {
        tracing::debug!("Worker {} of '{}' started", self.id, self.label);
        let mut done = 0u64;
        for intended in self.rx.iter() {
            if self.state.is_aborted() {
                continue;
            }
            let start = Instant::now();
            match call_blocking(self.handle, self.workload, self.label) {
                Ok(success) => {
                    self.recorder.record_times(start, intended, Instant::now(), success);
                    self.state.completed(success);
                    done += 1;
                }
                Err(e) => self.state.fail(e),
            }
        }
        tracing::debug!("Worker {} of '{}' stopped after {done} ops", self.id, self.label);
    }
}
