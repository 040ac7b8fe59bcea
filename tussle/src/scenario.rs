use std::{fmt, sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    executor::{RateScheduler, RunResult, SchedulerKind},
    recorder::TimeRecorder,
    workload::Workload,
};

/// A named workload bound to the scheduler that paces it.
///
/// ```rust,no_run
/// # async fn demo() -> tussle::Result<()> {
/// use std::{sync::Arc, time::Duration};
/// use tussle::{Scenario, SchedulerKind, TimeRecorder, workload::from_fn};
///
/// let scenario = Scenario::builder()
///     .name("noop")
///     .workload(Arc::new(from_fn(|| true)))
///     .scheduler(SchedulerKind::Pool { threads: 4 }.build())
///     .build();
/// let result = scenario
///     .run(500.0, Duration::from_secs(5), Arc::new(TimeRecorder::new()))
///     .await?;
/// println!("{:.1} op/s", result.achieved_rate);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub workload: Arc<dyn Workload>,
    #[builder(default = SchedulerKind::Single.build())]
    pub scheduler: Arc<dyn RateScheduler>,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Scenario {
    pub async fn run(
        &self,
        target_rate: f64,
        duration: Duration,
        recorder: Arc<TimeRecorder>,
    ) -> Result<RunResult> {
        self.run_as(&self.name, target_rate, duration, recorder).await
    }

    /// Like [`run`](Self::run) with a custom label for logs and the result.
    pub async fn run_as(
        &self,
        label: &str,
        target_rate: f64,
        duration: Duration,
        recorder: Arc<TimeRecorder>,
    ) -> Result<RunResult> {
        self.scheduler
            .run_workload(label, target_rate, duration, self.workload.clone(), recorder)
            .await
    }

    /// Returns the workload to a fresh state between runs.
    pub async fn reset(&self) -> Result<()> {
        tracing::debug!("Resetting '{}'", self.name);
        self.workload
            .reset()
            .await
            .map_err(|e| Error::execution(format!("workload '{}' failed to reset", self.name), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::from_fn;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_with_default_scheduler() {
        let scenario = Scenario::builder()
            .name("noop")
            .workload(Arc::new(from_fn(|| true)))
            .build();
        let result = scenario
            .run(200.0, Duration::from_millis(500), Arc::new(TimeRecorder::new()))
            .await
            .unwrap();
        assert_eq!(result.label, "noop");
        assert!((99..=101).contains(&result.count), "{}", result.count);
        assert_eq!(result.service_time.count(), result.count);
    }

    struct Unresettable;

    #[async_trait::async_trait]
    impl Workload for Unresettable {
        async fn call(&self) -> std::result::Result<bool, crate::BoxError> {
            Ok(true)
        }

        async fn reset(&self) -> std::result::Result<(), crate::BoxError> {
            Err("connection pool stuck".into())
        }
    }

    #[tokio::test]
    async fn reset_failure_names_the_scenario() {
        let scenario = Scenario::builder()
            .name("db")
            .workload(Arc::new(Unresettable))
            .build();
        let err = scenario.reset().await.unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
        assert_eq!(err.to_string(), "workload 'db' failed to reset: connection pool stuck");

        let noop = Scenario::builder()
            .name("noop")
            .workload(Arc::new(from_fn(|| true)))
            .build();
        noop.reset().await.unwrap();
    }
}
