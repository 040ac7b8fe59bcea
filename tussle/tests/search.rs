//! Step search end to end, against workloads whose latency depends on the rate.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tussle::{
    BoxError, Error, Scenario, SlaRule, SlaVerdict, StepSearch, Termination, Workload,
    report::SearchReport, workload::from_fn,
};

/// Gets slow (8ms) once callers arrive faster than 100/s, stays fast (1ms) below.
#[derive(Default)]
struct Saturating {
    gaps: Mutex<(Option<Instant>, VecDeque<Duration>)>,
}

impl Saturating {
    const KNEE: Duration = Duration::from_millis(10);
    const SAMPLES: usize = 10;

    fn mean_gap(&self) -> Option<Duration> {
        let mut state = self.gaps.lock();
        let now = Instant::now();
        if let Some(last) = state.0.replace(now) {
            let gap = now - last;
            if gap < Duration::from_secs(1) {
                state.1.push_back(gap);
                if state.1.len() > Self::SAMPLES {
                    state.1.pop_front();
                }
            }
        }
        let n = state.1.len() as u32;
        (n > 0).then(|| state.1.iter().sum::<Duration>() / n)
    }
}

#[async_trait::async_trait]
impl Workload for Saturating {
    async fn call(&self) -> Result<bool, BoxError> {
        let busy = self.mean_gap().is_some_and(|g| g < Self::KNEE);
        let work = if busy { 8 } else { 1 };
        tokio::time::sleep(Duration::from_millis(work)).await;
        Ok(true)
    }
}

fn scenario(workload: Arc<dyn Workload>) -> Scenario {
    Scenario::builder()
        .name("saturating")
        .workload(workload)
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn converges_on_the_knee_from_below() {
    let outcome = StepSearch::builder()
        .scenario(scenario(Arc::new(Saturating::default())))
        .initial_rate(80.0)
        .run_time(Duration::from_secs(3))
        .interval_length(Duration::from_millis(500))
        .rules(vec![SlaRule::new(50.0, 5.0, 10).unwrap()])
        .build()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::Converged);
    let max = outcome.max_rate.unwrap();
    assert!(max > 90.0 && max < 110.0, "{max:.1}");

    let last = outcome.history.last().unwrap();
    assert!(!last.accepted);
    assert_eq!(last.verdicts[0].verdict, SlaVerdict::Violated);
    assert!(outcome.history[..outcome.history.len() - 1].iter().all(|s| s.accepted));

    let report = SearchReport::from(&outcome);
    assert_eq!(report.steps.len(), outcome.history.len());
    assert!(report.to_string().contains("max sustainable rate"));

    // the rejected step is the only one that broke the SLA
    assert_eq!(report.sla_breaks.len(), 1);
    let broken_at = report.sla_breaks[0].broken_at.unwrap();
    assert_eq!(broken_at, last.target_rate);
    assert!(report.to_string().contains("broken at"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn converges_on_the_knee_from_above() {
    let outcome = StepSearch::builder()
        .scenario(scenario(Arc::new(Saturating::default())))
        .initial_rate(200.0)
        .run_time(Duration::from_secs(1))
        .interval_length(Duration::from_millis(250))
        .rules(vec![SlaRule::new(50.0, 5.0, 10).unwrap()])
        .build()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::Converged);
    assert!(!outcome.history[0].accepted);
    let rates: Vec<f64> = outcome.history.iter().map(|s| s.target_rate).collect();
    assert!(rates.windows(2).take_while(|w| w[1] < w[0]).count() >= 5, "{rates:?}");
    let max = outcome.max_rate.unwrap();
    assert!(max > 90.0 && max < 110.0, "{max:.1}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stops_after_max_steps() {
    let outcome = StepSearch::builder()
        .scenario(scenario(Arc::new(from_fn(|| true))))
        .initial_rate(100.0)
        .run_time(Duration::from_millis(500))
        .max_steps(3)
        .target_factor(None)
        .build()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::MaxStepsReached);
    assert!(outcome.initial.is_none());
    let rates: Vec<f64> = outcome.history.iter().map(|s| s.target_rate).collect();
    assert_eq!(rates.len(), 3);
    assert!((rates[1] - 110.0).abs() < 1e-9 && (rates[2] - 121.0).abs() < 1e-9, "{rates:?}");
    assert!(outcome.max_rate.unwrap() > 110.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_run_keeps_completed_steps() {
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    let workload: Arc<dyn Workload> = Arc::new(move || {
        let counter = counter.clone();
        async move {
            // steps 1 and 2 issue 100 + 110 operations
            if counter.fetch_add(1, Ordering::Relaxed) >= 250 {
                return Err::<bool, BoxError>("backend went away".into());
            }
            Ok(true)
        }
    });

    let err = StepSearch::builder()
        .scenario(scenario(workload))
        .initial_rate(100.0)
        .run_time(Duration::from_secs(1))
        .max_steps(10)
        .build()
        .run()
        .await
        .unwrap_err();

    let Error::Search(e) = err else {
        panic!("expected a search error, got {err}");
    };
    assert_eq!(e.step, 3);
    assert_eq!(e.history.len(), 2);
    assert_eq!(e.accepted().count(), 2);
    assert!(matches!(e.source, Error::Execution { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn boundary_retries_rerun_the_rejected_rate() {
    let outcome = StepSearch::builder()
        .scenario(scenario(Arc::new(Saturating::default())))
        .initial_rate(96.0)
        .run_time(Duration::from_secs(1))
        .interval_length(Duration::from_millis(250))
        .rules(vec![SlaRule::new(50.0, 5.0, 10).unwrap()])
        .boundary_retries(1)
        .build()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::Converged);
    let rejected: Vec<f64> = outcome
        .history
        .iter()
        .filter(|s| !s.accepted)
        .map(|s| s.target_rate)
        .collect();
    assert_eq!(rejected.len(), 2, "{rejected:?}");
    assert_eq!(rejected[0], rejected[1]);
}

/// Counts calls and resets.
#[derive(Default)]
struct Counting {
    calls: AtomicU64,
    resets: AtomicU64,
}

#[async_trait::async_trait]
impl Workload for Counting {
    async fn call(&self) -> Result<bool, BoxError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn reset(&self) -> Result<(), BoxError> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initial_run_warms_up_before_step_one() {
    let workload = Arc::new(Counting::default());
    let outcome = StepSearch::builder()
        .scenario(scenario(workload.clone()))
        .initial_rate(100.0)
        .run_time(Duration::from_millis(500))
        .max_steps(1)
        .target_factor(None)
        .initial_run_rate(40.0)
        .initial_warmup_time(Duration::from_millis(500))
        .initial_run_time(Duration::from_secs(1))
        .build()
        .run()
        .await
        .unwrap();

    let initial = outcome.initial.as_ref().unwrap();
    assert_eq!(initial.target_rate, 40.0);
    assert!((39..=41).contains(&initial.count), "{}", initial.count);
    // the initial run is not a step
    assert_eq!(outcome.history.len(), 1);
    assert_eq!(outcome.history[0].target_rate, 100.0);

    // 20 warmup calls at 40/s, then the initial run, then step 1
    let calls = workload.calls.load(Ordering::Relaxed);
    let warmup = calls - initial.count - outcome.history[0].result.count;
    assert!((19..=21).contains(&warmup), "{warmup}");

    let report = SearchReport::from(&outcome);
    assert!(report.to_string().starts_with("initial "));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workload_is_reset_before_every_step() {
    for (reset_each_step, expected) in [(true, 3), (false, 0)] {
        let workload = Arc::new(Counting::default());
        StepSearch::builder()
            .scenario(scenario(workload.clone()))
            .initial_rate(100.0)
            .run_time(Duration::from_millis(300))
            .max_steps(3)
            .target_factor(None)
            .reset_each_step(reset_each_step)
            .build()
            .run()
            .await
            .unwrap();
        assert_eq!(workload.resets.load(Ordering::Relaxed), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finer_steps_split_the_converged_bracket() {
    let outcome = StepSearch::builder()
        .scenario(scenario(Arc::new(Saturating::default())))
        .initial_rate(80.0)
        .run_time(Duration::from_secs(2))
        .interval_length(Duration::from_millis(500))
        .rules(vec![SlaRule::new(50.0, 5.0, 10).unwrap()])
        .finer_rate_steps(3)
        .build()
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::Converged);
    let coarse: Vec<_> = outcome.history.iter().filter(|s| !s.finer).collect();
    let finer: Vec<_> = outcome.history.iter().filter(|s| s.finer).collect();
    assert!(!finer.is_empty() && finer.len() <= 3, "{}", finer.len());

    // the bracket is the last accepted coarse rate and the rejected one after it
    let rejected = coarse.last().unwrap();
    assert!(!rejected.accepted);
    let floor = coarse.iter().rev().find(|s| s.accepted).unwrap().target_rate;
    let increment = (rejected.target_rate - floor) / 4.0;
    for (k, s) in finer.iter().enumerate() {
        let expected = floor + increment * (k + 1) as f64;
        assert!((s.target_rate - expected).abs() < 1e-9, "{} vs {expected}", s.target_rate);
        assert_eq!(s.step, coarse.len() + k + 1);
    }
    // walking up stops at the first rejection
    assert!(finer[..finer.len() - 1].iter().all(|s| s.accepted));
    if finer.len() < 3 {
        assert!(!finer.last().unwrap().accepted);
    }

    let max = outcome.max_rate.unwrap();
    assert!(max > 90.0 && max < 110.0, "{max:.1}");
    let report = SearchReport::from(&outcome);
    assert!(report.steps.iter().any(|s| s.finer));
    let broken_at = report.sla_breaks[0].broken_at.unwrap();
    assert!(broken_at > floor && broken_at <= rejected.target_rate, "{broken_at}");
}
