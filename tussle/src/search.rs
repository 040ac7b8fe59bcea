//! Step search — finding the highest rate that keeps every SLA
//!
//! [`StepSearch`] runs its [`Scenario`] repeatedly, adjusting the target rate by a
//! fixed percentage after each run:
//!
//! ```text
//! accepted: next = rate * (1 + step / 100)
//! rejected: next = rate * (1 - step / 100)
//! ```
//!
//! Every step goes through `Warmup -> Running -> Evaluating` and ends in one of
//! `StepUp`, `StepDown`, `Converged` or `MaxStepsReached` (see [`StepPhase`]).
//!
//! While a run is going, the recorder is snapshotted every `interval_length`. Each
//! snapshot inside `measure_range` feeds one [`MovingWindowAggregator`] per distinct
//! (latency kind, window) pair, and every [`SlaTracker`] re-evaluates its rule on the
//! updated window. A step is accepted when
//!
//! - no rule was violated by any window state observed during the run,
//! - at least one operation succeeded,
//! - and, when `target_factor` is set, `achieved_rate * target_factor >= target_rate`.
//!
//! The search converges when a rejection immediately follows an acceptance: the
//! boundary is then bracketed within one step. `boundary_retries` re-runs a rejected
//! boundary rate before giving up on it. The reported maximum is the highest achieved
//! rate among accepted steps.
//!
//! # Around the steps
//!
//! - An initial run of `initial_warmup_time + initial_run_time` at `initial_run_rate`
//!   (the initial rate by default) brings the target up before step 1. Nothing it
//!   records is judged; its result is kept in [`SearchOutcome::initial`].
//! - With `reset_each_step`, the workload is reset before every step.
//! - After convergence, `finer_rate_steps > 0` splits the bracket between the last
//!   accepted and the rejected rate into `finer_rate_steps + 1` equal parts and runs
//!   the inner rates upwards until one is rejected. These steps are marked `finer`,
//!   do not count toward `max_steps`, and may raise the maximum.
//!
//! A failing run aborts the search with [`Error::Search`], which keeps every step
//! completed before the failure.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;
use typed_builder::TypedBuilder;

use crate::{
    aggregate::MovingWindowAggregator,
    config::{BenchmarkConfig, SearchConfig},
    error::{Error, Result, SearchError},
    executor::RunResult,
    histogram::HistogramSnapshot,
    hlog,
    interval::Interval,
    recorder::{IntervalSnapshot, TimeRecorder, now_ms},
    scenario::Scenario,
    sla::{LatencyKind, SlaRule, SlaTracker, SlaVerdict},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Warmup,
    Running,
    Evaluating,
    StepUp,
    StepDown,
    Converged,
    MaxStepsReached,
    Refining,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Warmup => "WARMUP",
            Self::Running => "RUNNING",
            Self::Evaluating => "EVALUATING",
            Self::StepUp => "STEP_UP",
            Self::StepDown => "STEP_DOWN",
            Self::Converged => "CONVERGED",
            Self::MaxStepsReached => "MAX_STEPS_REACHED",
            Self::Refining => "REFINING",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    MaxStepsReached,
}

#[derive(Clone, Debug)]
pub struct RuleVerdict {
    pub rule: SlaRule,
    pub verdict: SlaVerdict,
    /// Highest windowed percentile seen during the run.
    pub worst_ms: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct StepRecord {
    /// 1-based.
    pub step: usize,
    pub target_rate: f64,
    pub result: RunResult,
    pub verdicts: Vec<RuleVerdict>,
    pub accepted: bool,
    /// Run while refining a converged bracket.
    pub finer: bool,
}

#[derive(Clone, Debug, Default)]
pub struct StepState {
    pub current_rate: f64,
    pub step_index: usize,
    /// Whether the last evaluated step was accepted.
    pub satisfied: bool,
    pub history: Vec<StepRecord>,
}

#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub max_rate: Option<f64>,
    pub termination: Termination,
    /// The unjudged run before step 1, when one was configured.
    pub initial: Option<RunResult>,
    pub history: Vec<StepRecord>,
}

#[derive(Clone, Debug, TypedBuilder)]
pub struct StepSearch {
    pub scenario: Scenario,
    pub initial_rate: f64,
    pub run_time: Duration,
    #[builder(default)]
    pub warmup_time: Duration,
    #[builder(default = 10.0)]
    pub rate_percent_step: f64,
    #[builder(default = 20)]
    pub max_steps: u32,
    #[builder(default)]
    pub rules: Vec<SlaRule>,
    /// Moving windows in seconds. Derived from `rules` when absent.
    #[builder(default, setter(strip_option))]
    pub windows: Option<Vec<u32>>,
    #[builder(default = Some(1.01))]
    pub target_factor: Option<f64>,
    #[builder(default)]
    pub boundary_retries: u32,
    #[builder(default = Duration::from_secs(1))]
    pub interval_length: Duration,
    /// Log a progress line every this many snapshots, 0 disables.
    #[builder(default = 5)]
    pub progress_intervals: u32,
    /// Relative to each run's start, in ms.
    #[builder(default)]
    pub measure_range: Interval,
    #[builder(default, setter(strip_option, into))]
    pub histograms_dir: Option<PathBuf>,
    /// Rate of the initial run, `initial_rate` when unset.
    #[builder(default, setter(strip_option))]
    pub initial_run_rate: Option<f64>,
    #[builder(default)]
    pub initial_warmup_time: Duration,
    #[builder(default)]
    pub initial_run_time: Duration,
    #[builder(default)]
    pub finer_rate_steps: u32,
    #[builder(default = true)]
    pub reset_each_step: bool,
}

impl StepSearch {
    pub fn from_config(
        scenario: Scenario,
        bench: &BenchmarkConfig,
        search: &SearchConfig,
    ) -> Result<Self> {
        bench.validate()?;
        search.validate()?;
        Ok(Self {
            scenario,
            initial_rate: bench.target_rate()?,
            run_time: bench.run_time()?,
            warmup_time: bench.warmup_time()?,
            rate_percent_step: search.rate_percent_step,
            max_steps: search.max_steps,
            rules: search.sla.clone(),
            windows: search.windows.clone(),
            target_factor: search.target_factor,
            boundary_retries: search.boundary_retries,
            interval_length: bench.interval_length(),
            progress_intervals: bench.progress_intervals,
            measure_range: search.measure_range.clone(),
            histograms_dir: bench.histograms_dir.clone(),
            initial_run_rate: search.initial_rate()?,
            initial_warmup_time: search.initial_warmup_time()?,
            initial_run_time: search.initial_run_time()?,
            finer_rate_steps: search.finer_rate_steps,
            reset_each_step: search.reset_each_step,
        })
    }

    pub async fn run(&self) -> Result<SearchOutcome> {
        let windows = self.validate()?;
        tracing::info!(
            "Starting step search '{}' at {:.1} op/s, step {}%, SLAs: [{}]",
            self.scenario.name,
            self.initial_rate,
            self.rate_percent_step,
            self.rules.iter().map(SlaRule::long_name).collect::<Vec<_>>().join(", ")
        );
        let initial = self
            .run_initial()
            .await
            .map_err(|source| search_failure(0, Vec::new(), source))?;

        let mut state = StepState {
            current_rate: self.initial_rate,
            ..StepState::default()
        };
        let mut after_acceptance = false;
        let mut retries_left = self.boundary_retries;

        let termination = loop {
            if state.step_index >= self.max_steps as usize {
                log_phase(state.step_index, StepPhase::MaxStepsReached, state.current_rate);
                break Termination::MaxStepsReached;
            }
            let step = state.step_index + 1;
            let rate = state.current_rate;

            let record = match self.run_step(step, rate, &windows).await {
                Ok(record) => record,
                Err(source) => return Err(search_failure(step, state.history, source)),
            };
            let accepted = record.accepted;
            state.history.push(record);
            state.step_index = step;
            state.satisfied = accepted;

            if accepted {
                after_acceptance = true;
                retries_left = self.boundary_retries;
                state.current_rate = rate * (1.0 + self.rate_percent_step / 100.0);
                log_phase(step, StepPhase::StepUp, state.current_rate);
            } else if after_acceptance && retries_left > 0 {
                retries_left -= 1;
                tracing::info!(
                    "Step {step}: re-running boundary rate {rate:.1} op/s \
                     ({retries_left} retries left)"
                );
            } else if after_acceptance {
                log_phase(step, StepPhase::Converged, rate);
                break Termination::Converged;
            } else {
                state.current_rate = rate * (1.0 - self.rate_percent_step / 100.0);
                log_phase(step, StepPhase::StepDown, state.current_rate);
            }
        };

        if termination == Termination::Converged && self.finer_rate_steps > 0 {
            self.refine(&mut state, &windows).await?;
        }

        let max_rate = state
            .history
            .iter()
            .filter(|r| r.accepted)
            .map(|r| r.result.achieved_rate)
            .fold(None, |max: Option<f64>, r| Some(max.map_or(r, |m| m.max(r))));
        let name = &self.scenario.name;
        match max_rate {
            Some(r) => tracing::info!(
                "Step search '{name}' finished ({termination:?}): max rate {r:.1} op/s"
            ),
            None => tracing::warn!(
                "Step search '{name}' finished ({termination:?}) without an accepted rate"
            ),
        }
        Ok(SearchOutcome {
            max_rate,
            termination,
            initial,
            history: state.history,
        })
    }

    /// Warms the target up before step 1. Returns the measured part, if any.
    async fn run_initial(&self) -> Result<Option<RunResult>> {
        if self.initial_warmup_time.is_zero() && self.initial_run_time.is_zero() {
            return Ok(None);
        }
        let rate = self.initial_run_rate.unwrap_or(self.initial_rate);
        let label = format!("{}-initial", self.scenario.name);
        tracing::info!(
            "Initial run at {rate:.1} op/s: warmup {:?}, run {:?}",
            self.initial_warmup_time,
            self.initial_run_time
        );
        if !self.initial_warmup_time.is_zero() {
            self.scenario
                .run_as(
                    &format!("{label}-warmup"),
                    rate,
                    self.initial_warmup_time,
                    Arc::new(TimeRecorder::new()),
                )
                .await?;
        }
        if self.initial_run_time.is_zero() {
            return Ok(None);
        }
        let result = self
            .scenario
            .run_as(&label, rate, self.initial_run_time, Arc::new(TimeRecorder::new()))
            .await?;
        tracing::info!(
            "Initial run achieved {:.1} op/s of {rate:.1} target",
            result.achieved_rate
        );
        Ok(Some(result))
    }

    /// Walks the bracket between the last accepted and the rejected rate upwards in
    /// `finer_rate_steps` equal increments, stopping at the first rejection.
    async fn refine(&self, state: &mut StepState, windows: &[(LatencyKind, i64)]) -> Result<()> {
        let Some(rejected) = state.history.last().map(|r| r.target_rate) else {
            return Ok(());
        };
        let Some(floor) = state.history.iter().rev().find(|r| r.accepted) else {
            return Ok(());
        };
        let floor = floor.target_rate;
        if floor >= rejected {
            return Ok(());
        }
        let increment = (rejected - floor) / f64::from(self.finer_rate_steps + 1);
        tracing::info!(
            "Refining between {floor:.1} and {rejected:.1} op/s in steps of {increment:.2} op/s"
        );

        for k in 1..=self.finer_rate_steps {
            let step = state.step_index + 1;
            let rate = floor + increment * f64::from(k);
            log_phase(step, StepPhase::Refining, rate);
            let mut record = match self.run_step(step, rate, windows).await {
                Ok(record) => record,
                Err(source) => {
                    return Err(search_failure(step, std::mem::take(&mut state.history), source));
                }
            };
            record.finer = true;
            let accepted = record.accepted;
            state.history.push(record);
            state.step_index = step;
            state.satisfied = accepted;
            if !accepted {
                break;
            }
        }
        Ok(())
    }

    /// Checks parameters and returns the (kind, window ms) pairs to aggregate.
    fn validate(&self) -> Result<Vec<(LatencyKind, i64)>> {
        if !self.initial_rate.is_finite() || self.initial_rate <= 0.0 {
            return Err(Error::config(format!(
                "initial rate must be positive, got {}",
                self.initial_rate
            )));
        }
        if let Some(rate) = self.initial_run_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(Error::config(format!(
                    "initial run rate must be positive, got {rate}"
                )));
            }
        }
        if self.run_time.is_zero() {
            return Err(Error::config("run time must be non-zero"));
        }
        if !(self.rate_percent_step > 0.0 && self.rate_percent_step < 100.0) {
            return Err(Error::config(format!(
                "rate percent step must be in (0, 100), got {}",
                self.rate_percent_step
            )));
        }
        if self.max_steps == 0 {
            return Err(Error::config("max steps must be positive"));
        }
        if self.interval_length.is_zero() {
            return Err(Error::config("interval length must be non-zero"));
        }
        if let Some(f) = self.target_factor {
            if !f.is_finite() || f <= 0.0 {
                return Err(Error::config(format!("target factor must be positive, got {f}")));
            }
        }

        let mut keys: Vec<(LatencyKind, i64)> = Vec::new();
        match &self.windows {
            Some(windows) => {
                let mut kinds: Vec<LatencyKind> = Vec::new();
                for kind in self.rules.iter().map(SlaRule::kind) {
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
                for &w in windows {
                    if w == 0 {
                        return Err(Error::config("moving windows must be at least 1 second"));
                    }
                    for &kind in &kinds {
                        let key = (kind, i64::from(w) * 1000);
                        if !keys.contains(&key) {
                            keys.push(key);
                        }
                    }
                }
                if let Some(rule) = self
                    .rules
                    .iter()
                    .find(|r| !keys.contains(&(r.kind(), r.window_ms())))
                {
                    return Err(Error::config(format!(
                        "SLA {rule} has no matching moving window in {windows:?}"
                    )));
                }
            }
            None => {
                for rule in &self.rules {
                    let key = (rule.kind(), rule.window_ms());
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn run_step(
        &self,
        step: usize,
        rate: f64,
        windows: &[(LatencyKind, i64)],
    ) -> Result<StepRecord> {
        let label = format!("{}-step{step}", self.scenario.name);
        if self.reset_each_step {
            self.scenario.reset().await?;
        }

        if !self.warmup_time.is_zero() {
            log_phase(step, StepPhase::Warmup, rate);
            self.scenario
                .run_as(
                    &format!("{label}-warmup"),
                    rate,
                    self.warmup_time,
                    Arc::new(TimeRecorder::new()),
                )
                .await?;
        }

        log_phase(step, StepPhase::Running, rate);
        let mut monitor = RunMonitor::new(self, windows, &label);
        let recorder = Arc::new(TimeRecorder::new());
        let run = self.scenario.run_as(&label, rate, self.run_time, recorder.clone());
        tokio::pin!(run);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval_length,
            self.interval_length,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let result = loop {
            tokio::select! {
                res = &mut run => break res,
                _ = ticker.tick() => monitor.observe(recorder.snapshot_interval()),
            }
        };
        monitor.observe(recorder.snapshot_interval());
        let result = result?;

        if let Some(dir) = &self.histograms_dir {
            hlog::write_run(dir, &label, &monitor.kept)?;
        }

        log_phase(step, StepPhase::Evaluating, rate);
        let verdicts: Vec<RuleVerdict> = monitor
            .trackers
            .iter()
            .map(|(_, t)| RuleVerdict {
                rule: t.rule().clone(),
                verdict: t.verdict(),
                worst_ms: t.worst_ms(),
            })
            .collect();
        let accepted = self.accept(step, rate, &result, &verdicts);
        Ok(StepRecord {
            step,
            target_rate: rate,
            result,
            verdicts,
            accepted,
            finer: false,
        })
    }

    fn accept(&self, step: usize, rate: f64, result: &RunResult, verdicts: &[RuleVerdict]) -> bool {
        let mut accepted = true;
        for v in verdicts.iter().filter(|v| v.verdict == SlaVerdict::Violated) {
            tracing::info!(
                "Step {step}: {} violated (worst {:.3}ms)",
                v.rule,
                v.worst_ms.unwrap_or_default()
            );
            accepted = false;
        }
        if result.count <= result.errors {
            tracing::info!("Step {step}: no successful operations");
            accepted = false;
        }
        if let Some(factor) = self.target_factor {
            if result.achieved_rate * factor < rate {
                tracing::info!(
                    "Step {step}: achieved {:.1} op/s is too far below target {rate:.1} op/s",
                    result.achieved_rate
                );
                accepted = false;
            }
        }
        tracing::info!(
            "Step {step}: {} at {rate:.1} op/s (achieved {:.1} op/s, {} ops, {} errors)",
            if accepted { "accepted" } else { "rejected" },
            result.achieved_rate,
            result.count,
            result.errors
        );
        accepted
    }
}

fn log_phase(step: usize, phase: StepPhase, rate: f64) {
    tracing::info!("Step {step}: {phase} ({rate:.1} op/s)");
}

fn search_failure(step: usize, history: Vec<StepRecord>, source: Error) -> Error {
    if step == 0 {
        tracing::error!("Initial run failed: {source}");
    } else {
        tracing::error!("Step {step} failed: {source}");
    }
    SearchError {
        step,
        history,
        source,
    }
    .into()
}

struct Window {
    kind: LatencyKind,
    aggregator: MovingWindowAggregator,
}

/// Per-run state fed by interval snapshots.
struct RunMonitor<'a> {
    label: &'a str,
    range: Interval,
    windows: Vec<Window>,
    /// (index into `windows`, tracker)
    trackers: Vec<(usize, SlaTracker)>,
    keep: bool,
    kept: Vec<IntervalSnapshot>,
    progress_every: u32,
    run_start_ms: i64,
    run_ms: i64,
    seen: u32,
    progress: HistogramSnapshot,
    total: u64,
}

impl<'a> RunMonitor<'a> {
    fn new(search: &StepSearch, keys: &[(LatencyKind, i64)], label: &'a str) -> Self {
        let windows: Vec<Window> = keys
            .iter()
            .map(|&(kind, window_ms)| Window {
                kind,
                aggregator: MovingWindowAggregator::new(window_ms),
            })
            .collect();
        let trackers = search
            .rules
            .iter()
            .filter_map(|rule| {
                let idx = windows.iter().position(|w| {
                    w.kind == rule.kind() && w.aggregator.window_ms() == rule.window_ms()
                })?;
                Some((idx, SlaTracker::new(rule.clone())))
            })
            .collect();
        let run_start_ms = now_ms();
        let mut range = search.measure_range.clone();
        range.adjust(run_start_ms);
        Self {
            label,
            range,
            windows,
            trackers,
            keep: search.histograms_dir.is_some(),
            kept: Vec::new(),
            progress_every: search.progress_intervals,
            run_start_ms,
            run_ms: search.run_time.as_millis().max(1) as i64,
            seen: 0,
            progress: HistogramSnapshot::empty(),
            total: 0,
        }
    }

    fn observe(&mut self, snapshot: IntervalSnapshot) {
        if !self.range.contains(snapshot.start(), snapshot.end()) {
            tracing::debug!(
                "'{}': skipping interval [{}, {}] outside {}",
                self.label,
                snapshot.start(),
                snapshot.end(),
                self.range
            );
            return;
        }
        for w in &mut self.windows {
            let h = match w.kind {
                LatencyKind::ResponseTime => &snapshot.response,
                LatencyKind::ServiceTime => &snapshot.service,
            };
            w.aggregator.add(h.clone());
        }
        for (idx, tracker) in &mut self.trackers {
            tracker.observe(&self.windows[*idx].aggregator);
        }

        self.total += snapshot.response.count();
        self.progress.add(&snapshot.response);
        self.seen += 1;
        if self.progress_every > 0 && self.seen % self.progress_every == 0 {
            self.log_progress(snapshot.end());
        }
        if self.keep {
            self.kept.push(snapshot);
        }
    }

    fn log_progress(&mut self, now: i64) {
        let p = &self.progress;
        let elapsed = now - self.run_start_ms;
        tracing::info!(
            "{:>7.1}s {} {:>5.1}% p50={:.3}ms p90={:.3}ms p99={:.3}ms p100={:.3}ms \
             mean={:.3}ms count={} total={}",
            elapsed as f64 / 1000.0,
            self.label,
            (elapsed as f64 * 100.0 / self.run_ms as f64).min(100.0),
            p.value_at_percentile_ms(50.0),
            p.value_at_percentile_ms(90.0),
            p.value_at_percentile_ms(99.0),
            p.max_ms(),
            p.mean_ms(),
            p.count(),
            self.total
        );
        self.progress = HistogramSnapshot::empty();
    }
}
