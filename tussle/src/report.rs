use std::fmt::{self, Debug};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    error::BoxError,
    executor::RunResult,
    histogram::HistogramSnapshot,
    search::{SearchOutcome, StepRecord, Termination},
    sla::SlaVerdict,
};

/// A [`Report`] is the processed, serializable form of a run or search outcome.
///
/// Reports are pure data built from a reference to their `Source` with `From`; they
/// perform no I/O. A [`Reporter`] decides where they go.
pub trait Report
where
    Self: Send + Sync + Debug + Serialize,
{
    type Source;
}

/// Sends a [`Report`] somewhere: logs, stdout, a file.
#[async_trait]
pub trait Reporter<R: Report> {
    async fn report(&self, report: &R) -> Result<(), BoxError>;
}

/// Percentiles of one latency line, in ms.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub p0: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub p99_9: f64,
    pub p99_99: f64,
    pub p100: f64,
    pub mean: f64,
}

impl From<&HistogramSnapshot> for LatencySummary {
    fn from(h: &HistogramSnapshot) -> Self {
        Self {
            count: h.count(),
            p0: h.min_ms(),
            p50: h.value_at_percentile_ms(50.0),
            p90: h.value_at_percentile_ms(90.0),
            p99: h.value_at_percentile_ms(99.0),
            p99_9: h.value_at_percentile_ms(99.9),
            p99_99: h.value_at_percentile_ms(99.99),
            p100: h.max_ms(),
            mean: h.mean_ms(),
        }
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p0={:.3} p50={:.3} p90={:.3} p99={:.3} p99.9={:.3} p99.99={:.3} p100={:.3} \
             mean={:.3} (ms)",
            self.p0, self.p50, self.p90, self.p99, self.p99_9, self.p99_99, self.p100, self.mean
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub label: String,
    pub target_rate: f64,
    pub achieved_rate: f64,
    pub count: u64,
    pub errors: u64,
    pub duration_ms: u64,
    pub start_ms: i64,
    pub finish_ms: i64,
    pub service_time: LatencySummary,
    pub response_time: LatencySummary,
}

impl From<&RunResult> for RunSummary {
    fn from(r: &RunResult) -> Self {
        Self {
            label: r.label.clone(),
            target_rate: r.target_rate,
            achieved_rate: r.achieved_rate,
            count: r.count,
            errors: r.errors,
            duration_ms: r.duration.as_millis() as u64,
            start_ms: r.interval.start,
            finish_ms: r.interval.finish,
            service_time: LatencySummary::from(&r.service_time),
            response_time: LatencySummary::from(&r.response_time),
        }
    }
}

impl Report for RunSummary {
    type Source = RunResult;
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {:.1} op/s of {:.1} target, {} ops, {} errors, {}ms",
            self.label,
            self.achieved_rate,
            self.target_rate,
            self.count,
            self.errors,
            self.duration_ms
        )?;
        writeln!(f, "  service_time  {}", self.service_time)?;
        write!(f, "  response_time {}", self.response_time)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct VerdictSummary {
    pub rule: String,
    pub verdict: SlaVerdict,
    pub worst_ms: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StepSummary {
    pub step: usize,
    pub target_rate: f64,
    pub accepted: bool,
    pub finer: bool,
    pub run: RunSummary,
    pub verdicts: Vec<VerdictSummary>,
}

impl From<&StepRecord> for StepSummary {
    fn from(s: &StepRecord) -> Self {
        Self {
            step: s.step,
            target_rate: s.target_rate,
            accepted: s.accepted,
            finer: s.finer,
            run: RunSummary::from(&s.result),
            verdicts: s
                .verdicts
                .iter()
                .map(|v| VerdictSummary {
                    rule: v.rule.long_name(),
                    verdict: v.verdict,
                    worst_ms: v.worst_ms,
                })
                .collect(),
        }
    }
}

/// The lowest target rate at which an SLA was violated, if any step violated it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlaBreak {
    pub rule: String,
    pub broken_at: Option<f64>,
}

impl SlaBreak {
    /// One entry per rule, in rule order, looking at steps by ascending target rate.
    pub fn from_history(history: &[StepRecord]) -> Vec<Self> {
        let mut by_rate: Vec<&StepRecord> = history.iter().collect();
        by_rate.sort_by(|a, b| a.target_rate.total_cmp(&b.target_rate));

        let mut breaks: Vec<Self> = Vec::new();
        for step in by_rate {
            for v in &step.verdicts {
                let rule = v.rule.to_string();
                let idx = match breaks.iter().position(|b| b.rule == rule) {
                    Some(idx) => idx,
                    None => {
                        breaks.push(Self {
                            rule,
                            broken_at: None,
                        });
                        breaks.len() - 1
                    }
                };
                if v.verdict == SlaVerdict::Violated && breaks[idx].broken_at.is_none() {
                    breaks[idx].broken_at = Some(step.target_rate);
                }
            }
        }
        breaks
    }
}

impl fmt::Display for SlaBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.broken_at {
            Some(rate) => write!(f, "{} broken at {rate:.1} op/s", self.rule),
            None => write!(f, "{} was not broken", self.rule),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchReport {
    pub max_rate: Option<f64>,
    pub termination: Termination,
    pub initial: Option<RunSummary>,
    pub steps: Vec<StepSummary>,
    pub sla_breaks: Vec<SlaBreak>,
}

impl From<&SearchOutcome> for SearchReport {
    fn from(o: &SearchOutcome) -> Self {
        Self {
            max_rate: o.max_rate,
            termination: o.termination,
            initial: o.initial.as_ref().map(RunSummary::from),
            steps: o.history.iter().map(StepSummary::from).collect(),
            sla_breaks: SlaBreak::from_history(&o.history),
        }
    }
}

impl Report for SearchReport {
    type Source = SearchOutcome;
}

impl fmt::Display for SearchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(initial) = &self.initial {
            writeln!(
                f,
                "initial  {:>10.1} op/s -> {:>10.1} op/s",
                initial.target_rate, initial.achieved_rate
            )?;
        }
        for s in &self.steps {
            writeln!(
                f,
                "step {:>3} {:>10.1} op/s -> {:>10.1} op/s {}{}",
                s.step,
                s.target_rate,
                s.run.achieved_rate,
                if s.accepted { "accepted" } else { "rejected" },
                if s.finer { " (finer)" } else { "" }
            )?;
            for v in &s.verdicts {
                let worst = v.worst_ms.unwrap_or_default();
                writeln!(f, "    {} {:?} worst={worst:.3}ms", v.rule, v.verdict)?;
            }
        }
        for b in &self.sla_breaks {
            writeln!(f, "{b}")?;
        }
        match self.max_rate {
            Some(r) => write!(f, "max sustainable rate: {r:.1} op/s ({:?})", self.termination),
            None => write!(f, "no sustainable rate found ({:?})", self.termination),
        }
    }
}

/// Writes reports as `tracing` events, one per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

#[async_trait]
impl<R> Reporter<R> for LogReporter
where
    R: Report + fmt::Display,
{
    async fn report(&self, report: &R) -> Result<(), BoxError> {
        for line in report.to_string().lines() {
            tracing::info!("{line}");
        }
        Ok(())
    }
}

/// Prints reports as JSON on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonReporter {
    pub pretty: bool,
}

#[async_trait]
impl<R> Reporter<R> for JsonReporter
where
    R: Report,
{
    async fn report(&self, report: &R) -> Result<(), BoxError> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        println!("{json}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        histogram::new_histogram,
        interval::Interval,
        search::RuleVerdict,
        sla::SlaRule,
    };

    fn run_result() -> RunResult {
        let mut h = new_histogram();
        for v in 1..=100u64 {
            h.record(v * 1_000_000).unwrap();
        }
        RunResult {
            label: "r".into(),
            target_rate: 100.0,
            achieved_rate: 99.5,
            count: 100,
            errors: 2,
            duration: Duration::from_secs(1),
            interval: Interval::new(0, 1_000, "r"),
            service_time: HistogramSnapshot::new(h.clone(), 0, 1_000),
            response_time: HistogramSnapshot::new(h, 0, 1_000),
        }
    }

    #[test]
    fn run_summary_percentiles() {
        let s = RunSummary::from(&run_result());
        assert_eq!(s.count, 100);
        assert!((s.response_time.p50 - 50.0).abs() < 0.1);
        assert!((s.response_time.p100 - 100.0).abs() < 0.1);
        assert!((s.service_time.mean - 50.5).abs() < 0.1);
        assert!(s.to_string().contains("99.5 op/s"));
    }

    #[tokio::test]
    async fn json_reporter_serializes() {
        let s = RunSummary::from(&run_result());
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["errors"], 2);
        JsonReporter::default().report(&s).await.unwrap();
        LogReporter.report(&s).await.unwrap();
    }

    fn step(step: usize, target_rate: f64, verdicts: [SlaVerdict; 2]) -> StepRecord {
        let rules = [
            SlaRule::new(50.0, 5.0, 10).unwrap(),
            SlaRule::new(99.0, 20.0, 10).unwrap(),
        ];
        StepRecord {
            step,
            target_rate,
            result: run_result(),
            verdicts: rules
                .into_iter()
                .zip(verdicts)
                .map(|(rule, verdict)| RuleVerdict {
                    rule,
                    verdict,
                    worst_ms: Some(1.0),
                })
                .collect(),
            accepted: verdicts.iter().all(|v| *v != SlaVerdict::Violated),
            finer: false,
        }
    }

    #[test]
    fn sla_breaks_take_the_lowest_violating_rate() {
        use SlaVerdict::{Satisfied, Violated};

        // searched from above: the first step in history is not the lowest break
        let history = [
            step(1, 120.0, [Violated, Satisfied]),
            step(2, 108.0, [Violated, Satisfied]),
            step(3, 97.2, [Satisfied, Satisfied]),
            step(4, 106.9, [Violated, Satisfied]),
        ];
        let breaks = SlaBreak::from_history(&history);
        assert_eq!(breaks.len(), 2);
        assert_eq!(breaks[0].broken_at, Some(106.9));
        assert_eq!(breaks[1].broken_at, None);
        assert_eq!(breaks[0].to_string(), "p50-sla5ms-mw10s (response_time) broken at 106.9 op/s");
        assert_eq!(breaks[1].to_string(), "p99-sla20ms-mw10s (response_time) was not broken");

        let outcome = SearchOutcome {
            max_rate: Some(99.5),
            termination: Termination::Converged,
            initial: Some(run_result()),
            history: history.to_vec(),
        };
        let report = SearchReport::from(&outcome);
        let text = report.to_string();
        assert!(text.starts_with("initial "), "{text}");
        assert!(text.contains("broken at 106.9 op/s"), "{text}");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["sla_breaks"][0]["broken_at"], 106.9);
        assert!(json["sla_breaks"][1]["broken_at"].is_null());
    }
}
