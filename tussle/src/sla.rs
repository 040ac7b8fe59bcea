use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::MovingWindowAggregator,
    error::{Error, Result},
};

/// Which latency line a rule is evaluated against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyKind {
    /// Completion minus intended issue time. Includes queueing delay.
    #[default]
    ResponseTime,
    /// Completion minus actual start.
    ServiceTime,
}

impl fmt::Display for LatencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResponseTime => f.write_str("response_time"),
            Self::ServiceTime => f.write_str("service_time"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaVerdict {
    Satisfied,
    Violated,
    /// The window held no samples.
    Inconclusive,
}

/// A latency bound: the `percentile` of a moving window of `window_seconds` must not
/// exceed `max_value_ms`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSlaRule")]
pub struct SlaRule {
    percentile: f64,
    max_value_ms: f64,
    window_seconds: u32,
    kind: LatencyKind,
}

#[derive(Deserialize)]
struct RawSlaRule {
    percentile: f64,
    max_value_ms: f64,
    window_seconds: u32,
    #[serde(default)]
    kind: LatencyKind,
}

impl TryFrom<RawSlaRule> for SlaRule {
    type Error = Error;

    fn try_from(raw: RawSlaRule) -> Result<Self> {
        Ok(SlaRule::new(raw.percentile, raw.max_value_ms, raw.window_seconds)?.with_kind(raw.kind))
    }
}

impl SlaRule {
    pub fn new(percentile: f64, max_value_ms: f64, window_seconds: u32) -> Result<Self> {
        if !(percentile > 0.0 && percentile <= 100.0) {
            return Err(Error::config(format!(
                "SLA percentile must be in (0, 100], got {percentile}"
            )));
        }
        if !(max_value_ms.is_finite() && max_value_ms > 0.0) {
            return Err(Error::config(format!(
                "SLA max value must be positive, got {max_value_ms}ms"
            )));
        }
        if window_seconds == 0 {
            return Err(Error::config("SLA window must be at least 1 second"));
        }
        Ok(Self {
            percentile,
            max_value_ms,
            window_seconds,
            kind: LatencyKind::ResponseTime,
        })
    }

    pub fn with_kind(mut self, kind: LatencyKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn percentile(&self) -> f64 {
        self.percentile
    }

    pub fn max_value_ms(&self) -> f64 {
        self.max_value_ms
    }

    pub fn window_seconds(&self) -> u32 {
        self.window_seconds
    }

    pub fn window_ms(&self) -> i64 {
        i64::from(self.window_seconds) * 1000
    }

    pub fn kind(&self) -> LatencyKind {
        self.kind
    }

    /// `p50-sla5ms-mw10s`
    pub fn long_name(&self) -> String {
        format!(
            "p{}-sla{}ms-mw{}s",
            trim(self.percentile),
            trim(self.max_value_ms),
            self.window_seconds
        )
    }

    /// `p50-sla5ms`
    pub fn marker_name(&self) -> String {
        format!("p{}-sla{}ms", trim(self.percentile), trim(self.max_value_ms))
    }

    /// `p50-mw10s`
    pub fn window_name(&self) -> String {
        format!("p{}-mw{}s", trim(self.percentile), self.window_seconds)
    }

    /// Whether the window's current percentile is within bound. False when empty.
    pub fn is_satisfied(&self, aggregator: &MovingWindowAggregator) -> bool {
        self.evaluate(aggregator) == SlaVerdict::Satisfied
    }

    pub fn evaluate(&self, aggregator: &MovingWindowAggregator) -> SlaVerdict {
        if aggregator.count() == 0 {
            return SlaVerdict::Inconclusive;
        }
        if aggregator.value_ms(self.percentile) <= self.max_value_ms {
            SlaVerdict::Satisfied
        } else {
            SlaVerdict::Violated
        }
    }
}

impl fmt::Display for SlaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.long_name(), self.kind)
    }
}

/// `percentile:max_ms:window_s[:kind]`, e.g. `p99.9:20:60` or `50:5:10:service`.
impl FromStr for SlaRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(Error::config(format!(
                "SLA '{s}' must look like percentile:max_ms:window_s[:kind]"
            )));
        }
        let number = |v: &str| {
            v.parse::<f64>()
                .map_err(|_| Error::config(format!("invalid number '{v}' in SLA '{s}'")))
        };
        let percentile = number(parts[0].trim_start_matches(['p', 'P']))?;
        let max_value_ms = number(parts[1].trim_end_matches("ms"))?;
        let window_seconds = parts[2]
            .trim_end_matches('s')
            .parse::<u32>()
            .map_err(|_| Error::config(format!("invalid window '{}' in SLA '{s}'", parts[2])))?;
        let kind = match parts.get(3).copied() {
            None | Some("response") | Some("response_time") => LatencyKind::ResponseTime,
            Some("service") | Some("service_time") => LatencyKind::ServiceTime,
            Some(other) => {
                return Err(Error::config(format!(
                    "unknown latency kind '{other}' in SLA '{s}'"
                )));
            }
        };
        Ok(SlaRule::new(percentile, max_value_ms, window_seconds)?.with_kind(kind))
    }
}

// 50.0 -> "50", 99.9 -> "99.9"
fn trim(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Follows one rule over a whole run, keeping the worst windowed value seen.
#[derive(Clone, Debug)]
pub struct SlaTracker {
    rule: SlaRule,
    worst_ms: Option<f64>,
    verdict: SlaVerdict,
}

impl SlaTracker {
    pub fn new(rule: SlaRule) -> Self {
        Self {
            rule,
            worst_ms: None,
            verdict: SlaVerdict::Inconclusive,
        }
    }

    pub fn rule(&self) -> &SlaRule {
        &self.rule
    }

    /// Evaluates the rule against the window's current state.
    pub fn observe(&mut self, aggregator: &MovingWindowAggregator) -> SlaVerdict {
        let verdict = self.rule.evaluate(aggregator);
        if verdict != SlaVerdict::Inconclusive {
            let value = aggregator.value_ms(self.rule.percentile);
            self.worst_ms = Some(self.worst_ms.map_or(value, |w| w.max(value)));
        }
        self.verdict = match (self.verdict, verdict) {
            (SlaVerdict::Violated, _) | (_, SlaVerdict::Violated) => SlaVerdict::Violated,
            (SlaVerdict::Satisfied, _) | (_, SlaVerdict::Satisfied) => SlaVerdict::Satisfied,
            _ => SlaVerdict::Inconclusive,
        };
        verdict
    }

    /// Violated if any observed window exceeded the bound.
    pub fn verdict(&self) -> SlaVerdict {
        self.verdict
    }

    pub fn worst_ms(&self) -> Option<f64> {
        self.worst_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::{HistogramSnapshot, new_histogram};

    fn window_with(values_ms: impl IntoIterator<Item = u64>) -> MovingWindowAggregator {
        let mut h = new_histogram();
        for v in values_ms {
            h.record(v * 1_000_000).unwrap();
        }
        let mut agg = MovingWindowAggregator::new(10_000);
        agg.add(HistogramSnapshot::new(h, 0, 1_000));
        agg
    }

    #[test]
    fn rejects_invalid_rules() {
        assert!(SlaRule::new(0.0, 5.0, 10).is_err());
        assert!(SlaRule::new(100.1, 5.0, 10).is_err());
        assert!(SlaRule::new(50.0, 0.0, 10).is_err());
        assert!(SlaRule::new(50.0, f64::NAN, 10).is_err());
        assert!(SlaRule::new(50.0, 5.0, 0).is_err());
        assert!(SlaRule::new(100.0, 5.0, 1).is_ok());
    }

    #[test]
    fn parses_from_str() {
        let r: SlaRule = "p99.9:20:60".parse().unwrap();
        assert_eq!(r.long_name(), "p99.9-sla20ms-mw60s");
        assert_eq!(r.kind(), LatencyKind::ResponseTime);
        let r: SlaRule = "50:5ms:10s:service".parse().unwrap();
        assert_eq!(r.long_name(), "p50-sla5ms-mw10s");
        assert_eq!(r.kind(), LatencyKind::ServiceTime);
        assert!("50:5".parse::<SlaRule>().is_err());
        assert!("50:5:10:queue".parse::<SlaRule>().is_err());
        assert!("50:5:0".parse::<SlaRule>().is_err());
    }

    #[test]
    fn names() {
        let r = SlaRule::new(50.0, 5.0, 10).unwrap();
        assert_eq!(r.long_name(), "p50-sla5ms-mw10s");
        assert_eq!(r.marker_name(), "p50-sla5ms");
        assert_eq!(r.window_name(), "p50-mw10s");
        assert_eq!(SlaRule::new(99.9, 0.5, 1).unwrap().long_name(), "p99.9-sla0.5ms-mw1s");
    }

    #[test]
    fn empty_window_is_not_satisfied() {
        let r = SlaRule::new(50.0, 5.0, 10).unwrap();
        let agg = MovingWindowAggregator::new(10_000);
        assert!(!r.is_satisfied(&agg));
        assert_eq!(r.evaluate(&agg), SlaVerdict::Inconclusive);
    }

    #[test]
    fn agrees_with_direct_percentile_on_known_values() {
        let agg = window_with(1..=1000);
        for p in [50.0, 90.0, 99.0, 99.9, 100.0] {
            let direct = agg.sum().value_at_percentile_ms(p);
            let at = SlaRule::new(p, direct, 10).unwrap();
            assert!(at.is_satisfied(&agg), "p{p} at {direct}");
            let below = SlaRule::new(p, direct - 0.5, 10).unwrap();
            assert!(!below.is_satisfied(&agg), "p{p} below {direct}");
        }
        // p50 of 1..=1000 ms is 500 ms within histogram precision
        let p50 = agg.sum().value_at_percentile_ms(50.0);
        assert!((p50 - 500.0).abs() <= 1.0, "{p50}");
    }

    #[test]
    fn tracker_remembers_worst_window() {
        let rule = SlaRule::new(50.0, 5.0, 1).unwrap();
        let mut tracker = SlaTracker::new(rule);
        assert_eq!(tracker.verdict(), SlaVerdict::Inconclusive);
        tracker.observe(&window_with([1, 2, 3]));
        assert_eq!(tracker.verdict(), SlaVerdict::Satisfied);
        tracker.observe(&window_with([9, 9, 9]));
        tracker.observe(&window_with([1]));
        assert_eq!(tracker.verdict(), SlaVerdict::Violated);
        assert!(tracker.worst_ms().unwrap() >= 9.0);
    }

    #[test]
    fn deserializes_with_validation() {
        let parse = |json: &str| serde_json::from_str::<SlaRule>(json);
        let r = parse(r#"{"percentile":99,"max_value_ms":20,"window_seconds":5}"#).unwrap();
        assert_eq!(r.kind(), LatencyKind::ResponseTime);
        assert!(parse(r#"{"percentile":99,"max_value_ms":20,"window_seconds":0}"#).is_err());
    }
}
