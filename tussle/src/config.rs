//! Serde-deserializable run configuration and the unit parsers it relies on.
//!
//! Loading these structs from a file is left to the caller; every field has a
//! default so partial documents deserialize.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    executor::SchedulerKind,
    interval::Interval,
    sla::SlaRule,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub name: String,
    /// Initial target rate, `parse_value` syntax (`1k`, `250`, `1.5m`).
    pub target_rate: String,
    /// `parse_time_length` syntax (`60`, `5m`, `1h`).
    pub run_time: String,
    pub warmup_time: String,
    pub interval_length_ms: u64,
    /// Log a progress line every this many interval snapshots, 0 disables.
    pub progress_intervals: u32,
    pub histograms_dir: Option<PathBuf>,
    pub scheduler: SchedulerKind,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            name: "benchmark".to_string(),
            target_rate: "1k".to_string(),
            run_time: "60".to_string(),
            warmup_time: "0".to_string(),
            interval_length_ms: 1000,
            progress_intervals: 5,
            histograms_dir: None,
            scheduler: SchedulerKind::default(),
        }
    }
}

impl BenchmarkConfig {
    pub fn target_rate(&self) -> Result<f64> {
        parse_value(&self.target_rate)
    }

    pub fn run_time(&self) -> Result<Duration> {
        parse_time_length(&self.run_time).map(Duration::from_secs)
    }

    pub fn warmup_time(&self) -> Result<Duration> {
        parse_time_length(&self.warmup_time).map(Duration::from_secs)
    }

    pub fn interval_length(&self) -> Duration {
        Duration::from_millis(self.interval_length_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let rate = self.target_rate()?;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(Error::config(format!(
                "target_rate must be positive, got '{}'",
                self.target_rate
            )));
        }
        if self.run_time()?.is_zero() {
            return Err(Error::config("run_time must be non-zero"));
        }
        self.warmup_time()?;
        if self.interval_length_ms == 0 {
            return Err(Error::config("interval_length_ms must be positive"));
        }
        match self.scheduler {
            SchedulerKind::Pool { threads: 0 } => {
                Err(Error::config("scheduler pool needs at least one thread"))
            }
            SchedulerKind::Async {
                max_in_flight: Some(0),
            } => Err(Error::config("scheduler max_in_flight must be at least 1")),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub rate_percent_step: f64,
    pub max_steps: u32,
    /// Reject a step whose achieved rate times this factor is below its target rate.
    pub target_factor: Option<f64>,
    /// Extra runs of a rejected boundary rate before declaring convergence.
    pub boundary_retries: u32,
    pub sla: Vec<SlaRule>,
    /// Moving windows in seconds. Derived from `sla` when absent.
    pub windows: Option<Vec<u32>>,
    /// Part of each run that counts, in ms relative to the run start.
    pub measure_range: Interval,
    /// Rate of the unjudged run before step 1, the benchmark target rate when absent.
    pub initial_rate: Option<String>,
    pub initial_warmup_time: String,
    pub initial_run_time: String,
    /// Intermediate rates tried inside the converged bracket, 0 disables.
    pub finer_rate_steps: u32,
    pub reset_each_step: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rate_percent_step: 10.0,
            max_steps: 20,
            target_factor: Some(1.01),
            boundary_retries: 0,
            sla: Vec::new(),
            windows: None,
            measure_range: Interval::unbounded(),
            initial_rate: None,
            initial_warmup_time: "0".to_string(),
            initial_run_time: "0".to_string(),
            finer_rate_steps: 0,
            reset_each_step: true,
        }
    }
}

impl SearchConfig {
    pub fn initial_rate(&self) -> Result<Option<f64>> {
        self.initial_rate.as_deref().map(parse_value).transpose()
    }

    pub fn initial_warmup_time(&self) -> Result<Duration> {
        parse_time_length(&self.initial_warmup_time).map(Duration::from_secs)
    }

    pub fn initial_run_time(&self) -> Result<Duration> {
        parse_time_length(&self.initial_run_time).map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.rate_percent_step > 0.0 && self.rate_percent_step < 100.0) {
            return Err(Error::config(format!(
                "rate_percent_step must be in (0, 100), got {}",
                self.rate_percent_step
            )));
        }
        if self.max_steps == 0 {
            return Err(Error::config("max_steps must be positive"));
        }
        if let Some(rate) = self.initial_rate()? {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(Error::config(format!("initial_rate must be positive, got {rate}")));
            }
        }
        self.initial_warmup_time()?;
        self.initial_run_time()?;
        if let Some(f) = self.target_factor {
            if !f.is_finite() || f <= 0.0 {
                return Err(Error::config(format!("target_factor must be positive, got {f}")));
            }
        }
        if let Some(windows) = &self.windows {
            if windows.contains(&0) {
                return Err(Error::config("moving windows must be at least 1 second"));
            }
            if let Some(rule) = self.sla.iter().find(|r| !windows.contains(&r.window_seconds())) {
                return Err(Error::config(format!(
                    "SLA {} has no matching moving window in {windows:?}",
                    rule.long_name()
                )));
            }
        }
        Ok(())
    }
}

/// Splits `"10 k"` into `(10.0, "k")`, lowercasing the unit.
fn split_unit(value: &str) -> Result<(f64, String)> {
    let value = value.trim();
    let (number, unit) = value.split_at(numeric_prefix_len(value));
    let number = number
        .parse::<f64>()
        .map_err(|_| Error::config(format!("invalid number in '{value}'")))?;
    Ok((number, unit.trim().to_ascii_lowercase()))
}

/// Length of the longest prefix of `s` that reads as a decimal number, exponent
/// included (`-1.5e3`). An `e` not followed by digits belongs to the unit.
fn numeric_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let digits = |from: usize| {
        from + bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    end = digits(end);
    if bytes.get(end) == Some(&b'.') {
        end = digits(end + 1);
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        if bytes.get(exp).is_some_and(u8::is_ascii_digit) {
            end = digits(exp);
        }
    }
    end
}

/// `100` as is, `10k` -> 10 000, `1M` -> 1 000 000, `2g`, `4KiB` -> 4096, `mib`, `gib`.
pub fn parse_value(value: &str) -> Result<f64> {
    let (number, unit) = split_unit(value)?;
    let multiplier = match unit.as_str() {
        "" => 1.0,
        "k" => 1e3,
        "m" => 1e6,
        "g" => 1e9,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return Err(Error::config(format!("unknown unit '{unit}' in '{value}'"))),
    };
    Ok(number * multiplier)
}

/// Whole seconds: `60` -> 60, `10m` -> 600, `1h` -> 3600. Accepts `s`, `seconds`,
/// `m`, `min`, `minutes`, `h`, `hrs`.
pub fn parse_time_length(value: &str) -> Result<u64> {
    let (number, unit) = split_unit(value)?;
    let multiplier = match unit.as_str() {
        "" | "s" | "seconds" => 1,
        "m" | "min" | "minutes" => 60,
        "h" | "hrs" => 3600,
        _ => return Err(Error::config(format!("unknown time unit '{unit}' in '{value}'"))),
    };
    if number < 0.0 || number.fract() != 0.0 {
        return Err(Error::config(format!(
            "time length must be whole and non-negative: '{value}'"
        )));
    }
    Ok(number as u64 * multiplier)
}

/// Sub-second durations: `250us`, `1.5ms`, `2s`, `10m`, `1h`. A bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let (number, unit) = split_unit(value)?;
    let nanos_per_unit = match unit.as_str() {
        "ns" | "nanos" => 1.0,
        "us" | "micros" => 1e3,
        "ms" | "millis" => 1e6,
        "" | "s" => 1e9,
        "m" | "min" => 60e9,
        "h" => 3600e9,
        _ => return Err(Error::config(format!("unknown duration unit '{unit}' in '{value}'"))),
    };
    if !number.is_finite() || number < 0.0 {
        return Err(Error::config(format!("duration must be non-negative: '{value}'")));
    }
    Ok(Duration::from_nanos((number * nanos_per_unit).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse_value {
        use super::*;

        #[test]
        fn decimal_and_binary_units() {
            assert_eq!(parse_value("100").unwrap(), 100.0);
            assert_eq!(parse_value("10k").unwrap(), 10_000.0);
            assert_eq!(parse_value("1M").unwrap(), 1_000_000.0);
            assert_eq!(parse_value("1.5g").unwrap(), 1.5e9);
            assert_eq!(parse_value("4KiB").unwrap(), 4096.0);
            assert_eq!(parse_value("2 mib").unwrap(), 2.0 * 1024.0 * 1024.0);
            assert_eq!(parse_value("1gib").unwrap(), 1024.0 * 1024.0 * 1024.0);
        }

        #[test]
        fn exponent_notation() {
            assert_eq!(parse_value("1e3").unwrap(), 1_000.0);
            assert_eq!(parse_value("2.5e2k").unwrap(), 250_000.0);
            assert_eq!(parse_value("1E-1").unwrap(), 0.1);
            assert_eq!(parse_value("+4e+1").unwrap(), 40.0);
        }

        #[test]
        fn rejects_garbage() {
            assert!(parse_value("").is_err());
            assert!(parse_value("k").is_err());
            assert!(parse_value("10x").is_err());
            assert!(parse_value("1e").is_err());
            assert!(parse_value("1.2.3").is_err());
        }
    }

    mod parse_time_length {
        use super::*;

        #[test]
        fn units_to_seconds() {
            assert_eq!(parse_time_length("60").unwrap(), 60);
            assert_eq!(parse_time_length("45s").unwrap(), 45);
            assert_eq!(parse_time_length("2seconds").unwrap(), 2);
            assert_eq!(parse_time_length("10m").unwrap(), 600);
            assert_eq!(parse_time_length("3min").unwrap(), 180);
            assert_eq!(parse_time_length("2 minutes").unwrap(), 120);
            assert_eq!(parse_time_length("1h").unwrap(), 3600);
            assert_eq!(parse_time_length("2hrs").unwrap(), 7200);
            assert_eq!(parse_time_length("1e1m").unwrap(), 600);
        }

        #[test]
        fn rejects_fractions_and_unknown_units() {
            assert!(parse_time_length("1.5").is_err());
            assert!(parse_time_length("-1").is_err());
            assert!(parse_time_length("5ms").is_err());
        }
    }

    mod parse_duration {
        use super::*;

        #[test]
        fn sub_second_units() {
            assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
            assert_eq!(parse_duration("1.5ms").unwrap(), Duration::from_micros(1_500));
            assert_eq!(parse_duration("100ns").unwrap(), Duration::from_nanos(100));
            assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
            assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
            assert_eq!(parse_duration("1e2ms").unwrap(), Duration::from_millis(100));
            assert!(parse_duration("-1ms").is_err());
        }
    }

    #[test]
    fn partial_documents_take_defaults() {
        let b: BenchmarkConfig =
            serde_json::from_str(r#"{"target_rate":"500","scheduler":{"kind":"pool","threads":2}}"#)
                .unwrap();
        assert_eq!(b.target_rate().unwrap(), 500.0);
        assert_eq!(b.run_time().unwrap(), Duration::from_secs(60));
        assert_eq!(b.scheduler, SchedulerKind::Pool { threads: 2 });
        b.validate().unwrap();

        let s: SearchConfig = serde_json::from_str(concat!(
            r#"{"sla":[{"percentile":50,"max_value_ms":5,"window_seconds":10}],"#,
            r#""measure_range":{"start":1000,"finish":9223372036854775807}}"#,
        ))
        .unwrap();
        assert_eq!(s.rate_percent_step, 10.0);
        assert_eq!(s.target_factor, Some(1.01));
        assert_eq!(s.measure_range.start, 1000);
        s.validate().unwrap();
    }

    #[test]
    fn initial_run_settings() {
        let s: SearchConfig = serde_json::from_str(concat!(
            r#"{"initial_rate":"2k","initial_warmup_time":"1m","#,
            r#""initial_run_time":"30","finer_rate_steps":3}"#,
        ))
        .unwrap();
        s.validate().unwrap();
        assert_eq!(s.initial_rate().unwrap(), Some(2_000.0));
        assert_eq!(s.initial_warmup_time().unwrap(), Duration::from_secs(60));
        assert_eq!(s.initial_run_time().unwrap(), Duration::from_secs(30));
        assert_eq!(s.finer_rate_steps, 3);
        assert!(s.reset_each_step);

        let defaults = SearchConfig::default();
        assert_eq!(defaults.initial_rate().unwrap(), None);
        assert!(defaults.initial_run_time().unwrap().is_zero());

        let bad = SearchConfig {
            initial_rate: Some("-5".into()),
            ..SearchConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn unmatched_window_fails_validation() {
        let s = SearchConfig {
            sla: vec![SlaRule::new(99.0, 20.0, 30).unwrap()],
            windows: Some(vec![10, 60]),
            ..SearchConfig::default()
        };
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("p99-sla20ms-mw30s"), "{err}");
    }

    #[test]
    fn benchmark_validation() {
        let mut b = BenchmarkConfig::default();
        b.validate().unwrap();
        b.target_rate = "0".into();
        assert!(b.validate().is_err());
        b.target_rate = "1k".into();
        b.run_time = "0".into();
        assert!(b.validate().is_err());
    }
}
