use std::fmt;

use hdrhistogram::Histogram;

use crate::interval::Interval;

/// Significant value digits kept by every latency histogram.
pub const SIGNIFICANT_DIGITS: u8 = 3;

const NANOS_PER_MS: f64 = 1_000_000.0;

pub(crate) fn new_histogram() -> Histogram<u64> {
    // auto-resizing, so recording never fails on large values
    Histogram::new(SIGNIFICANT_DIGITS).expect("3 significant digits is a valid precision")
}

/// A latency distribution over a closed time range.
///
/// Values are recorded in nanoseconds; every query returns milliseconds. The interval
/// bounds are ms since the UNIX epoch and are widened by [`HistogramSnapshot::add`].
#[derive(Clone)]
pub struct HistogramSnapshot {
    histogram: Histogram<u64>,
    interval: Interval,
}

impl fmt::Debug for HistogramSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistogramSnapshot")
            .field("count", &self.count())
            .field("interval", &self.interval)
            .finish()
    }
}

impl Default for HistogramSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl HistogramSnapshot {
    pub fn empty() -> Self {
        Self {
            histogram: new_histogram(),
            interval: Interval::unbounded(),
        }
    }

    pub fn new(histogram: Histogram<u64>, start_ms: i64, end_ms: i64) -> Self {
        let mut interval = Interval::unbounded();
        interval.update(&[start_ms, end_ms]);
        Self {
            histogram,
            interval,
        }
    }

    pub fn record(&mut self, nanos: u64) {
        self.histogram.saturating_record(nanos);
    }

    pub fn record_ms(&mut self, ms: f64) {
        self.record((ms * NANOS_PER_MS).round().max(0.0) as u64);
    }

    pub fn histogram(&self) -> &Histogram<u64> {
        &self.histogram
    }

    pub fn interval(&self) -> &Interval {
        &self.interval
    }

    pub fn start(&self) -> i64 {
        self.interval.start
    }

    pub fn end(&self) -> i64 {
        self.interval.finish
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn min_ms(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.histogram.min() as f64 / NANOS_PER_MS
    }

    pub fn max_ms(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.histogram.max() as f64 / NANOS_PER_MS
    }

    pub fn mean_ms(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.histogram.mean() / NANOS_PER_MS
    }

    /// Value at `percentile` (0..=100) in ms, zero when empty.
    pub fn value_at_percentile_ms(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.histogram.value_at_percentile(percentile) as f64 / NANOS_PER_MS
    }

    /// Adds every sample of `other` and widens the interval to cover it.
    pub fn add(&mut self, other: &HistogramSnapshot) {
        self.histogram
            .add(&other.histogram)
            .expect("auto-resizing histogram accepts any addend");
        if other.interval.start != i64::MIN {
            self.interval.update(&[other.interval.start]);
        }
        if other.interval.finish != i64::MAX {
            self.interval.update(&[other.interval.finish]);
        }
    }

    /// Replaces the covered time range, keeping its name.
    pub fn set_interval(&mut self, start_ms: i64, end_ms: i64) {
        self.interval.start = start_ms;
        self.interval.finish = end_ms;
    }

    /// Removes the samples of a snapshot previously added to this one.
    ///
    /// The interval is left as is; see [`Self::set_interval`].
    ///
    /// # Panics
    ///
    /// When `other` holds samples this snapshot does not contain.
    pub fn subtract(&mut self, other: &HistogramSnapshot) {
        if let Err(e) = self.histogram.subtract(&other.histogram) {
            panic!("subtracted a histogram that was never added: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_values(ms: impl IntoIterator<Item = u64>, start: i64, end: i64) -> HistogramSnapshot {
        let mut h = new_histogram();
        for v in ms {
            h.record(v * 1_000_000).unwrap();
        }
        HistogramSnapshot::new(h, start, end)
    }

    #[test]
    fn empty_queries_are_zero() {
        let s = HistogramSnapshot::empty();
        assert_eq!(s.count(), 0);
        assert_eq!(s.value_at_percentile_ms(99.0), 0.0);
        assert_eq!(s.mean_ms(), 0.0);
        assert_eq!((s.start(), s.end()), (i64::MIN, i64::MAX));
    }

    #[test]
    fn add_widens_interval_and_sums_counts() {
        let mut a = with_values([1, 2, 3], 1_000, 2_000);
        let b = with_values([10, 20], 2_000, 3_000);
        a.add(&b);
        assert_eq!(a.count(), 5);
        assert_eq!((a.start(), a.end()), (1_000, 3_000));
        assert!((a.max_ms() - 20.0).abs() < 0.05);
    }

    #[test]
    fn subtract_undoes_add() {
        let mut a = with_values([1, 2, 3], 0, 10);
        let b = with_values([40, 50], 10, 20);
        a.add(&b);
        a.subtract(&b);
        assert_eq!(a.count(), 3);
        assert!(a.max_ms() < 3.01);
    }

    #[test]
    #[should_panic(expected = "never added")]
    fn subtract_foreign_samples_panics() {
        let mut a = with_values([1], 0, 10);
        let b = with_values([1, 1, 1], 0, 10);
        a.subtract(&b);
    }
}
