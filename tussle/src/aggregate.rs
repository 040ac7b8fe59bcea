use std::{collections::VecDeque, fmt::Debug};

use crate::histogram::HistogramSnapshot;

/// The `Aggregate` trait describes a mergeable summary of latency samples.
///
/// Aggregates do not compute final statistics themselves beyond what SLA checks need;
/// summaries such as [`RunSummary`](crate::report::RunSummary) are derived from them
/// later.
///
/// # Implementor notes
/// - `merge` must be associative and commutative so merge order does not matter.
/// - `unmerge` is the exact inverse of `merge` for an aggregate that was previously
///   merged in. Removing something that was never merged is a contract violation and
///   may panic.
/// - `end_time_ms` is the end of the time range the aggregate covers, used to decide
///   when it falls out of a moving window.
/// - `unmerge` leaves the time range alone; whoever removes parts calls `set_span`
///   with the range of what is left.
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Combine another aggregate into this one.
    fn merge(&mut self, other: &Self);

    /// Remove an aggregate previously merged into this one.
    fn unmerge(&mut self, other: &Self);

    fn start_time_ms(&self) -> i64;

    fn end_time_ms(&self) -> i64;

    /// Replace the time range the aggregate covers.
    fn set_span(&mut self, start_ms: i64, end_ms: i64);
}

impl Aggregate for HistogramSnapshot {
    fn new() -> Self {
        HistogramSnapshot::empty()
    }

    fn merge(&mut self, other: &Self) {
        self.add(other);
    }

    fn unmerge(&mut self, other: &Self) {
        self.subtract(other);
    }

    fn start_time_ms(&self) -> i64 {
        self.start()
    }

    fn end_time_ms(&self) -> i64 {
        self.end()
    }

    fn set_span(&mut self, start_ms: i64, end_ms: i64) {
        self.set_interval(start_ms, end_ms);
    }
}

/// Running sum over the snapshots whose end falls within the last `window_ms`.
///
/// Each [`add`](Self::add) merges the new snapshot, then evicts queued snapshots whose
/// end-time is at or before `new.end - window_ms`, so `sum` always equals the merge of
/// the queue, time range included. Snapshots are expected in time order. Evictions are
/// amortized O(1) per snapshot.
#[derive(Debug, Clone)]
pub struct MovingWindowAggregator<T: Aggregate = HistogramSnapshot> {
    sum: T,
    queue: VecDeque<T>,
    window_ms: i64,
}

impl<T: Aggregate> MovingWindowAggregator<T> {
    pub fn new(window_ms: i64) -> Self {
        Self {
            sum: T::new(),
            queue: VecDeque::new(),
            window_ms,
        }
    }

    pub fn add(&mut self, snapshot: T) {
        self.sum.merge(&snapshot);
        let cutoff = snapshot.end_time_ms().saturating_sub(self.window_ms);
        while self
            .queue
            .front()
            .is_some_and(|head| head.end_time_ms() <= cutoff)
        {
            if let Some(expired) = self.queue.pop_front() {
                self.sum.unmerge(&expired);
            }
        }
        self.queue.push_back(snapshot);
        if let (Some(first), Some(last)) = (self.queue.front(), self.queue.back()) {
            let (start, end) = (first.start_time_ms(), last.end_time_ms());
            self.sum.set_span(start, end);
        }
    }

    pub fn sum(&self) -> &T {
        &self.sum
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Number of snapshots currently inside the window.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.queue.iter()
    }
}

impl MovingWindowAggregator<HistogramSnapshot> {
    pub fn count(&self) -> u64 {
        self.sum.count()
    }

    pub fn value_ms(&self, percentile: f64) -> f64 {
        self.sum.value_at_percentile_ms(percentile)
    }
}
