use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::histogram::{HistogramSnapshot, new_histogram};
use internals::*;

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A closed recording interval: everything recorded since the previous snapshot.
#[derive(Debug, Clone)]
pub struct IntervalSnapshot {
    pub service: HistogramSnapshot,
    pub response: HistogramSnapshot,
    pub errors: u64,
}

impl IntervalSnapshot {
    pub fn start(&self) -> i64 {
        self.response.start()
    }

    pub fn end(&self) -> i64 {
        self.response.end()
    }
}

/// Concurrent recorder for service and response times.
///
/// Writers record into one of two phase buffers selected by a writer/reader phaser.
/// Each buffer is split into per-CPU shards so concurrent writers rarely contend. A
/// reader flips the active phase, waits for in-flight writers of the old phase to exit
/// and then drains it, so no sample is lost or counted twice.
pub struct TimeRecorder {
    phaser: WriterReaderPhaser,
    phases: [PhaseBuffer; 2],
    reader: Mutex<ReaderState>,
}

impl std::fmt::Debug for TimeRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeRecorder")
            .field("shards", &self.phases[0].service.len())
            .finish_non_exhaustive()
    }
}

impl Default for TimeRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeRecorder {
    pub fn new() -> Self {
        let shards = num_cpus::get().max(1);
        let started = now_ms();
        Self {
            phaser: WriterReaderPhaser::new(),
            phases: [PhaseBuffer::new(shards), PhaseBuffer::new(shards)],
            reader: Mutex::new(ReaderState {
                service: new_histogram(),
                response: new_histogram(),
                errors: 0,
                open_start_ms: started,
                total_service: new_histogram(),
                total_response: new_histogram(),
                total_errors: 0,
                first_start_ms: started,
            }),
        }
    }

    pub fn record_service(&self, nanos: u64) {
        let guard = self.phaser.writer_enter();
        self.phases[guard.phase()].service_shard().lock().saturating_record(nanos);
    }

    pub fn record_response(&self, nanos: u64) {
        let guard = self.phaser.writer_enter();
        self.phases[guard.phase()].response_shard().lock().saturating_record(nanos);
    }

    pub fn record_error(&self) {
        let guard = self.phaser.writer_enter();
        self.phases[guard.phase()].errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one finished operation.
    ///
    /// Service time is `finish - start`; response time is `finish - intended`, which
    /// includes any delay between the scheduled issue time and the actual start.
    /// Unsuccessful operations only count as errors.
    pub fn record_times(&self, start: Instant, intended: Instant, finish: Instant, success: bool) {
        if !success {
            self.record_error();
            return;
        }
        let service = finish.saturating_duration_since(start).as_nanos() as u64;
        let response = finish.saturating_duration_since(intended).as_nanos() as u64;
        let guard = self.phaser.writer_enter();
        let phase = &self.phases[guard.phase()];
        phase.service_shard().lock().saturating_record(service);
        phase.response_shard().lock().saturating_record(response);
    }

    /// Closes the current interval and returns everything recorded in it.
    ///
    /// Fresh histograms take over future writes before this returns. Consecutive
    /// snapshots cover adjacent, non-overlapping `[start, end]` ranges.
    pub fn snapshot_interval(&self) -> IntervalSnapshot {
        let mut state = self.reader.lock();
        self.drain(&mut state);
        let end = now_ms().max(state.open_start_ms);
        let start = std::mem::replace(&mut state.open_start_ms, end);
        let service = std::mem::replace(&mut state.service, new_histogram());
        let response = std::mem::replace(&mut state.response, new_histogram());
        IntervalSnapshot {
            service: HistogramSnapshot::new(service, start, end),
            response: HistogramSnapshot::new(response, start, end),
            errors: std::mem::take(&mut state.errors),
        }
    }

    /// Everything recorded since the recorder was created.
    ///
    /// Does not close the current interval: data collected here is still returned by
    /// the next [`snapshot_interval`](Self::snapshot_interval).
    pub fn totals(&self) -> IntervalSnapshot {
        let mut state = self.reader.lock();
        self.drain(&mut state);
        let start = state.first_start_ms;
        let end = now_ms().max(start);
        IntervalSnapshot {
            service: HistogramSnapshot::new(state.total_service.clone(), start, end),
            response: HistogramSnapshot::new(state.total_response.clone(), start, end),
            errors: state.total_errors,
        }
    }

    fn drain(&self, state: &mut ReaderState) {
        let inactive = self.phaser.flip_phase();
        let phase = &self.phases[inactive];
        for shard in &phase.service {
            let mut h = shard.lock();
            add_into(&mut state.service, &h);
            add_into(&mut state.total_service, &h);
            h.reset();
        }
        for shard in &phase.response {
            let mut h = shard.lock();
            add_into(&mut state.response, &h);
            add_into(&mut state.total_response, &h);
            h.reset();
        }
        let errors = phase.errors.swap(0, Ordering::Relaxed);
        state.errors += errors;
        state.total_errors += errors;
    }
}

fn add_into(target: &mut Histogram<u64>, source: &Histogram<u64>) {
    if source.is_empty() {
        return;
    }
    target
        .add(source)
        .expect("auto-resizing histogram accepts any addend");
}

struct ReaderState {
    service: Histogram<u64>,
    response: Histogram<u64>,
    errors: u64,
    open_start_ms: i64,
    total_service: Histogram<u64>,
    total_response: Histogram<u64>,
    total_errors: u64,
    first_start_ms: i64,
}

struct PhaseBuffer {
    service: Vec<Mutex<Histogram<u64>>>,
    response: Vec<Mutex<Histogram<u64>>>,
    errors: AtomicU64,
}

impl PhaseBuffer {
    fn new(shards: usize) -> Self {
        Self {
            service: (0..shards).map(|_| Mutex::new(new_histogram())).collect(),
            response: (0..shards).map(|_| Mutex::new(new_histogram())).collect(),
            errors: AtomicU64::new(0),
        }
    }

    fn service_shard(&self) -> &Mutex<Histogram<u64>> {
        &self.service[shard_index() % self.service.len()]
    }

    fn response_shard(&self) -> &Mutex<Histogram<u64>> {
        &self.response[shard_index() % self.response.len()]
    }
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
}

fn shard_index() -> usize {
    SHARD.with(|s| *s)
}

#[cfg(feature = "internals")]
pub use internals::*;

mod internals {
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Epoch-based writer/reader phaser.
    ///
    /// Writers enter by incrementing `start_epoch`; the sign of the value they saw
    /// selects the phase (non-negative is even, negative is odd). Leaving bumps the end
    /// epoch of that phase. A reader flips by swapping `start_epoch` to the other
    /// phase's initial value, then waits until the old phase's end epoch catches up
    /// with the swapped-out start value.
    ///
    /// Only one reader may flip at a time; callers serialize flips with their own lock.
    pub struct WriterReaderPhaser {
        start_epoch: AtomicI64,
        even_end_epoch: AtomicI64,
        odd_end_epoch: AtomicI64,
    }

    pub struct WriterGuard<'a> {
        phaser: &'a WriterReaderPhaser,
        enter: i64,
    }

    impl WriterGuard<'_> {
        /// Index of the phase buffer this writer must use.
        pub fn phase(&self) -> usize {
            if self.enter < 0 { 1 } else { 0 }
        }
    }

    impl Drop for WriterGuard<'_> {
        fn drop(&mut self) {
            if self.enter < 0 {
                self.phaser.odd_end_epoch.fetch_add(1, Ordering::SeqCst);
            } else {
                self.phaser.even_end_epoch.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl Default for WriterReaderPhaser {
        fn default() -> Self {
            Self::new()
        }
    }

    impl WriterReaderPhaser {
        pub fn new() -> Self {
            Self {
                start_epoch: AtomicI64::new(0),
                even_end_epoch: AtomicI64::new(0),
                odd_end_epoch: AtomicI64::new(i64::MIN),
            }
        }

        pub fn writer_enter(&self) -> WriterGuard<'_> {
            WriterGuard {
                phaser: self,
                enter: self.start_epoch.fetch_add(1, Ordering::SeqCst),
            }
        }

        /// Switches writers to the other phase and waits until the previous phase is
        /// quiescent. Returns the index of the now inactive phase.
        pub fn flip_phase(&self) -> usize {
            let next_is_even = self.start_epoch.load(Ordering::SeqCst) < 0;
            let initial = if next_is_even { 0 } else { i64::MIN };
            if next_is_even {
                self.even_end_epoch.store(initial, Ordering::SeqCst);
            } else {
                self.odd_end_epoch.store(initial, Ordering::SeqCst);
            }
            let start_at_flip = self.start_epoch.swap(initial, Ordering::SeqCst);
            let old_end = if next_is_even {
                &self.odd_end_epoch
            } else {
                &self.even_end_epoch
            };
            while old_end.load(Ordering::SeqCst) != start_at_flip {
                std::thread::yield_now();
            }
            if next_is_even { 1 } else { 0 }
        }
    }
}
