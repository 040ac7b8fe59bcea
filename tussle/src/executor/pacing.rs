use std::time::{Duration, Instant};

/// Remaining time below which [`sleep_until`] stops sleeping and spins.
pub const SPIN_THRESHOLD: Duration = Duration::from_micros(250);

/// The async timer only has millisecond granularity.
pub const ASYNC_SPIN_THRESHOLD: Duration = Duration::from_millis(1);

/// Fixed-rate schedule: operation `n` is intended at `start + n * interval`.
///
/// Intended times depend only on `n`, never on when earlier operations actually ran,
/// so a stalled run falls behind instead of silently lowering its rate.
#[derive(Clone, Copy, Debug)]
pub struct Schedule {
    start: Instant,
    interval_ns: f64,
}

impl Schedule {
    pub fn new(start: Instant, rate: f64) -> Self {
        Self {
            start,
            interval_ns: 1e9 / rate,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_ns as u64)
    }

    pub fn intended(&self, n: u64) -> Instant {
        self.start + Duration::from_nanos((n as f64 * self.interval_ns) as u64)
    }
}

/// Blocks the current thread until `deadline`.
///
/// Sleeps coarsely until [`SPIN_THRESHOLD`] before the deadline, then busy-spins.
pub fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_THRESHOLD {
            std::thread::sleep(remaining - SPIN_THRESHOLD);
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Async counterpart of [`sleep_until`]; spins only for the last millisecond.
pub async fn sleep_until_async(deadline: Instant) {
    if let Some(coarse) = deadline.checked_sub(ASYNC_SPIN_THRESHOLD) {
        if coarse > Instant::now() {
            tokio::time::sleep_until(coarse.into()).await;
        }
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}
