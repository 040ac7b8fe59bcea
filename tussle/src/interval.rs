use std::fmt;

use serde::{Deserialize, Serialize};

/// A time range in milliseconds, possibly unbounded on either side.
///
/// `i64::MIN` as `start` and `i64::MAX` as `finish` mean "unset". Intervals are
/// widened with [`Interval::update`] as timestamps are observed and become read-only
/// once the run that owns them completes.
///
/// A relative interval is rebased onto absolute time with [`Interval::adjust`] exactly
/// once; the `adjusted` flag makes later calls no-ops and survives clones and
/// [`Interval::scale`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub finish: i64,
    #[serde(default)]
    pub name: String,
    #[serde(skip)]
    pub adjusted: bool,
}

impl Default for Interval {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl Interval {
    pub fn new(start: i64, finish: i64, name: impl Into<String>) -> Self {
        Self {
            start,
            finish,
            name: name.into(),
            adjusted: false,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(i64::MIN, i64::MAX, "")
    }

    pub fn is_bounded(&self) -> bool {
        self.start != i64::MIN && self.finish != i64::MAX
    }

    /// Widens the interval to include every given timestamp.
    pub fn update(&mut self, stamps: &[i64]) {
        for &stamp in stamps {
            if self.start == i64::MIN || self.start > stamp {
                self.start = stamp;
            }
            if self.finish == i64::MAX || self.finish < stamp {
                self.finish = stamp;
            }
        }
    }

    /// Whether `[start, finish]` overlaps this interval.
    pub fn contains(&self, start: i64, finish: i64) -> bool {
        start <= finish && self.start < finish && start <= self.finish
    }

    /// Shifts the bounded sides by `offset`, leaving sentinels untouched.
    ///
    /// Only the first call has an effect.
    pub fn adjust(&mut self, offset: i64) {
        if self.adjusted {
            return;
        }
        self.adjusted = true;
        if self.start != i64::MIN {
            self.start += offset;
        }
        if self.finish != i64::MAX {
            self.finish += offset;
        }
    }

    pub fn scale(&self, factor: i64) -> Self {
        let mul = |v: i64| {
            if v == i64::MIN || v == i64::MAX {
                v
            } else {
                v * factor
            }
        };
        Self {
            start: mul(self.start),
            finish: mul(self.finish),
            name: self.name.clone(),
            adjusted: self.adjusted,
        }
    }

    pub fn length_ms(&self) -> Option<i64> {
        self.is_bounded().then(|| self.finish - self.start)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = |v: i64| match v {
            i64::MIN => "MIN".to_string(),
            i64::MAX => "MAX".to_string(),
            v => v.to_string(),
        };
        write!(f, "{},{},{}", stamp(self.start), stamp(self.finish), self.name)
    }
}
