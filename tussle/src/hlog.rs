use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, UNIX_EPOCH},
};

use hdrhistogram::serialization::{
    V2Serializer,
    interval_log::{IntervalLogWriterBuilder, Tag},
};

use crate::{
    error::{Error, Result},
    histogram::HistogramSnapshot,
    recorder::IntervalSnapshot,
};

const LINES: [&str; 2] = ["service", "response"];

/// Writes the interval snapshots of one run as HdrHistogram interval logs, one file
/// per latency line: `<dir>/<label>_service.hlog` and `<dir>/<label>_response.hlog`.
///
/// Timestamps are relative to the first snapshot's start, which is recorded as the
/// log's base time. Values are in nanoseconds with a max value divisor turning them
/// into milliseconds.
pub fn write_run(dir: &Path, label: &str, snapshots: &[IntervalSnapshot]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let stem = sanitize(label);
    let mut written = Vec::with_capacity(LINES.len());
    for line in LINES {
        let path = dir.join(format!("{stem}_{line}.hlog"));
        let histograms = snapshots.iter().map(|s| match line {
            "service" => &s.service,
            _ => &s.response,
        });
        write_log(&path, line, histograms)?;
        written.push(path);
    }
    tracing::debug!(
        "Wrote {} interval histograms for '{label}' to {}",
        snapshots.len(),
        dir.display()
    );
    Ok(written)
}

fn write_log<'a>(
    path: &Path,
    tag: &str,
    histograms: impl Iterator<Item = &'a HistogramSnapshot> + Clone,
) -> Result<()> {
    let base_ms = histograms.clone().map(|h| h.start()).min().unwrap_or(0).max(0);
    let base = UNIX_EPOCH + Duration::from_millis(base_ms as u64);

    let mut out = BufWriter::new(File::create(path)?);
    let mut serializer = V2Serializer::new();
    let mut log = IntervalLogWriterBuilder::new()
        .with_base_time(base)
        .with_start_time(base)
        .with_max_value_divisor(1_000_000.0)
        .begin_log_with(&mut out, &mut serializer)?;
    for h in histograms {
        let start = Duration::from_millis((h.start() - base_ms).max(0) as u64);
        let length = Duration::from_millis((h.end() - h.start()).max(0) as u64);
        log.write_histogram(h.histogram(), start, length, Tag::new(tag))
            .map_err(|e| {
                Error::execution(format!("failed to write {}", path.display()), format!("{e:?}"))
            })?;
    }
    drop(log);
    out.flush()?;
    Ok(())
}

// tags and file names must not contain separators or whitespace
fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use hdrhistogram::serialization::interval_log::{IntervalLogIterator, LogEntry};

    use super::*;
    use crate::histogram::new_histogram;

    fn snapshot(start: i64, values: &[u64]) -> IntervalSnapshot {
        let mut h = new_histogram();
        for v in values {
            h.record(*v).unwrap();
        }
        IntervalSnapshot {
            service: HistogramSnapshot::new(h.clone(), start, start + 1_000),
            response: HistogramSnapshot::new(h, start, start + 1_000),
            errors: 0,
        }
    }

    #[test]
    fn writes_one_readable_log_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = vec![
            snapshot(1_700_000_000_000, &[1_000_000, 2_000_000]),
            snapshot(1_700_000_001_000, &[3_000_000]),
        ];
        let files = write_run(dir.path(), "step 1 @100/s", &snapshots).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("step_1__100_s_service.hlog"));

        let bytes = std::fs::read(&files[1]).unwrap();
        let intervals: Vec<_> = IntervalLogIterator::new(&bytes)
            .filter_map(|e| match e.unwrap() {
                LogEntry::Interval(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[1].start_timestamp(), Duration::from_secs(1));
        assert_eq!(intervals[0].tag().map(|t| t.as_str()), Some("response"));
    }
}
