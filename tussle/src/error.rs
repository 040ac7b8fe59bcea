use std::time::Duration;

use crate::search::StepRecord;

/// Boxed error returned by workloads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid rule, rate, duration or unmatched SLA window. Raised before any run starts.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The workload raised an error or a process could not be launched or exited badly.
    #[error("{context}: {source}")]
    Execution {
        context: String,
        #[source]
        source: BoxError,
    },

    /// An external process did not exit before its deadline and was killed.
    #[error("process '{name}' has not finished within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Search(Box<SearchError>),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn execution(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Execution {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// A step search aborted by a failing run.
///
/// Keeps every step completed before the failure so callers can still report the
/// accepted rates.
#[derive(Debug, thiserror::Error)]
#[error("step search failed at step {step}: {source}")]
pub struct SearchError {
    /// 1-based, 0 when the initial run failed.
    pub step: usize,
    pub history: Vec<StepRecord>,
    #[source]
    pub source: Error,
}

impl SearchError {
    /// Steps that were accepted before the failure.
    pub fn accepted(&self) -> impl Iterator<Item = &StepRecord> {
        self.history.iter().filter(|s| s.accepted)
    }
}

impl From<SearchError> for Error {
    fn from(value: SearchError) -> Self {
        Self::Search(Box::new(value))
    }
}
