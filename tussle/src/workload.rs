use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::{parse_duration, parse_value},
    error::{BoxError, Error, Result},
    process::{LogSink, OutputSink, ProcessRequest, ProcessRunner},
};

/// The operation being benchmarked.
///
/// `Ok(true)` is a successful operation, `Ok(false)` a failed one that is counted as
/// an error while the run continues. `Err` aborts the run.
///
/// `reset` is called before each step of a search that resets between steps; stateful
/// workloads drop whatever earlier runs left behind there.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use tussle::{Workload, workload::from_fn};
///
/// let ping: Arc<dyn Workload> = Arc::new(|| async { Ok::<_, tussle::BoxError>(true) });
/// let add: Arc<dyn Workload> = Arc::new(from_fn(|| 1 + 1 == 2));
/// ```
#[async_trait]
pub trait Workload: Send + Sync {
    async fn call(&self) -> std::result::Result<bool, BoxError>;

    async fn reset(&self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

#[async_trait]
impl<F, Fut> Workload for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<bool, BoxError>> + Send + 'static,
{
    async fn call(&self) -> std::result::Result<bool, BoxError> {
        (self)().await
    }
}

/// Synchronous closure workload, see [`from_fn`].
pub struct FnWorkload<F>(F);

/// Wraps a synchronous closure returning success.
pub fn from_fn<F>(f: F) -> FnWorkload<F>
where
    F: Fn() -> bool + Send + Sync,
{
    FnWorkload(f)
}

#[async_trait]
impl<F> Workload for FnWorkload<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn call(&self) -> std::result::Result<bool, BoxError> {
        Ok((self.0)())
    }
}

/// Runs one external process per operation on the blocking thread pool.
///
/// A non-zero exit is an operation error when the request does not expect success,
/// and aborts the run otherwise. A timeout always aborts the run.
pub struct ProcessWorkload {
    request: Arc<ProcessRequest>,
    sink: Arc<dyn OutputSink>,
}

impl ProcessWorkload {
    pub fn new(request: ProcessRequest) -> Self {
        let sink = Arc::new(LogSink::new(request.name.clone()));
        Self::with_sink(request, sink)
    }

    pub fn with_sink(request: ProcessRequest, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            request: Arc::new(request),
            sink,
        }
    }
}

#[async_trait]
impl Workload for ProcessWorkload {
    async fn call(&self) -> std::result::Result<bool, BoxError> {
        let request = self.request.clone();
        let sink = self.sink.clone();
        let outcome =
            tokio::task::spawn_blocking(move || ProcessRunner.run(&request, &*sink)).await??;
        Ok(outcome.success())
    }
}

/// String parameters for a registry workload, e.g. from `--param sleep=2ms`.
#[derive(Clone, Debug, Default)]
pub struct WorkloadParams(HashMap<String, String>);

impl WorkloadParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn duration(&self, key: &str, default: Duration) -> Result<Duration> {
        self.get(key).map_or(Ok(default), parse_duration)
    }

    pub fn count(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => {
                let n = parse_value(v)?;
                if n < 0.0 || n.fract() != 0.0 {
                    return Err(Error::config(format!(
                        "parameter '{key}' must be a whole number, got '{v}'"
                    )));
                }
                Ok(n as usize)
            }
        }
    }
}

impl FromIterator<(String, String)> for WorkloadParams {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub type WorkloadFactory = fn(&WorkloadParams) -> Result<Arc<dyn Workload>>;

/// Maps configuration tags to workload factories.
#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    factories: BTreeMap<String, WorkloadFactory>,
}

impl fmt::Debug for WorkloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `process` and, with the `builtins` feature, `sleep` and `string`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("process", process_workload);
        #[cfg(feature = "builtins")]
        {
            registry.register("sleep", builtins::sleep_workload);
            registry.register("string", builtins::string_workload);
        }
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, factory: WorkloadFactory) {
        self.factories.insert(tag.into(), factory);
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, tag: &str, params: &WorkloadParams) -> Result<Arc<dyn Workload>> {
        let factory = self.factories.get(tag).ok_or_else(|| {
            Error::config(format!(
                "unknown workload '{tag}', known: {}",
                self.tags().collect::<Vec<_>>().join(", ")
            ))
        })?;
        factory(params)
    }
}

/// `cmd` (whitespace separated), `dir`, `env` (comma separated `VAR=value`),
/// `timeout` (default 60s), `name`.
fn process_workload(params: &WorkloadParams) -> Result<Arc<dyn Workload>> {
    let command: Vec<String> = params
        .get("cmd")
        .ok_or_else(|| Error::config("process workload needs a 'cmd' parameter"))?
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let env = params
        .get("env")
        .map(|e| e.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    let request = ProcessRequest {
        name: params.get("name").unwrap_or("process").to_string(),
        work_dir: params.get("dir").map(PathBuf::from),
        command,
        env,
        timeout: params.duration("timeout", Duration::from_secs(60))?,
        expect_success: params.get("expect_success").is_none_or(|v| v != "false"),
    };
    Ok(Arc::new(ProcessWorkload::new(request)))
}

#[cfg(feature = "builtins")]
mod builtins {
    use std::time::Instant;

    use rand::{Rng, distributions::Alphanumeric};

    use super::*;
    use crate::executor::pacing::sleep_until_async;

    /// Spin-sleeps for `sleep` (default 1ms) per operation.
    pub struct SleepWorkload {
        pub sleep: Duration,
    }

    #[async_trait]
    impl Workload for SleepWorkload {
        async fn call(&self) -> std::result::Result<bool, BoxError> {
            if !self.sleep.is_zero() {
                sleep_until_async(Instant::now() + self.sleep).await;
            }
            Ok(true)
        }
    }

    /// Builds a random alphanumeric string of `len..=len_max` characters per operation.
    pub struct StringWorkload {
        pub len: usize,
        pub len_max: usize,
    }

    #[async_trait]
    impl Workload for StringWorkload {
        async fn call(&self) -> std::result::Result<bool, BoxError> {
            let mut rng = rand::thread_rng();
            let len = rng.gen_range(self.len..=self.len_max);
            let s: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect();
            Ok(std::hint::black_box(s).len() == len)
        }
    }

    pub fn sleep_workload(params: &WorkloadParams) -> Result<Arc<dyn Workload>> {
        Ok(Arc::new(SleepWorkload {
            sleep: params.duration("sleep", Duration::from_millis(1))?,
        }))
    }

    pub fn string_workload(params: &WorkloadParams) -> Result<Arc<dyn Workload>> {
        let len = params.count("len", 8)?;
        let len_max = params.count("len_max", len)?;
        if len_max < len {
            return Err(Error::config(format!("len_max ({len_max}) is below len ({len})")));
        }
        Ok(Arc::new(StringWorkload { len, len_max }))
    }
}

#[cfg(feature = "builtins")]
pub use builtins::{SleepWorkload, StringWorkload};
