use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing::{info, warn};
use tussle::{
    BoxError, Interval, Reporter, Scenario, SchedulerKind, SlaRule, StepSearch, TimeRecorder,
    WorkloadParams, WorkloadRegistry,
    config::{BenchmarkConfig, SearchConfig},
    report::{JsonReporter, LogReporter, RunSummary, SearchReport},
};

/// Paces a workload at a target rate and searches for the highest rate that keeps
/// every latency SLA.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// Workload tag: process, sleep or string
    workload: String,

    /// Workload parameter as key=value, repeatable (e.g. cmd="sleep 0.01", sleep=2ms)
    #[arg(long = "param", short = 'p', value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Initial target rate in ops/s (10k, 1.5m)
    #[arg(long, env = "TUSSLE_RATE", default_value = "1k")]
    rate: String,

    /// Length of each measured run (60, 5m, 1h)
    #[arg(long, env = "TUSSLE_RUN_TIME", default_value = "60")]
    run_time: String,

    /// Warmup before each measured run
    #[arg(long, env = "TUSSLE_WARMUP_TIME", default_value = "0")]
    warmup_time: String,

    /// Scheduler: single, pool[:threads] or async[:max_in_flight]
    #[arg(long, env = "TUSSLE_SCHEDULER", default_value = "single")]
    scheduler: SchedulerKind,

    /// Rate change per step, in percent
    #[arg(long, default_value_t = 10.0)]
    step: f64,

    #[arg(long, default_value_t = 20)]
    max_steps: u32,

    /// SLA as percentile:max_ms:window_s[:service|response], repeatable
    #[arg(long = "sla")]
    sla: Vec<SlaRule>,

    /// Moving windows in seconds, derived from the SLAs when omitted
    #[arg(long = "window", value_delimiter = ',')]
    windows: Vec<u32>,

    /// Reject steps whose achieved rate times this factor is below target, 0 disables
    #[arg(long, default_value_t = 1.01)]
    target_factor: f64,

    /// Re-runs of a rejected boundary rate before converging
    #[arg(long, default_value_t = 0)]
    boundary_retries: u32,

    /// Intermediate rates tried inside the converged bracket
    #[arg(long, default_value_t = 0)]
    finer_steps: u32,

    /// Rate of the unjudged initial run, --rate when omitted
    #[arg(long)]
    initial_rate: Option<String>,

    /// Warmup of the initial run
    #[arg(long, default_value = "0")]
    initial_warmup_time: String,

    /// Measured part of the initial run, logged but never judged
    #[arg(long, default_value = "0")]
    initial_run_time: String,

    /// Keep workload state between steps
    #[arg(long)]
    no_reset: bool,

    /// Interval snapshot length in ms
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Log progress every N intervals, 0 disables
    #[arg(long, default_value_t = 5)]
    progress_intervals: u32,

    /// Only intervals within [start, end] ms of each run's start count toward SLAs
    #[arg(long, value_parser = parse_range)]
    measure_range: Option<Interval>,

    /// Write HdrHistogram interval logs per run into this directory
    #[arg(long, env = "TUSSLE_HISTOGRAMS_DIR")]
    histograms_dir: Option<PathBuf>,

    /// Run once at --rate instead of searching
    #[arg(long)]
    single_run: bool,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    Ok((key.trim().to_string(), value.to_string()))
}

fn parse_range(s: &str) -> Result<Interval, String> {
    let (start, end) = s
        .split_once(',')
        .ok_or_else(|| format!("expected start,end in ms, got '{s}'"))?;
    let bound = |v: &str, open: i64| match v.trim() {
        "" => Ok(open),
        v => v.parse::<i64>().map_err(|e| format!("invalid bound '{v}': {e}")),
    };
    Ok(Interval::new(bound(start, i64::MIN)?, bound(end, i64::MAX)?, "measure"))
}

impl Args {
    fn configs(&self) -> (BenchmarkConfig, SearchConfig) {
        let bench = BenchmarkConfig {
            name: self.workload.clone(),
            target_rate: self.rate.clone(),
            run_time: self.run_time.clone(),
            warmup_time: self.warmup_time.clone(),
            interval_length_ms: self.interval_ms,
            progress_intervals: self.progress_intervals,
            histograms_dir: self.histograms_dir.clone(),
            scheduler: self.scheduler,
        };
        let search = SearchConfig {
            rate_percent_step: self.step,
            max_steps: self.max_steps,
            target_factor: (self.target_factor > 0.0).then_some(self.target_factor),
            boundary_retries: self.boundary_retries,
            sla: self.sla.clone(),
            windows: (!self.windows.is_empty()).then(|| self.windows.clone()),
            measure_range: self.measure_range.clone().unwrap_or_default(),
            initial_rate: self.initial_rate.clone(),
            initial_warmup_time: self.initial_warmup_time.clone(),
            initial_run_time: self.initial_run_time.clone(),
            finer_rate_steps: self.finer_steps,
            reset_each_step: !self.no_reset,
        };
        (bench, search)
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!(?args, "Starting tussle");

    let registry = WorkloadRegistry::with_builtins();
    let params: WorkloadParams = args.params.iter().cloned().collect();
    let workload = registry.create(&args.workload, &params)?;
    let (bench, search) = args.configs();

    let scenario = Scenario::builder()
        .name(bench.name.clone())
        .workload(workload)
        .scheduler(bench.scheduler.build())
        .build();

    if args.single_run {
        bench.validate()?;
        let result = scenario
            .run(bench.target_rate()?, bench.run_time()?, Arc::new(TimeRecorder::new()))
            .await?;
        let summary = RunSummary::from(&result);
        if args.json {
            JsonReporter { pretty: true }.report(&summary).await?;
        } else {
            LogReporter.report(&summary).await?;
        }
        return Ok(());
    }

    if search.sla.is_empty() {
        warn!("No SLA given, steps are only judged on achieved rate");
    }
    let outcome = match StepSearch::from_config(scenario, &bench, &search)?.run().await {
        Ok(outcome) => outcome,
        Err(tussle::Error::Search(e)) => {
            for step in e.accepted() {
                info!(
                    "Accepted before failure: step {} at {:.1} op/s (achieved {:.1} op/s)",
                    step.step, step.target_rate, step.result.achieved_rate
                );
            }
            return Err(tussle::Error::Search(e).into());
        }
        Err(e) => return Err(e.into()),
    };

    let report = SearchReport::from(&outcome);
    if args.json {
        JsonReporter { pretty: true }.report(&report).await?;
    } else {
        LogReporter.report(&report).await?;
    }
    Ok(())
}
