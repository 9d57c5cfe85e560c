//! Command line entry point for job management and the result scanner.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use time::OffsetDateTime;

use lagopus::classifier::{Classifier, CrashInput, ExitStatusClassifier};
use lagopus::config::{self, LagopusConfig};
use lagopus::ingest::ResultScanner;
use lagopus::jobs::{self, JobId, JobRequest, JobService};
use lagopus::logging;
use lagopus::orchestrator::{KubeOrchestrator, Orchestrator};
use lagopus::startup::{ConnectPolicy, wait_until_ready};
use lagopus::store::Store;

/// Never raised: the scanner loop and startup waits end only when the process is killed.
static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "lagopus")]
#[command(version)]
#[command(about = "Fuzzing job lifecycle and crash ingestion")]
struct Args {
    /// Configuration file (defaults to config.toml in the app directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import crashes from finished jobs
    Scan {
        /// Run a single pass and print its statistics
        #[arg(long)]
        once: bool,
        /// Override the jobs root directory
        #[arg(long)]
        jobs_dir: Option<PathBuf>,
        /// Report what would be imported without touching the store or markers
        #[arg(long)]
        no_export: bool,
        /// Seconds between passes
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Create and submit a fuzzing job
    Submit {
        name: String,
        /// Fuzzing driver: afl or libfuzzer
        driver: String,
        /// Target zip with corpus/, target and, for afl, target.conf
        target: PathBuf,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in MiB
        #[arg(long)]
        memory: Option<u32>,
        /// Deadline in seconds
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// Show one job or list all jobs
    Jobs { job_id: Option<String> },
    /// Terminate a running job
    Kill { job_id: String },
    /// List imported crashes
    Crashes {
        #[arg(long)]
        job: Option<String>,
    },
    /// Extract a crash sample from a job's results
    Sample {
        job_id: String,
        sample: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Classify a target run from its captured output and exit code
    Analyze {
        #[arg(long)]
        output_file: PathBuf,
        #[arg(long, allow_hyphen_values = true)]
        exit_code: i32,
        /// Epoch seconds of the run (defaults to now)
        #[arg(long)]
        time: Option<i64>,
    },
}

fn main() {
    if let Err(err) = run(Args::parse()) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), String> {
    let config = match &args.config {
        Some(path) => config::load_from(path),
        None => config::load_or_default(),
    }
    .map_err(|err| err.to_string())?;
    if let Err(err) = logging::init(&config.logging) {
        eprintln!("Logging disabled: {err}");
    }
    let policy = ConnectPolicy::from_settings(&config.scanner);

    match args.command {
        Command::Scan {
            once,
            jobs_dir,
            no_export,
            interval,
        } => {
            let jobs_root = jobs_dir.unwrap_or_else(|| config.dirs.jobs.clone());
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.scanner.interval());
            let classifier = ExitStatusClassifier;
            if no_export {
                let scanner = ResultScanner::dry_run(jobs_root, &classifier);
                return scan(&scanner, once, interval);
            }
            let store = open_store(&config, policy)?;
            let scanner = ResultScanner::new(jobs_root, &store, &classifier);
            scan(&scanner, once, interval)
        }
        Command::Submit {
            name,
            driver,
            target,
            cpus,
            memory,
            deadline,
        } => {
            let store = open_store(&config, policy)?;
            let orchestrator = connect_orchestrator(&config, policy)?;
            let service = JobService::new(&store, &orchestrator, &config);
            let job = service
                .create(&JobRequest {
                    name,
                    driver,
                    target,
                    cpus,
                    memory_mib: memory,
                    deadline_secs: deadline,
                })
                .map_err(|err| err.to_string())?;
            print_json(&job)
        }
        Command::Jobs { job_id } => {
            let store = open_store(&config, policy)?;
            let orchestrator = orchestrator_client(&config)?;
            let service = JobService::new(&store, &orchestrator, &config);
            match job_id {
                Some(id) => {
                    let job_id = JobId::from_string(id);
                    let job = service
                        .get(&job_id)
                        .map_err(|err| err.to_string())?
                        .ok_or_else(|| format!("No such job: {job_id}"))?;
                    print_json(&job)
                }
                None => print_json(&service.list().map_err(|err| err.to_string())?),
            }
        }
        Command::Kill { job_id } => {
            let store = open_store(&config, policy)?;
            let orchestrator = orchestrator_client(&config)?;
            let service = JobService::new(&store, &orchestrator, &config);
            let job_id = JobId::from_string(job_id);
            service.kill(&job_id).map_err(|err| err.to_string())?;
            print_json(&serde_json::json!({ "job_id": job_id, "killed": true }))
        }
        Command::Crashes { job } => {
            let store = open_store(&config, policy)?;
            let job = job.map(JobId::from_string);
            let crashes = store
                .list_crashes(job.as_ref())
                .map_err(|err| err.to_string())?;
            print_json(&crashes)
        }
        Command::Sample {
            job_id,
            sample,
            out,
        } => {
            let job_id = JobId::from_string(job_id);
            let path = jobs::extract_sample(&config.dirs.jobs, &job_id, &sample, &out)
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("No sample '{sample}' in results of {job_id}"))?;
            print_json(&serde_json::json!({ "path": path }))
        }
        Command::Analyze {
            output_file,
            exit_code,
            time,
        } => {
            let bytes = fs::read(&output_file)
                .map_err(|err| format!("Failed to read {}: {err}", output_file.display()))?;
            let input = CrashInput {
                output: String::from_utf8_lossy(&bytes).into_owned(),
                exit_code,
                timestamp: time.unwrap_or_else(|| OffsetDateTime::now_utc().unix_timestamp()),
            };
            print_json(&ExitStatusClassifier.classify(&input))
        }
    }
}

fn scan(scanner: &ResultScanner<'_>, once: bool, interval: Duration) -> Result<(), String> {
    if once {
        let stats = scanner.scan_once().map_err(|err| err.to_string())?;
        return print_json(&stats);
    }
    scanner.run(interval, &STOP);
    Ok(())
}

fn open_store(config: &LagopusConfig, policy: ConnectPolicy) -> Result<Store, String> {
    let mut store = None;
    wait_until_ready("store", policy, &STOP, || {
        store = Some(Store::open(&config.store.path)?);
        Ok::<(), lagopus::store::StoreError>(())
    })
    .map_err(|err| err.to_string())?;
    store.ok_or_else(|| "Store unavailable".to_string())
}

/// Client without a startup ping; reads fall back to stored status when the
/// cluster is unreachable.
fn orchestrator_client(config: &LagopusConfig) -> Result<KubeOrchestrator, String> {
    KubeOrchestrator::from_settings(&config.orchestrator).map_err(|err| err.to_string())
}

/// Submission waits for the cluster the same way the scanner waits for the store.
fn connect_orchestrator(
    config: &LagopusConfig,
    policy: ConnectPolicy,
) -> Result<KubeOrchestrator, String> {
    let orchestrator = orchestrator_client(config)?;
    wait_until_ready("orchestrator", policy, &STOP, || orchestrator.ping())
        .map_err(|err| err.to_string())?;
    Ok(orchestrator)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{text}");
    Ok(())
}
