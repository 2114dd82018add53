//! detrace - determinism, record/replay, and self-consistency harness.
//!
//! ## Commands
//!
//! - `record`: run a task live and persist its recording
//! - `replay`: re-run a recording without network (strict/warn/hybrid)
//! - `consistency`: N seeded runs plus consensus and reliability analysis
//! - `policy`: list, show, and activate safety policies
//! - `gc`: apply retention classes to the artifact store
//!
//! Exit codes: 0 success, 2 policy violation, 3 replay mismatch,
//! 4 adapter error, 5 configuration error, 1 generic failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::Level;

use detrace_core::{retention, RetentionClass, RunStatus, StorageClass};
use detrace_safety::PolicyManager;
use detrace_engine::adapter::{Adapter, ParityMode, ScriptedAdapter, TaskSpec};
use detrace_engine::consensus::{analyze, ConsensusStrategy, RunSample};
use detrace_engine::multi_run::{run_group, ExecutionMode, MultiRunConfig, SeedStrategy};
use detrace_engine::{
    record_run, replay_run, EngineError, ReplayMode, ReplayOptions, ReplayRunOptions, RunOptions,
    RunResult,
};

#[derive(Parser)]
#[command(name = "detrace")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Determinism, record/replay, and self-consistency harness", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct CommonArgs {
    /// Orchestration framework to drive
    #[arg(long, default_value = "scripted")]
    framework: String,

    /// Task id or path to a task file (JSON)
    #[arg(long)]
    task: Option<String>,

    /// Artifact output directory
    #[arg(long, default_value = "artifacts")]
    out: PathBuf,

    /// Run seed
    #[arg(long, env = "SEED", default_value_t = 42)]
    seed: u64,

    /// Active safety policy name
    #[arg(long, env = "SAFETY_POLICY", default_value = "standard")]
    policy: String,

    /// Directory of extra policy files to load
    #[arg(long)]
    policy_dir: Option<PathBuf>,

    /// Parity mode: autonomous applies changes, advisory plans only
    #[arg(long, default_value = "autonomous")]
    mode: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a live run of a task
    Record {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Replay a recorded run by run id
    Replay {
        #[command(flatten)]
        common: CommonArgs,

        /// Run id of the recording under --out
        #[arg(long)]
        run: String,

        /// strict, warn, or a hybrid map like llm=strict,tool=warn
        #[arg(long, env = "REPLAY_MODE", default_value = "strict")]
        replay_mode: String,

        /// Skip calls recorded before this step
        #[arg(long)]
        from_checkpoint: Option<u64>,

        /// Halt once a lookup passes this step
        #[arg(long)]
        until_step: Option<u64>,

        /// Collapse inter-chunk waits to zero
        #[arg(long)]
        fast: bool,
    },

    /// Run a task N times and compute consensus and reliability
    Consistency {
        #[command(flatten)]
        common: CommonArgs,

        /// Number of runs
        #[arg(long, default_value_t = 5)]
        runs: usize,

        /// majority, weighted, threshold, unanimous, or best_of_n
        #[arg(long, default_value = "majority")]
        strategy: String,

        /// τ for the threshold strategy
        #[arg(long)]
        threshold: Option<f64>,

        /// Explicit comma-separated seed list
        #[arg(long, value_delimiter = ',')]
        seeds: Option<Vec<u64>>,

        /// Run children in parallel
        #[arg(long)]
        parallel: bool,

        /// Exclude Tukey outliers from the variance metrics
        #[arg(long)]
        exclude_outliers: bool,
    },

    /// Inspect and activate safety policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Apply retention classes to the artifact store
    Gc {
        /// Artifact output directory
        #[arg(long, default_value = "artifacts")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// List known policies
    List,
    /// Show one policy as YAML
    Show { name: String },
    /// Validate and activate a policy
    Set {
        name: String,
        /// Directory of extra policy files to load first
        #[arg(long)]
        policy_dir: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DETRACE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        );
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// On-disk task file: the task plus an optional adapter script.
#[derive(serde::Deserialize)]
struct TaskFile {
    id: String,
    #[serde(default)]
    input: serde_json::Value,
    #[serde(default)]
    script: serde_json::Value,
}

async fn load_adapter(
    framework: &str,
    task_arg: Option<&str>,
) -> Result<(Box<dyn Adapter>, TaskSpec), EngineError> {
    if framework != "scripted" {
        return Err(EngineError::Configuration(format!(
            "unknown framework: {framework:?} (built-in: scripted)"
        )));
    }

    match task_arg {
        None => Ok((
            Box::new(ScriptedAdapter::echo_hello()),
            TaskSpec::new("echo-hello", json!({"prompt": "say hi"})),
        )),
        Some(arg) if Path::new(arg).exists() => {
            let raw = std::fs::read_to_string(arg)?;
            let file: TaskFile = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Configuration(format!("task file {arg}: {e}")))?;
            let mut adapter = ScriptedAdapter::default();
            adapter.configure(file.script).await?;
            Ok((Box::new(adapter), TaskSpec::new(file.id, file.input)))
        }
        Some(id) => Ok((
            Box::new(ScriptedAdapter::echo_hello()),
            TaskSpec::new(id, json!({})),
        )),
    }
}

fn setup_policies(common: &CommonArgs) -> Result<Arc<PolicyManager>, EngineError> {
    let policies = Arc::new(PolicyManager::new());
    if let Some(dir) = &common.policy_dir {
        policies.load_dir(dir)?;
    }
    if !policies.set_active(&common.policy) {
        return Err(EngineError::Configuration(format!(
            "policy {:?} unknown or invalid; refusing to start",
            common.policy
        )));
    }
    Ok(policies)
}

fn run_options(common: &CommonArgs) -> Result<RunOptions, EngineError> {
    let parity = match common.mode.as_str() {
        "autonomous" => ParityMode::Autonomous,
        "advisory" => ParityMode::Advisory,
        other => {
            return Err(EngineError::Configuration(format!(
                "unknown parity mode: {other:?}"
            )))
        }
    };
    let mut opts = RunOptions::new(&common.framework, &common.out, common.seed);
    opts.parity = parity;
    opts.repo_root = std::env::current_dir()?;
    Ok(opts)
}

fn exit_for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Ok => 0,
        RunStatus::PolicyViolation => 2,
        RunStatus::ReplayMismatch => 3,
        RunStatus::AdapterError => 4,
        _ => 1,
    }
}

fn report_run(result: &RunResult) -> i32 {
    println!(
        "{}",
        serde_json::to_string_pretty(result).unwrap_or_else(|_| result.trace_id.clone())
    );
    exit_for_status(result.status)
}

async fn execute(cli: Cli) -> Result<i32, EngineError> {
    match cli.command {
        Commands::Record { common } => {
            let policies = setup_policies(&common)?;
            let (adapter, task) = load_adapter(&common.framework, common.task.as_deref()).await?;
            let opts = run_options(&common)?;
            let result = record_run(adapter.as_ref(), &task, &opts, &policies).await?;
            Ok(report_run(&result))
        }

        Commands::Replay {
            common,
            run,
            replay_mode,
            from_checkpoint,
            until_step,
            fast,
        } => {
            let policies = setup_policies(&common)?;
            let (adapter, task) = load_adapter(&common.framework, common.task.as_deref()).await?;
            let opts = run_options(&common)?;
            let replay_opts = ReplayRunOptions {
                recording_dir: common.out.join(&run),
                replay: ReplayOptions {
                    mode: ReplayMode::parse(&replay_mode)?,
                    fast,
                    from_checkpoint,
                    until_step,
                    ..Default::default()
                },
            };
            let result =
                replay_run(adapter.as_ref(), &task, &opts, &policies, &replay_opts).await?;
            Ok(report_run(&result))
        }

        Commands::Consistency {
            common,
            runs,
            strategy,
            threshold,
            seeds,
            parallel,
            exclude_outliers,
        } => {
            let policies = setup_policies(&common)?;
            let (adapter, task) = load_adapter(&common.framework, common.task.as_deref()).await?;
            let opts = run_options(&common)?;
            let strategy = ConsensusStrategy::parse(&strategy, threshold)?;

            let config = MultiRunConfig {
                n: runs,
                mode: if parallel {
                    ExecutionMode::Parallel
                } else {
                    ExecutionMode::Serial
                },
                seeds: match seeds {
                    Some(list) => SeedStrategy::Explicit(list),
                    None => SeedStrategy::Sequential { start: common.seed },
                },
            };

            let adapter: Arc<dyn Adapter> = Arc::from(adapter);
            let (_cancel_tx, cancel) = tokio::sync::watch::channel(false);
            let (_group, results) =
                run_group(adapter, &task, &opts, &policies, &config, cancel).await?;

            let samples: Vec<RunSample> = results.iter().map(RunSample::from).collect();
            let report = analyze(&task.id, samples, strategy, exclude_outliers)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report)
                    .map_err(EngineError::Serialization)?
            );
            Ok(0)
        }

        Commands::Policy { action } => {
            let policies = PolicyManager::new();
            match action {
                PolicyAction::List => {
                    for name in ["disabled", "permissive", "standard", "strict", "paranoid"] {
                        let policy = policies
                            .get_policy(name)
                            .ok_or_else(|| EngineError::Configuration(name.to_string()))?;
                        println!("{name}\t{}", policy.digest());
                    }
                }
                PolicyAction::Show { name } => {
                    let policy = policies.get_policy(&name).ok_or_else(|| {
                        EngineError::Configuration(format!("unknown policy: {name:?}"))
                    })?;
                    print!(
                        "{}",
                        serde_yaml::to_string(policy.as_ref())
                            .map_err(|e| EngineError::Configuration(e.to_string()))?
                    );
                }
                PolicyAction::Set { name, policy_dir } => {
                    if let Some(dir) = policy_dir {
                        policies.load_dir(&dir)?;
                    }
                    if !policies.set_active(&name) {
                        return Err(EngineError::Configuration(format!(
                            "policy {name:?} unknown or invalid"
                        )));
                    }
                    let active = policies.active_policy();
                    println!("{}\t{}", active.name, active.digest());
                }
            }
            Ok(0)
        }

        Commands::Gc { out } => {
            let classes = [
                RetentionClass::builtin(StorageClass::Dev),
                RetentionClass::builtin(StorageClass::Ci),
                RetentionClass::builtin(StorageClass::Prod),
            ];
            let report = retention::sweep(&out, &classes)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).map_err(EngineError::Serialization)?
            );
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}
