mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgate_core::config::{AppConfig, RoutingMode};
use flowgate_core::event::EventBus;
use flowgate_core::flow::Flow;
use flowgate_core::traits::{AiTaskRunner, ExecutionStore};
use flowgate_core::types::{ExecutionId, FlowEvent, InboundMessage};
use flowgate_flow::{FlowExecutor, RunOptions, StepDeps, StepRegistry, VariableResolver};
use flowgate_pipeline::{
    ChannelDelegator, DispatchPipeline, FlowCatalog, IntentRouter, PersonaRegistry,
};
use flowgate_router::{build_clients, ClassifyContext, TaskClassifier, TaskRouter};
use flowgate_store::{open_store, SqliteStore};

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Flow automation and tiered message dispatch")]
struct Cli {
    /// Path to config file (default: ~/.flowgate/config.toml when present)
    #[arg(short, long, env = "FLOWGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a flow document and print its validation errors
    Validate {
        /// Flow JSON file
        flow: PathBuf,
    },
    /// Run a flow, printing progress events as JSON lines
    Run {
        /// Flow JSON file
        flow: PathBuf,
        /// Run input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// Reuse an execution id to replay logged node outputs
        #[arg(long)]
        execution_id: Option<String>,
    },
    /// Classify a task description and print the result
    Classify {
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// Send a message through the dispatch pipeline
    Dispatch {
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
        /// Directory of flow JSON files
        #[arg(long)]
        flows: Option<PathBuf>,
        #[arg(long, default_value = "cli")]
        channel: String,
        #[arg(long, default_value = "cli-user")]
        sender: String,
        /// Override the configured routing mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// List recent runs from the SQLite store
    History {
        #[arg(long)]
        flow: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Run configuration health checks
    Doctor {
        /// Also validate every flow in this directory
        #[arg(long)]
        flows: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    FlowFirst,
    AiFirst,
    Balanced,
}

impl From<ModeArg> for RoutingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::FlowFirst => RoutingMode::FlowFirst,
            ModeArg::AiFirst => RoutingMode::AiFirst,
            ModeArg::Balanced => RoutingMode::Balanced,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowgate=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { flow } => {
            let flow = read_flow(&flow)?;
            let runtime = Runtime::build(&config)?;
            let errors = runtime.executor.validate(&flow);
            if errors.is_empty() {
                println!("{}: ok ({} nodes, {} edges)", flow.id, flow.nodes.len(), flow.edges.len());
                return Ok(());
            }
            for error in &errors {
                println!("{}: {}", flow.id, error);
            }
            anyhow::bail!("{} validation error(s)", errors.len());
        }
        Commands::Run {
            flow,
            input,
            execution_id,
        } => {
            let flow = read_flow(&flow)?;
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let runtime = Runtime::build(&config)?;

            // Print events as they arrive
            let mut events = runtime.executor.events().subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                    if matches!(
                        event,
                        FlowEvent::ExecutionComplete { .. } | FlowEvent::ExecutionError { .. }
                    ) {
                        break;
                    }
                }
            });

            let mut opts = RunOptions::new(input);
            if let Some(id) = execution_id {
                opts = opts.with_execution_id(ExecutionId::from_str(&id));
            }
            let outcome = runtime.executor.execute(&flow, opts).await;
            let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

            let outcome = outcome?;
            println!("{}", serde_json::to_string_pretty(&outcome.record)?);
            if !outcome.is_success() {
                anyhow::bail!("run {} ended {}", outcome.record.execution_id, outcome.status());
            }
        }
        Commands::Classify { text } => {
            let classification =
                TaskClassifier::new().classify(&text.join(" "), &ClassifyContext::default());
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }
        Commands::Dispatch {
            text,
            flows,
            channel,
            sender,
            mode,
        } => {
            let runtime = Runtime::build(&config)?;
            let catalog = match flows {
                Some(dir) => FlowCatalog::load_dir(&dir)?,
                None => FlowCatalog::new(),
            };

            let (delegator, mut queued) = ChannelDelegator::new(16);
            tokio::spawn(async move {
                while let Some(request) = queued.recv().await {
                    info!(
                        delegation_id = %request.receipt.delegation_id,
                        persona = %request.receipt.persona_id,
                        "Delegation queued (no persona workers in CLI mode)"
                    );
                }
            });

            let intents = IntentRouter::from_configs(
                &config.intents,
                runtime.router.clone() as Arc<dyn AiTaskRunner>,
            );
            let pipeline = DispatchPipeline::new(runtime.executor.clone(), config.pipeline.clone())
                .with_preprocess(config.preprocess.clone())?
                .with_flows(catalog)
                .with_intents(intents)
                .with_personas(PersonaRegistry::from_configs(&config.personas))
                .with_delegator(Arc::new(delegator))
                .with_router(runtime.router.clone());

            let message = InboundMessage::new(channel, sender, text.join(" "));
            let result = match mode {
                Some(mode) => pipeline.dispatch_with_mode(message, mode.into()).await,
                None => pipeline.dispatch(message).await,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::History { flow, limit } => {
            let path = config
                .store_path()
                .context("no [store] path configured; run history is not persisted")?;
            let store = SqliteStore::open(&path)?;
            let runs = store.list_executions(flow.as_deref(), limit)?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for run in runs {
                println!(
                    "{}  {:<10} {:<24} {:>7}ms  {}",
                    run.started_at,
                    run.status.as_str(),
                    run.flow_id,
                    run.duration_ms,
                    run.execution_id
                );
            }
        }
        Commands::Doctor { flows } => {
            let runtime = Runtime::build(&config)?;
            let issues = doctor::run_doctor(&config, runtime.executor.registry(), flows.as_deref());
            if issues > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Shared components, built once per process.
struct Runtime {
    executor: Arc<FlowExecutor>,
    router: Arc<TaskRouter>,
}

impl Runtime {
    fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let clients = build_clients(&config.providers);
        if clients.is_empty() {
            warn!("No providers configured; AI steps and fallback routing will fail");
        }
        let router = Arc::new(TaskRouter::new(config.router.clone()).with_clients(clients));

        let deps = StepDeps {
            ai: Some(router.clone() as Arc<dyn AiTaskRunner>),
            max_delay: Duration::from_millis(config.executor.max_delay_ms),
            ..StepDeps::default()
        };
        let registry = Arc::new(StepRegistry::with_builtins(deps));
        let resolver = Arc::new(VariableResolver::new(&config.resolver.env_allowlist));
        let events = Arc::new(EventBus::new(config.executor.event_capacity));
        let store: Arc<dyn ExecutionStore> = open_store(config)?;

        let executor = FlowExecutor::new(registry, resolver, events, config.executor.clone())
            .with_store(store);

        Ok(Self {
            executor: Arc::new(executor),
            router,
        })
    }
}

/// Explicit path, then `~/.flowgate/config.toml`, then defaults.
fn load_config(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    if let Some(path) = explicit {
        return Ok(AppConfig::load(path)?);
    }
    match AppConfig::default_path() {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(AppConfig::load(&path)?)
        }
        _ => Ok(AppConfig::default()),
    }
}

fn read_flow(path: &Path) -> anyhow::Result<Flow> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read flow file {}", path.display()))?;
    Flow::from_json(&json).with_context(|| format!("cannot parse flow file {}", path.display()))
}
