use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgate_core::config::AppConfig;
use flowgate_core::error::FlowgateError;
use flowgate_core::event::EventBus;
use flowgate_core::types::{ToolContext, WorkflowEvent};

use flowgate_tools::ToolRegistry;
use flowgate_workflow::{
    BuiltinTemplates, CommandWorker, DiagramOptions, Direction, EvidenceLedger, ExecuteOptions,
    ExecutionOutcome, GraphDefinition, RunLogger, SnapshotStore, TemplateProvider, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Gated DAG workflows for coding agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph (JSON/TOML file or template name) with the command worker
    Run {
        definition: String,
        /// Condition context as a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Override [engine].concurrency_limit
        #[arg(long)]
        concurrency: Option<usize>,
        /// Complete gated nodes without evidence (audited)
        #[arg(long)]
        bypass_gates: bool,
    },
    /// Print critical path, parallel groups and token estimates
    Analyze { definition: String },
    /// Print a Mermaid flowchart
    Diagram {
        definition: String,
        /// TD, LR, BT or RL
        #[arg(long, default_value = "TD")]
        direction: String,
        /// Include node state colouring
        #[arg(long)]
        states: bool,
    },
    /// List built-in workflow templates
    Templates,
    /// List the tool surface
    Tools,
    /// Invoke a single tool with JSON input
    Tool {
        name: String,
        #[arg(default_value = "{}")]
        input: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowgate=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowgate", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let ledger = Arc::new(EvidenceLedger::new());
    let engine = Arc::new(build_engine(config, ledger.clone()).await?);

    match cli.command {
        Commands::Run {
            definition,
            context,
            concurrency,
            bypass_gates,
        } => {
            let definition = load_definition(&definition, engine.templates().as_ref())?;
            let context = match context {
                Some(raw) => serde_json::from_str(&raw).context("--context must be JSON")?,
                None => serde_json::json!({}),
            };
            run(&engine, definition, context, concurrency, bypass_gates).await?;
        }
        Commands::Analyze { definition } => {
            let definition = load_definition(&definition, engine.templates().as_ref())?;
            let created = engine.create_graph(definition, serde_json::json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&created.summary)?);
        }
        Commands::Diagram {
            definition,
            direction,
            states,
        } => {
            let definition = load_definition(&definition, engine.templates().as_ref())?;
            let options = DiagramOptions {
                direction: direction.parse::<Direction>()?,
                node_states: states,
            };
            let created = engine.create_graph(definition, serde_json::json!({})).await?;
            println!("{}", engine.export_diagram(&created.graph_id, &options).await?);
        }
        Commands::Templates => {
            for template in engine.templates().list() {
                println!(
                    "  {:<10} {:>2} nodes  {}",
                    template.name, template.node_count, template.description
                );
            }
        }
        Commands::Tools => {
            let registry = tool_registry(&engine, ledger);
            for def in registry.definitions() {
                println!("  {:<16} {}", def.name, def.description);
            }
        }
        Commands::Tool { name, input } => {
            let input: serde_json::Value =
                serde_json::from_str(&input).context("tool input must be JSON")?;
            let registry = tool_registry(&engine, ledger);
            let result = registry
                .execute(&name, input, ToolContext::new("cli"))
                .await?;
            println!("{}", serde_json::to_string_pretty(&result.content)?);
            if result.is_error {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(engine.config())?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    match AppConfig::load(path) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded config");
            Ok(config)
        }
        Err(FlowgateError::ConfigNotFound(_)) => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

async fn build_engine(
    config: AppConfig,
    ledger: Arc<EvidenceLedger>,
) -> anyhow::Result<WorkflowEngine> {
    let snapshots = if config.snapshot.enabled {
        let path = config.snapshot_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Some(Arc::new(SnapshotStore::open(&path)?))
    } else {
        None
    };

    let mut engine = WorkflowEngine::new(config, ledger)
        .with_templates(Arc::new(BuiltinTemplates))
        .with_event_bus(Arc::new(EventBus::default()));
    if let Some(snapshots) = snapshots {
        engine = engine.with_snapshots(snapshots);
        let restored = engine.restore().await?;
        if restored > 0 {
            info!(count = restored, "Restored graphs from snapshots");
        }
    }
    Ok(engine)
}

fn tool_registry(engine: &Arc<WorkflowEngine>, ledger: Arc<EvidenceLedger>) -> ToolRegistry {
    let worker = Arc::new(CommandWorker::new(engine.config().workspace_dir()));
    ToolRegistry::with_workflow_tools(engine.clone(), ledger, worker)
}

/// Resolve a definition argument: a `.json`/`.toml` file, else a template name.
fn load_definition(arg: &str, templates: &dyn TemplateProvider) -> anyhow::Result<GraphDefinition> {
    let path = Path::new(arg);
    if path.is_file() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let definition = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        return Ok(definition);
    }
    templates
        .get(arg)
        .ok_or_else(|| FlowgateError::TemplateNotFound(arg.to_string()).into())
}

async fn run(
    engine: &Arc<WorkflowEngine>,
    definition: GraphDefinition,
    context: serde_json::Value,
    concurrency: Option<usize>,
    bypass_gates: bool,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let logger = engine.config().log.enabled.then(|| {
        let logger = RunLogger::new(engine.config().log_dir(), engine.config().log.level);
        tokio::spawn(logger.run(engine.event_bus().clone(), None, cancel.clone()))
    });

    // Progress printer
    let mut rx = engine.event_bus().subscribe();
    let printer_cancel = cancel.clone();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = printer_cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => print_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
            }
        }
    });

    let worker = Arc::new(CommandWorker::new(engine.config().workspace_dir()));
    let options = ExecuteOptions {
        concurrency_limit: concurrency,
        bypass_gates,
        actor: "cli".to_string(),
    };
    let summary = engine
        .execute_graph(definition, context, options, worker)
        .await;

    // Let the printer drain what is already queued.
    tokio::task::yield_now().await;
    cancel.cancel();
    printer.await.ok();
    if let Some(logger) = logger {
        logger.await.ok();
    }

    let summary = summary?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    match summary.outcome {
        ExecutionOutcome::Completed => Ok(()),
        outcome => anyhow::bail!("graph {} ended {:?}", summary.graph_id, outcome),
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::NodeStarted {
            node_id, attempt, ..
        } => eprintln!("[start] {} (attempt {})", node_id, attempt),
        WorkflowEvent::NodeCompleted {
            node_id, branch, ..
        } => match branch {
            Some(branch) => eprintln!("[done] {} -> {}", node_id, branch),
            None => eprintln!("[done] {}", node_id),
        },
        WorkflowEvent::NodeBlocked {
            node_id,
            missing,
            failing,
            ..
        } => eprintln!(
            "[blocked] {} missing={:?} failing={:?}",
            node_id, missing, failing
        ),
        WorkflowEvent::NodeRetrying {
            node_id,
            attempt,
            error,
            ..
        } => eprintln!("[retry] {} attempt {}: {}", node_id, attempt, error),
        WorkflowEvent::NodeFailed { node_id, error, .. } => {
            eprintln!("[failed] {}: {}", node_id, error)
        }
        WorkflowEvent::NodeSkipped { node_id, .. } => eprintln!("[skipped] {}", node_id),
        WorkflowEvent::GateBypassed {
            node_id, reason, ..
        } => eprintln!("[BYPASS] {}: {}", node_id, reason),
        _ => {}
    }
}
