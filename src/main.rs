use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipegraph_core::config::FlowConfig;
use pipegraph_core::error::FlowError;
use pipegraph_core::types::Value;
use pipegraph_engine::ComponentFactory;

#[derive(Parser)]
#[command(name = "pipegraph", version, about = "Run stateful pipeline graphs from flow files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a flow and execute one pipeline
    Run {
        /// Path to the flow file
        flow: PathBuf,
        /// Pipeline to execute
        #[arg(short, long)]
        pipeline: String,
        /// JSON input (read from stdin if omitted; non-JSON text is sent as a string)
        #[arg(short, long)]
        input: Option<String>,
        /// Wait for connected pipelines before printing the result (the process
        /// always waits for them before exiting)
        #[arg(long)]
        await_dispatch: bool,
    },
    /// Compile a flow and report every validation problem
    Validate {
        /// Path to the flow file
        flow: PathBuf,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pipegraph", &mut std::io::stdout());
            Ok(())
        }
        Commands::Validate { flow } => {
            let config = load_flow(&flow)?;
            init_tracing(&config);
            validate(&config)
        }
        Commands::Run {
            flow,
            pipeline,
            input,
            await_dispatch,
        } => {
            let config = load_flow(&flow)?;
            init_tracing(&config);
            let input = match input {
                Some(text) => parse_input(&text),
                None => parse_input(&read_stdin()),
            };
            run(&config, &pipeline, input, await_dispatch).await
        }
    }
}

fn load_flow(path: &Path) -> anyhow::Result<FlowConfig> {
    FlowConfig::load(path).with_context(|| format!("loading flow {}", path.display()))
}

/// `RUST_LOG` wins over the flow file's `[log] filter`.
fn init_tracing(config: &FlowConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_stdin() -> String {
    let stdin = io::stdin();
    let lines: Vec<String> = stdin.lock().lines().map_while(|l| l.ok()).collect();
    lines.join("\n")
}

fn parse_input(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn validate(config: &FlowConfig) -> anyhow::Result<()> {
    let mut graph = ComponentFactory::with_builtins().build(config)?;
    match graph.compile() {
        Ok(()) => {
            for name in graph.pipeline_names() {
                let count = graph.pipeline(name).map(|p| p.len()).unwrap_or_default();
                println!("pipeline {name}: {count} component(s)");
            }
            println!("{} connection(s)", graph.connections().len());
            println!("ok");
            Ok(())
        }
        Err(FlowError::GraphValidation { violations }) => {
            for violation in &violations {
                println!("error: {violation}");
            }
            anyhow::bail!("{} validation error(s)", violations.len())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run(
    config: &FlowConfig,
    pipeline: &str,
    input: Value,
    await_dispatch: bool,
) -> anyhow::Result<()> {
    let mut graph = ComponentFactory::with_builtins().build(config)?;
    graph.compile()?;
    info!(pipeline = %pipeline, await_dispatch, "Running flow");

    let result = if await_dispatch {
        graph.execute_and_await(pipeline, input).await
    } else {
        graph.execute(pipeline, input).await
    };
    if let Ok(result) = &result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }

    // Waits for any dispatch still running before components are disposed.
    if let Err(e) = graph.shutdown().await {
        warn!(error = %e, "Shutdown reported problems");
    }

    result.with_context(|| format!("executing pipeline '{pipeline}'"))?;
    Ok(())
}
