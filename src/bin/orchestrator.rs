// Conductor - workflow orchestration CLI
// Validates workflow definitions and runs them against live agent endpoints
// Run with: cargo run --bin orchestrator -- run --definition wf.json --registry agents.json

//! # Orchestrator Binary
//!
//! Command-line front end for the Conductor engine:
//! - `validate` checks a definition document offline (structure, cycles,
//!   branch and group shape) without touching any agent
//! - `run` registers the endpoints from a registry file, submits the
//!   definition with an input payload, watches the instance until it
//!   reaches a terminal state, and prints the final instance as JSON
//!
//! Engine tuning comes from `conductor.toml` / `CONDUCTOR_*` environment
//! variables; `.env` files are honored.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use conductor::{
    AgentEndpoint, AgentRef, EngineConfig, HttpAgentTransport, InMemoryWorkflowStorage,
    ResultAggregator, WorkflowDefinition, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "orchestrator", about = "Multi-agent workflow orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition document offline
    Validate {
        /// Path to the definition JSON document
        #[arg(long)]
        definition: PathBuf,
    },

    /// Submit a definition and watch the instance to completion
    Run {
        /// Path to the definition JSON document
        #[arg(long)]
        definition: PathBuf,

        /// Path to the input payload JSON; defaults to an empty object
        #[arg(long)]
        input: Option<PathBuf>,

        /// Path to the agent registry JSON (array of name/version/address)
        #[arg(long)]
        registry: PathBuf,

        /// Status poll interval while watching
        #[arg(long, default_value_t = 500)]
        watch_interval_ms: u64,
    },
}

/// One endpoint row in the registry file
#[derive(Debug, Deserialize)]
struct RegistryEntry {
    name: String,
    version: String,
    address: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { definition } => {
            let definition = load_definition(&definition)?;
            definition.validate()?;
            println!(
                "definition '{}' v{} is valid ({} top-level steps)",
                definition.id,
                definition.version,
                definition.steps.len()
            );
        }
        Commands::Run {
            definition,
            input,
            registry,
            watch_interval_ms,
        } => {
            let definition = load_definition(&definition)?;
            let input_payload = match input {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => serde_json::json!({}),
            };

            let agent_registry = Arc::new(conductor::AgentRegistry::new());
            let entries: Vec<RegistryEntry> =
                serde_json::from_str(&std::fs::read_to_string(registry)?)?;
            for entry in entries {
                info!(agent = %entry.name, version = %entry.version, address = %entry.address, "registering agent");
                agent_registry.register(AgentEndpoint::new(
                    AgentRef::new(entry.name, entry.version),
                    entry.address,
                ));
            }

            let engine = WorkflowEngine::new(
                agent_registry,
                Arc::new(HttpAgentTransport::new()),
                Arc::new(InMemoryWorkflowStorage::default()),
                ResultAggregator::with_common_rules(),
                EngineConfig::from_env()?,
            );

            let instance_id = engine.submit(definition, input_payload).await?;
            info!(instance = %instance_id, "submitted, watching");

            loop {
                let snapshot = engine.get_status(&instance_id).await?;
                if snapshot.status.is_terminal() {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    if let Some((step, error)) = snapshot.failing_step() {
                        eprintln!("failing step: {} ({})", step, error);
                    }
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(watch_interval_ms)).await;
            }
        }
    }

    Ok(())
}

fn load_definition(path: &PathBuf) -> Result<WorkflowDefinition, Box<dyn std::error::Error>> {
    let document = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&document)?)
}
