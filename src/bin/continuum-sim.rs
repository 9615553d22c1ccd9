//! Continuum simulator
//!
//! Spins up an in-process ring, registers one routine from the first node
//! and prints what every node ended up with.

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use continuum::{
    ContinuumError, InMemoryEngine, LocalRing, NodeId, RoutineConfig, RoutineId, StartRequestData,
};

#[derive(Parser)]
#[command(
    name = "continuum-sim",
    version,
    about = "Simulate cluster-wide routine registration on an in-process ring"
)]
struct Cli {
    /// Number of nodes in the ring
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Index (0-based) of a node whose engine rejects every start; repeatable
    #[arg(long = "fail-node")]
    fail_nodes: Vec<usize>,

    /// Listener factory name
    #[arg(short, long, default_value = "orders")]
    factory: String,

    /// Events buffered before a batch is delivered
    #[arg(long, default_value_t = 1)]
    buffer_size: usize,

    /// Unregister the routine after a successful registration
    #[arg(long)]
    unregister: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.nodes == 0 {
        bail!("a ring needs at least one node");
    }
    if let Some(index) = cli.fail_nodes.iter().find(|index| **index >= cli.nodes) {
        bail!("--fail-node {} is outside a ring of {} nodes", index, cli.nodes);
    }

    let config = match &cli.config {
        Some(path) => RoutineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => RoutineConfig::default(),
    };

    let ring = LocalRing::new();
    let mut nodes = Vec::with_capacity(cli.nodes);
    for index in 0..cli.nodes {
        let engine = InMemoryEngine::default();
        engine.set_failing(cli.fail_nodes.contains(&index));
        let node_id = NodeId::new();
        ring.join(node_id, Arc::new(engine), config.clone())?;
        nodes.push(node_id);
    }

    let initiator = ring
        .processor(nodes[0])
        .context("initiating node is not in the ring")?;
    let request = StartRequestData::new(cli.factory.clone()).with_buffer_size(cli.buffer_size);

    let pending = initiator.start_routine(request).await?;
    let routine_id = pending.routine_id();
    let outcome = pending.outcome().await;
    ring.settled().await;

    let mut unregistered = false;
    if cli.unregister && outcome.is_ok() {
        initiator.unregister_routine(routine_id).await?;
        ring.settled().await;
        unregistered = true;
    }

    let mut states = Vec::with_capacity(nodes.len());
    for node_id in &nodes {
        let state = match ring.processor(*node_id) {
            Some(processor) => processor.registry().state(routine_id).await,
            None => None,
        };
        states.push((*node_id, state));
    }

    if cli.json {
        print_json(routine_id, &outcome, unregistered, &states)?;
    } else {
        print_report(routine_id, &outcome, unregistered, &states);
    }

    ring.shutdown();
    Ok(())
}

type NodeStates = [(NodeId, Option<continuum::RegistrationState>)];

fn print_json(
    routine_id: RoutineId,
    outcome: &Result<RoutineId, ContinuumError>,
    unregistered: bool,
    states: &NodeStates,
) -> Result<()> {
    let failures: serde_json::Map<String, serde_json::Value> = outcome
        .as_ref()
        .err()
        .and_then(ContinuumError::node_errors)
        .map(|errs| {
            errs.iter()
                .map(|(node, err)| (node.to_string(), json!(err.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let report = json!({
        "routine_id": routine_id.to_string(),
        "registered": outcome.is_ok(),
        "unregistered": unregistered,
        "error": outcome.as_ref().err().map(|err| err.to_string()),
        "failures": failures,
        "nodes": states
            .iter()
            .map(|(node, state)| json!({ "node_id": node.to_string(), "state": state }))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_report(
    routine_id: RoutineId,
    outcome: &Result<RoutineId, ContinuumError>,
    unregistered: bool,
    states: &NodeStates,
) {
    println!("{} {}", "Routine".bold(), routine_id.to_string().cyan());
    match outcome {
        Ok(_) => println!("  {} registered on every node", "✓".green()),
        Err(err) => {
            println!("  {} {}", "✗".red(), err);
            if let Some(errs) = err.node_errors() {
                for (node, cause) in errs {
                    println!("    {} {}", node.to_string().yellow(), cause);
                }
            }
        }
    }
    if unregistered {
        println!("  {} unregistered", "✓".green());
    }

    println!("{}", "Nodes".bold());
    for (node, state) in states {
        let state = match state {
            Some(state) => format!("{:?}", state).green(),
            None => "not registered".dimmed(),
        };
        println!("  {}  {}", node, state);
    }
}
