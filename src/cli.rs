//! CLI commands for agent-relay using clap.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::clock;
use crate::config::{load_settings_from, load_settings_or_default, Settings};
use crate::core::{AgentRegistry, QueueManager};
use crate::daemon::run_coordinator_daemon;
use crate::transport;

/// agent-relay - coordination substrate for supervisor and worker agents.
#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(version)]
#[command(about = "Envelope relay and task coordinator for agents", long_about = None)]
pub struct Commands {
    /// Settings file (default: ~/.agent-relay/settings.json)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the coordinator daemon
    Run,

    /// Show queue statistics
    Stats,

    /// List dead-lettered envelopes for an agent
    DeadLetters {
        /// Agent ID
        agent: String,
    },

    /// Compact settled records and cap stream lengths
    Cleanup,

    /// List agents from the registry snapshot
    Agents {
        /// Include offline agents
        #[arg(long)]
        all: bool,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self, settings: &Settings) -> Result<()> {
        match &self.command {
            Command::Run => cmd_run(settings).await,
            Command::Stats => cmd_stats(settings).await,
            Command::DeadLetters { agent } => cmd_dead_letters(settings, agent).await,
            Command::Cleanup => cmd_cleanup(settings).await,
            Command::Agents { all } => cmd_agents(settings, *all),
        }
    }

    /// Settings from `--settings`, or the default location with fallback.
    pub fn load_settings(&self) -> Result<Settings> {
        match &self.settings {
            Some(path) => Ok(load_settings_from(path)?),
            None => Ok(load_settings_or_default()),
        }
    }
}

fn open_queue(settings: &Settings) -> QueueManager {
    let transport = transport::connect(&settings.transport);
    QueueManager::new(transport, settings.queue.clone(), clock::system())
}

// Command implementations

async fn cmd_run(settings: &Settings) -> Result<()> {
    println!("Starting coordinator {} ({})", settings.supervisor_id, settings.transport.kind);
    run_coordinator_daemon(settings).await?;
    Ok(())
}

async fn cmd_stats(settings: &Settings) -> Result<()> {
    let queue = open_queue(settings);
    let stats = queue.stats().await?;
    println!("Queue statistics ({}):", queue.transport_kind());
    println!("  Total:      {}", stats.total);
    println!("  Pending:    {}", stats.pending);
    println!("  Processing: {}", stats.processing);
    println!("  Processed:  {}", stats.processed);
    println!("  Failed:     {}", stats.failed);
    println!("  Expired:    {}", stats.expired);
    println!("  Dead:       {}", stats.dead);
    println!("  Broadcasts: {}", stats.broadcasts);
    println!("  Ack records: {}", stats.ack_records);
    Ok(())
}

async fn cmd_dead_letters(settings: &Settings, agent: &str) -> Result<()> {
    let queue = open_queue(settings);
    let dead = queue.dead_letters(agent).await?;
    println!("Dead letters for {} ({}):", agent, dead.len());
    for envelope in dead {
        println!(
            "  {}: {} from {} ({} retries)",
            envelope.id, envelope.message_type, envelope.from, envelope.retry_count
        );
    }
    Ok(())
}

async fn cmd_cleanup(settings: &Settings) -> Result<()> {
    let queue = open_queue(settings);
    let report = queue.cleanup().await?;
    println!(
        "Compacted {}, trimmed {}, acks removed {}",
        report.compacted, report.trimmed, report.acks_removed
    );
    Ok(())
}

fn cmd_agents(settings: &Settings, include_offline: bool) -> Result<()> {
    let Some(path) = &settings.registry.snapshot_path else {
        println!("No registry snapshot configured");
        return Ok(());
    };
    let registry = AgentRegistry::new(settings.registry.clone(), clock::system());
    if path.exists() {
        registry.restore(path)?;
    }
    let agents = registry.agents(include_offline);
    println!("Agents ({}):", agents.len());
    for agent in agents {
        println!(
            "  {} [{}] {} load {}/{}",
            agent.id, agent.role, agent.status, agent.current_load, agent.max_concurrency
        );
    }
    Ok(())
}
