use agent_mapper::agent::Agent;
use agent_mapper::config::{Config, Format};
use agent_mapper::dispatcher::{Actor, ActorRegistry};
use agent_mapper::mapper::Mapper;
use agent_mapper::packet::Request;
use agent_mapper::routing::Selector;
use agent_mapper::security::AllowAll;
use agent_mapper::transport::MemoryBus;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "agent-mapper", version, about = "Agent/mapper cluster node")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "AGENT_MAPPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Preferred wire format
    #[arg(long, global = true, value_enum)]
    format: Option<Format>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs mappers and agents in this process over the memory bus
    Run {
        #[arg(long, default_value_t = 2)]
        mappers: usize,

        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// Admin HTTP address of the first mapper
        #[arg(long)]
        admin: Option<SocketAddr>,

        /// Seconds between demo requests
        #[arg(long, default_value_t = 5)]
        request_every: u64,
    },
    /// Prints the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(format) = cli.format {
        config.format = format;
    }

    match cli.command {
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run {
            mappers,
            agents,
            admin,
            request_every,
        } => run_cluster(config, mappers, agents, admin, Duration::from_secs(request_every)).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}

fn demo_actors() -> Arc<ActorRegistry> {
    let registry = ActorRegistry::new();

    registry.register(
        Actor::new("calc")
            .expose("add", |payload, _| async move {
                let sum: i64 = payload
                    .as_array()
                    .map(|items| items.iter().filter_map(|v| v.as_i64()).sum())
                    .unwrap_or(0);
                Ok(json!(sum))
            })
            .expose("count", |payload, emitter| async move {
                let upto = payload.as_u64().unwrap_or(3);
                for n in 1..=upto {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    emitter.emit("progress", json!(n));
                }
                Ok(json!(upto))
            }),
    );
    registry.register(Actor::new("echo").expose("index", |payload, _| async move { Ok(payload) }));

    registry
}

async fn run_cluster(
    base: Config,
    mappers: usize,
    agents: usize,
    admin: Option<SocketAddr>,
    request_every: Duration,
) -> Result<()> {
    anyhow::ensure!(mappers > 0, "at least one mapper is required");

    let bus = MemoryBus::new();
    let mut handles = Vec::new();

    // 1. Mappers (the first one becomes master):
    let mut mapper_nodes = Vec::new();
    for i in 0..mappers {
        let mut config = base.with_identity(format!("mapper-{}", i + 1));
        config.admin_bind = if i == 0 { admin.or(base.admin_bind) } else { None };

        let mapper = Mapper::new(config, bus.clone(), Arc::new(AllowAll))?;
        handles.push(mapper.clone().start().await?);
        mapper_nodes.push(mapper);

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // 2. Agents:
    let mut agent_nodes = Vec::new();
    for i in 0..agents {
        let config = base.with_identity(format!("agent-{}", i + 1));
        let agent = Agent::new(config, bus.clone(), demo_actors(), None)?;
        handles.push(agent.clone().start().await?);
        agent_nodes.push(agent);
    }

    // 3. Spawn demo requests:
    if let Some(caller) = agent_nodes.first().cloned() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(request_every);

            loop {
                interval.tick().await;
                let request =
                    Request::new("/calc/add", json!([1, 2, 3]), "").with_selector(Selector::All);

                match caller.request(request).await {
                    Ok(handle) => match handle.result_within(request_every).await {
                        Ok(results) => tracing::info!("/calc/add answered: {}", results),
                        Err(e) => tracing::warn!("/calc/add failed: {}", e),
                    },
                    Err(e) => tracing::warn!("Could not send request: {}", e),
                }
            }
        });
    }

    // 4. Spawn stats reporter:
    let stats_mappers = mapper_nodes.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));

        loop {
            interval.tick().await;
            for mapper in &stats_mappers {
                let status = mapper.status();
                tracing::info!(
                    "{} ({}): {} agents, {} jobs",
                    status.identity,
                    status.role,
                    status.agents,
                    status.jobs
                );
            }
        }
    });

    tracing::info!("Cluster running with {} mappers and {} agents", mappers, agents);
    tracing::info!("Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;

    for agent in &agent_nodes {
        agent.shutdown();
    }
    for mapper in &mapper_nodes {
        mapper.shutdown();
    }
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::warn!("Node task ended abnormally: {}", e);
        }
    }

    Ok(())
}
