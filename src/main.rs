use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetdist::config::Config;
use fleetdist::distribution::{Assigner, ExecutorConfig, Node, NodeConfig};
use fleetdist::server::StatusServer;
use fleetdist::store::{CoordinationStore, EtcdStore, MemoryStore};

#[derive(Parser)]
#[command(
    name = "fleetdist",
    version,
    about = "Lease-based membership and consistent-hash work distribution for worker fleets",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json), overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Configuration file, the environment is used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a fleet of nodes on an embedded store and churn its membership
    Simulate {
        /// Number of nodes kept alive
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Number of work keys to distribute
        #[arg(short, long, default_value = "12")]
        keys: usize,

        /// Simulation length in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,

        /// Seconds between replacing a random node
        #[arg(long, default_value = "10")]
        churn: u64,
    },

    /// Run a node on etcd with the status API
    Serve {
        /// Node ID, overrides the configuration
        #[arg(long)]
        node_id: Option<String>,

        /// Comma-separated etcd endpoints, overrides the configuration
        #[arg(short, long, value_delimiter = ',')]
        endpoints: Vec<String>,

        /// Bind address, overrides the configuration
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Print the owner of keys for a given set of nodes
    Owner {
        /// Comma-separated node IDs
        #[arg(short, long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,

        /// Keys to look up
        #[arg(required = true)]
        keys: Vec<String>,

        /// Print JSON instead of text
        #[arg(long, default_value = "false")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;

    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    if let Err(e) = fleetdist::metrics::init_metrics() {
        tracing::warn!(error = %e, "metrics initialization failed");
    }

    match cli.command {
        Commands::Simulate {
            nodes,
            keys,
            duration,
            churn,
        } => {
            tracing::info!(nodes, keys, duration, churn, "starting simulation");
            simulate(&config, nodes, keys, duration, churn).await?;
        }

        Commands::Serve {
            node_id,
            endpoints,
            bind,
        } => {
            let mut config = config;
            if node_id.is_some() {
                config.node.node_id = node_id;
            }
            if !endpoints.is_empty() {
                config.store.endpoints = endpoints;
            }
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            config.validate()?;
            serve(config).await?;
        }

        Commands::Owner { nodes, keys, json } => {
            print_owners(&nodes, &keys, json)?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("fleetdist=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("fleetdist={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()?;
        }
    }

    Ok(())
}

/// Start a node running an executor that reports the keys it owns
async fn start_worker(
    store: Arc<dyn CoordinationStore>,
    node_id: String,
    node_config: NodeConfig,
    executor: ExecutorConfig,
    keys: Arc<Vec<String>>,
) -> Result<Node> {
    let node = Node::new(node_id.clone(), store, node_config)
        .await
        .with_context(|| format!("Failed to start node {node_id}"))?;

    node.start_executor("keys", executor, move |ctx| {
        let keys = Arc::clone(&keys);
        async move {
            let assigner = ctx.assigner();
            let owned: Vec<&str> = keys
                .iter()
                .filter(|key| assigner.is_owner(key).unwrap_or(false))
                .map(String::as_str)
                .collect();
            tracing::info!(
                nodes = assigner.node_count(),
                owned = ?owned,
                "owning {} of {} keys",
                owned.len(),
                keys.len()
            );
            Ok(())
        }
    })
    .await?;

    Ok(node)
}

async fn simulate(
    config: &Config,
    nodes: usize,
    keys: usize,
    duration: u64,
    churn: u64,
) -> Result<()> {
    anyhow::ensure!(nodes > 0, "at least one node is required");
    anyhow::ensure!(churn > 0, "churn interval must be greater than zero");

    let store = MemoryStore::new();
    let node_config = config.node_config()?;
    let executor = config.executor_config();
    let keys: Arc<Vec<String>> = Arc::new((0..keys).map(|i| format!("job-{i}")).collect());

    let mut fleet = Vec::with_capacity(nodes);
    let mut next_id = 0usize;
    for _ in 0..nodes {
        next_id += 1;
        let node = start_worker(
            Arc::new(store.client()),
            format!("node-{next_id}"),
            node_config.clone(),
            executor.clone(),
            Arc::clone(&keys),
        )
        .await?;
        fleet.push(node);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut ticker = tokio::time::interval(Duration::from_secs(churn));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = ticker.tick() => {
                let victim = rand::thread_rng().gen_range(0..fleet.len());
                let node = fleet.swap_remove(victim);
                tracing::info!(node_id = node.node_id(), "replacing node");
                node.shutdown().await;

                next_id += 1;
                let node = start_worker(
                    Arc::new(store.client()),
                    format!("node-{next_id}"),
                    node_config.clone(),
                    executor.clone(),
                    Arc::clone(&keys),
                )
                .await?;
                fleet.push(node);
            }
        }
    }

    for node in &fleet {
        node.shutdown().await;
    }
    tracing::info!(revision = store.revision(), "simulation finished");
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let etcd = config.etcd_config();
    let store = EtcdStore::connect(&etcd)
        .await
        .with_context(|| format!("Failed to connect to etcd at {}", etcd.endpoints.join(",")))?;
    let node_id = config.node_id();
    let keys = Arc::new((0..16).map(|i| format!("job-{i}")).collect::<Vec<_>>());

    let node = Arc::new(
        start_worker(
            Arc::new(store),
            node_id,
            config.node_config()?,
            config.executor_config(),
            keys,
        )
        .await?,
    );

    let server = StatusServer::new(Arc::clone(&node), &config.server)?;
    tracing::info!(address = %server.bind_address(), "serving status API");

    server
        .start_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    node.shutdown().await;
    Ok(())
}

fn print_owners(nodes: &[String], keys: &[String], json: bool) -> Result<()> {
    let Some(first) = nodes.first() else {
        anyhow::bail!("at least one node is required");
    };
    let assigner = Assigner::with_nodes(first.clone(), nodes.iter().map(String::as_str));

    let mut owners = Vec::with_capacity(keys.len());
    for key in keys {
        owners.push((key.as_str(), assigner.node_for(key)?));
    }

    if json {
        let map: serde_json::Map<String, serde_json::Value> = owners
            .iter()
            .map(|(key, owner)| (key.to_string(), serde_json::Value::from(*owner)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        for (key, owner) in owners {
            println!("{key}\t{owner}");
        }
    }

    Ok(())
}
