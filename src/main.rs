// tiergate - Command Line Entry Point
//
// Exercises the admission-control library:
// - Simulate admission traffic for one user
// - Drain a demo backlog through the fair queue
// - Print the effective configuration
// - Serve Prometheus metrics with a background queue drain

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tiergate::config::Config;
use tiergate::metrics_server;
use tiergate::rate_limit::admission::{open_store, system_clock};
use tiergate::rate_limit::{
    AdmissionController, DashboardBuilder, DecisionReason, StaticTierLookup, Tier,
};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// tiergate: tiered rate limiting and fair queuing
#[derive(Parser, Debug)]
#[command(name = "tiergate")]
#[command(version)]
#[command(about = "Tiered rate limiting and weighted fair queuing", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the XDG config path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send requests for one user through the enforcer
    Simulate {
        /// User to attribute requests to
        #[arg(long, default_value = "demo-user")]
        user: String,

        /// Tier the user is assigned to
        #[arg(long, default_value = "free")]
        tier: Tier,

        /// Number of requests
        #[arg(long, default_value_t = 130)]
        requests: u64,

        /// Concurrent in-flight requests
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },
    /// Fill every tier queue and drain it by weighted round robin
    Drain {
        #[arg(long, default_value_t = 2)]
        enterprise: usize,
        #[arg(long, default_value_t = 3)]
        mid: usize,
        #[arg(long, default_value_t = 4)]
        early: usize,
        #[arg(long, default_value_t = 5)]
        free: usize,

        /// Entries handed out per process pass
        #[arg(long, default_value_t = 10)]
        batch: usize,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Serve /metrics and /health with a background queue drain
    Serve {
        /// Override the configured metrics port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_tracing(&config, args.verbose)?;

    match args.command {
        Some(Commands::Simulate {
            user,
            tier,
            requests,
            concurrency,
        }) => simulate(&config, &user, tier, requests, concurrency).await?,
        Some(Commands::Drain {
            enterprise,
            mid,
            early,
            free,
            batch,
        }) => {
            let backlog = [
                (Tier::Enterprise, enterprise),
                (Tier::Mid, mid),
                (Tier::Early, early),
                (Tier::Free, free),
            ];
            drain(&config, &backlog, batch).await?
        }
        Some(Commands::Config) => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(Commands::Serve { port }) => serve(&config, port).await?,
        None => {
            info!("No command specified. Use \"tiergate --help\" for usage.");
        }
    }

    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn controller(config: &Config, lookup: Arc<StaticTierLookup>) -> Result<AdmissionController> {
    let clock = system_clock();
    let store = open_store(&config.store, clock.clone())
        .await
        .context("Failed to open counter store")?;
    AdmissionController::from_config(config, lookup, store, clock)
        .context("Failed to build admission controller")
}

/// Run `requests` checks for one user and print a summary
async fn simulate(
    config: &Config,
    user: &str,
    tier: Tier,
    requests: u64,
    concurrency: usize,
) -> Result<()> {
    let lookup = Arc::new(StaticTierLookup::new(Tier::LOWEST));
    lookup.assign(user, tier);
    let controller = controller(config, lookup).await?;
    let enforcer = controller.enforcer().clone();

    info!(user, tier = %tier, requests, concurrency, "Simulating admission traffic");

    let concurrency = concurrency.max(1) as u64;
    let mut last = None;
    let mut sent = 0;
    while sent < requests {
        let wave = concurrency.min(requests - sent);
        let mut tasks = Vec::with_capacity(wave as usize);
        for _ in 0..wave {
            let enforcer = enforcer.clone();
            let user = user.to_string();
            tasks.push(tokio::spawn(async move { enforcer.check(&user).await }));
        }
        for task in tasks {
            last = Some(task.await.context("Simulation task panicked")?);
        }
        sent += wave;
    }

    let stats = enforcer.stats();
    let store_failures = matches!(
        last.as_ref().map(|d| d.reason),
        Some(DecisionReason::StoreUnavailable)
    );
    let summary = json!({
        "user": user,
        "tier": tier,
        "requests": requests,
        "allowed": stats.allowed + stats.burst,
        "burst": stats.burst,
        "denied": stats.denied,
        "store_failures": store_failures,
        "last_decision": last.map(|d| d.to_response()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Fill the tier queues and print the drain order
async fn drain(config: &Config, backlog: &[(Tier, usize)], batch: usize) -> Result<()> {
    let controller = controller(config, Arc::new(StaticTierLookup::new(Tier::LOWEST))).await?;
    let queue = controller.queue();

    for (tier, count) in backlog {
        for i in 0..*count {
            queue
                .enqueue(&format!("{}-user-{}", tier, i), *tier, json!({ "seq": i }), None)
                .await
                .with_context(|| format!("Failed to enqueue into {} queue", tier))?;
        }
    }

    let mut order = Vec::new();
    loop {
        let processed = queue.process(batch.max(1)).await?;
        if processed.is_empty() {
            break;
        }
        for item in processed {
            queue.complete(&item.entry.request_id).await?;
            order.push(item.entry.tier.to_string());
        }
    }

    println!("{}", serde_json::to_string_pretty(&json!({ "order": order }))?);
    Ok(())
}

/// Serve metrics and drain the queue until interrupted
async fn serve(config: &Config, port: Option<u16>) -> Result<()> {
    let controller = controller(config, Arc::new(StaticTierLookup::new(Tier::LOWEST))).await?;
    let port = port.unwrap_or(config.metrics.port);

    let (tx, mut rx) = tokio::sync::mpsc::channel(config.queue.batch_size * 4);
    let scheduler = controller
        .scheduler(config.queue.drain_interval(), config.queue.batch_size)
        .spawn(tx);

    let queue = controller.queue().clone();
    let worker = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if let Err(e) = queue.complete(&item.entry.request_id).await {
                tracing::warn!(request_id = %item.entry.request_id, error = %e, "Failed to complete entry");
            }
        }
    });

    let dashboard = DashboardBuilder::new(controller.clone()).build().await?;
    info!(
        tiers = dashboard.tiers.len(),
        queued = dashboard.total_queued(),
        "Admission control ready"
    );

    tokio::select! {
        result = metrics_server::start_metrics_server(port) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    scheduler.abort();
    worker.abort();
    Ok(())
}
