use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use herald::config::RootConfig;
use herald::error::{RootError, RootResult};
use herald::jobs::{spawn_scheduler, Job, JobOutcome};
use herald::{http, initialize};
use herald_core::Timestamp;
use herald_ledger::AuditChain;

/// Herald: certified delivery of disciplinary notices.
///
/// Every notice is hashed, time-stamped and signed before it leaves, and
/// every step an employee takes to read it is chained into the audit log.
#[derive(Parser, Debug)]
#[command(name = "herald", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a configuration with fresh secrets and open the store
    Init {
        /// Database file for the sqlite backend
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Start the HTTP server and the job scheduler
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one scheduled job now
    RunJob {
        /// drift-correction, subsidiarity, firmness or proof-poll
        job: Job,
    },

    /// Show recent audit log entries and check the chain
    Audit {
        /// Maximum number of entries to display
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new(
            "herald=debug,herald_gate=debug,herald_delivery=debug,herald_ledger=debug,herald_lifecycle=debug",
        )
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald=info,herald_gate=info,herald_delivery=info,herald_ledger=info")
        })
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn config_path(path: Option<&PathBuf>) -> PathBuf {
    path.cloned()
        .unwrap_or_else(RootConfig::default_config_path)
}

fn load_config(path: Option<&PathBuf>) -> RootResult<RootConfig> {
    RootConfig::load(&config_path(path))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli).await;
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> RootResult<()> {
    match cli.command {
        Commands::Init { database } => cmd_init(cli.config.as_ref(), database),
        Commands::Serve { bind, port } => cmd_serve(cli.config.as_ref(), bind, port).await,
        Commands::RunJob { job } => cmd_run_job(cli.config.as_ref(), job).await,
        Commands::Audit { limit } => cmd_audit(cli.config.as_ref(), limit),
    }
}

fn cmd_init(path: Option<&PathBuf>, database: Option<PathBuf>) -> RootResult<()> {
    let save_path = config_path(path);
    if save_path.exists() {
        return Err(RootError::Config(format!(
            "{} already exists",
            save_path.display()
        )));
    }

    let mut config = RootConfig::generated();
    if let Some(db) = database {
        config.database.path = db;
    }

    info!("initializing herald");
    let app = initialize(config.clone())?;
    config.save(&save_path)?;

    println!("Herald initialized.");
    println!("  Config:   {}", save_path.display());
    println!("  Database: {}", app.config.database.path.display());
    println!("  Signer:   {}", app.ledger.signer().public_key_hex());
    Ok(())
}

async fn cmd_serve(
    path: Option<&PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
) -> RootResult<()> {
    let mut config = load_config(path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let app = Arc::new(initialize(config)?);
    let scheduler = if app.config.jobs.scheduler_enabled {
        spawn_scheduler(app.clone())
    } else {
        Vec::new()
    };

    let addr = format!("{}:{}", app.config.server.bind, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, jobs = scheduler.len(), "herald listening");

    axum::serve(listener, http::build_router(app))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    for task in scheduler {
        task.abort();
    }
    Ok(())
}

async fn cmd_run_job(path: Option<&PathBuf>, job: Job) -> RootResult<()> {
    let app = initialize(load_config(path)?)?;
    match app.run_job(job, Timestamp::now()).await? {
        JobOutcome::Ran { report, .. } => {
            println!("{} finished:", job);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        JobOutcome::Skipped { window, .. } => {
            println!("{} skipped, window {} already ran", job, window);
        }
    }
    Ok(())
}

fn cmd_audit(path: Option<&PathBuf>, limit: usize) -> RootResult<()> {
    let app = initialize(load_config(path)?)?;
    let entries = app.audit.entries()?;
    let intact = AuditChain::verify_entries(&entries)?;

    println!("Audit Log ({} entries):", entries.len());
    if entries.is_empty() {
        println!("  (no entries)");
    }
    let skip = entries.len().saturating_sub(limit);
    for entry in &entries[skip..] {
        println!(
            "  {} {} {}",
            entry.event.timestamp,
            entry.hash,
            serde_json::to_string(&entry.event.kind)?
        );
    }
    if intact {
        println!("Chain intact.");
    } else {
        println!("Chain BROKEN: an entry does not link to its predecessor.");
    }
    Ok(())
}
