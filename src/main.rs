//! Automaton Daemon Runtime
//!
//! The entry point for the autonomous agent: CLI handling, subsystem
//! bootstrapping, and orchestration of the turn worker, scheduler
//! worker, and tier watch.
//!
//! Exit codes: 0 normal shutdown, 1 config error, 2 funding error,
//! 3 provider unrecoverable.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use automatond::agent::{TurnEngine, TurnEngineOptions};
use automatond::config;
use automatond::heartbeat::{
    self, HeartbeatScheduler, SchedulerOptions, TaskContext, WakeQueue,
};
use automatond::identity::{provision, wallet};
use automatond::providers::{
    HttpInferenceProvider, HttpSandboxProvider, LocalWalletSigner, RelaySocialProvider,
    RpcChainProvider,
};
use automatond::router::{seed_registry, InferenceRouter};
use automatond::state::{Database, KV_LIQUID_BALANCE};
use automatond::survival::{self, SurvivalController};
use automatond::types::{
    AutomatonIdentity, ChainProvider, SandboxProvider, SocialProvider, WalletSigner,
};

const EXIT_CONFIG: i32 = 1;
const EXIT_FUNDING: i32 = 2;
const EXIT_PROVIDER: i32 = 3;

/// Seconds allowed for graceful completion of in-flight work on shutdown.
const SHUTDOWN_GRACE_SECS: u64 = 5;

/// USDC contract on Base.
const USDC_TOKEN_ADDRESS: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

/// Automaton Daemon -- Autonomous Agent Runtime
#[derive(Parser, Debug)]
#[command(
    name = "automatond",
    version,
    about = "Autonomous agent daemon. To exist, it must pay for its compute.",
)]
struct Cli {
    /// Initialize wallet and config directory
    #[arg(long)]
    init: bool,

    /// Provision an API key via SIWE
    #[arg(long)]
    provision: bool,

    /// Start the daemon
    #[arg(long)]
    run: bool,

    /// Show current status
    #[arg(long)]
    status: bool,
}

// ---- Status Command ---------------------------------------------------------

fn show_status() {
    let Some(config) = config::load_config() else {
        println!("Not configured. Run the installer, then `automatond --run`.");
        return;
    };

    let db_path = config::resolve_path(&config.db_path);
    match Database::open(&db_path) {
        Ok(db) => match survival::check_resources(&db) {
            Ok(status) => {
                println!("=== {} ===", config.name);
                println!("Address:  {}", config.wallet_address);
                println!("Creator:  {}", config.creator_address);
                println!("Sandbox:  {}", config.sandbox_id);
                println!();
                println!("{}", survival::format_resource_report(&status));
            }
            Err(e) => eprintln!("Failed to read resource status: {e:#}"),
        },
        Err(e) => eprintln!("Failed to open state store at {db_path}: {e:#}"),
    }
}

// ---- Main Run ---------------------------------------------------------------

async fn run() -> Result<i32> {
    info!(
        "automatond v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let Some(config) = config::load_config() else {
        eprintln!("No configuration found at {}.", config::get_config_path().display());
        eprintln!("The installer writes automaton.json; run it first.");
        return Ok(EXIT_CONFIG);
    };

    // Wallet and identity.
    let (signer, is_new_wallet) = wallet::get_wallet().context("Failed to load wallet")?;
    let address = signer.address().to_checksum(None);
    if is_new_wallet {
        info!("Created fresh wallet: {address}");
    }

    let api_key = if config.api_key.is_empty() {
        match provision::load_api_key_from_config() {
            Some(key) => key,
            None => {
                eprintln!("No API key found. Run: automatond --provision");
                return Ok(EXIT_FUNDING);
            }
        }
    } else {
        config.api_key.clone()
    };

    let identity = AutomatonIdentity {
        name: config.name.clone(),
        address: address.clone(),
        creator_address: config.creator_address.clone(),
        sandbox_id: config.sandbox_id.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    info!("Identity: {} ({})", identity.name, identity.address);

    // State store.
    let db_path = config::resolve_path(&config.db_path);
    let db = Arc::new(Mutex::new(
        Database::open(&db_path).context("Failed to open state store")?,
    ));
    {
        let db = db.lock().unwrap();
        seed_registry(&db).context("Failed to seed model registry")?;
        db.set_config_snapshot(&serde_json::to_string(&config)?)?;
    }

    // Providers.
    let sandbox: Arc<dyn SandboxProvider> = Arc::new(HttpSandboxProvider::new(
        config.api_url.clone(),
        api_key.clone(),
        config.sandbox_id.clone(),
    ));
    let inference = Arc::new(HttpInferenceProvider::new(
        config.inference_url.clone(),
        api_key.clone(),
    ));
    let social: Option<Arc<dyn SocialProvider>> = config
        .social_relay_url
        .as_ref()
        .map(|url| {
            Arc::new(RelaySocialProvider::new(url.clone(), signer.clone()))
                as Arc<dyn SocialProvider>
        });
    let chain: Option<Arc<dyn ChainProvider>> = config
        .chain_rpc_url
        .as_ref()
        .map(|url| Arc::new(RpcChainProvider::new(url.clone())) as Arc<dyn ChainProvider>);
    let wallet_signer: Arc<dyn WalletSigner> = Arc::new(LocalWalletSigner::new(signer));

    // First balance probe: a dead control plane at boot is unrecoverable.
    let initial_credits = match sandbox.credits_balance().await {
        Ok(balance) => balance,
        Err(e) => {
            error!("Control plane unreachable at startup: {e:#}");
            return Ok(EXIT_PROVIDER);
        }
    };
    {
        let db = db.lock().unwrap();
        db.set_kv(KV_LIQUID_BALANCE, &initial_credits.to_string())?;
    }

    // Survival controller and tier watch.
    let initial_tier = {
        let db = db.lock().unwrap();
        survival::load_persisted_tier(&db)
    };
    let controller = Arc::new(SurvivalController::new(
        db.clone(),
        initial_tier,
        config.hourly_budget_hundredth_cents,
    ));
    let tier_rx = controller.subscribe();
    let hourly = db.lock().unwrap().hourly_spend().unwrap_or(0);
    controller.evaluate(initial_credits, hourly);

    // Router.
    let router = Arc::new(InferenceRouter::new(
        db.clone(),
        inference,
        tier_rx.clone(),
        config.per_call_ceiling_hundredth_cents,
        config.hourly_budget_hundredth_cents,
        config.enable_model_fallback,
    ));

    // Heartbeat scheduler.
    let heartbeat_path = config::resolve_path(&config.heartbeat_config_path);
    let hb_config = heartbeat::load_heartbeat_config(Path::new(&heartbeat_path))
        .context("Failed to load heartbeat config")?;
    {
        let db = db.lock().unwrap();
        heartbeat::sync_heartbeat_to_db(&hb_config, &db)?;
    }

    let balance_changed = Arc::new(Notify::new());
    let wake = Arc::new(WakeQueue::new());

    let task_ctx = Arc::new(TaskContext {
        agent_name: config.name.clone(),
        wallet_address: address.clone(),
        usdc_token_address: USDC_TOKEN_ADDRESS.to_string(),
        db: db.clone(),
        sandbox: sandbox.clone(),
        social: social.clone(),
        chain: chain.clone(),
        tier_rx: tier_rx.clone(),
        balance_changed: balance_changed.clone(),
    });

    let mut scheduler = HeartbeatScheduler::new(SchedulerOptions {
        tick_interval_secs: 30,
        entries: hb_config.entries.clone(),
        low_compute_multiplier: hb_config.low_compute_multiplier,
    });
    scheduler.start(task_ctx, wake.clone());

    // Workers.
    let shutdown = CancellationToken::new();

    let tier_watch_handle = tokio::spawn(survival::run_tier_watch(
        controller.clone(),
        balance_changed.clone(),
        shutdown.clone(),
    ));

    let mut engine = TurnEngine::new(TurnEngineOptions {
        config: config.clone(),
        identity,
        db: db.clone(),
        router,
        sandbox,
        social,
        wallet: wallet_signer,
        chain,
        wake,
        tier_rx,
    });

    let engine_shutdown = shutdown.clone();
    let engine_handle = tokio::spawn(async move { engine.run_loop(engine_shutdown).await });

    // Wait for a shutdown signal.
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");
    shutdown.cancel();
    scheduler.stop();

    // Grace period for in-flight work; anything unfinalized is marked
    // aborted afterwards.
    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
    if tokio::time::timeout(grace, engine_handle).await.is_err() {
        warn!("Turn worker did not stop within {SHUTDOWN_GRACE_SECS}s; forcing");
    }
    tier_watch_handle.abort();

    {
        let db = db.lock().unwrap();
        let aborted = db.abort_unfinalized_turns().unwrap_or(0);
        if aborted > 0 {
            warn!("Marked {aborted} in-flight turn(s) aborted during shutdown");
        }
    }

    info!("Shutdown complete");
    Ok(0)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("Failed to register Ctrl+C handler");
    }
}

fn init_config_dir() -> Result<()> {
    let (signer, is_new) = wallet::get_wallet()?;
    let address = signer.address().to_checksum(None);

    let mut config = config::load_config().unwrap_or_else(config::default_config);
    if config.wallet_address.is_empty() {
        config.wallet_address = address.clone();
    }
    config::save_config(&config)?;

    let heartbeat_path = config::resolve_path(&config.heartbeat_config_path);
    heartbeat::write_default_heartbeat_config(Path::new(&heartbeat_path))?;

    println!(
        "{}",
        serde_json::json!({
            "address": address,
            "isNew": is_new,
            "configDir": config::get_automaton_dir().to_string_lossy(),
        })
    );
    Ok(())
}

// ---- Entry Point -----------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if cli.init {
        if let Err(e) = init_config_dir() {
            eprintln!("Init failed: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
        return;
    }

    if cli.provision {
        match provision::provision(None).await {
            Ok(result) => {
                println!(
                    "{}",
                    serde_json::json!({
                        "walletAddress": result.wallet_address,
                        "keyPrefix": result.key_prefix,
                    })
                );
            }
            Err(e) => {
                eprintln!("Provision failed: {e:#}");
                std::process::exit(EXIT_FUNDING);
            }
        }
        return;
    }

    if cli.status {
        show_status();
        return;
    }

    if cli.run {
        match run().await {
            Ok(code) if code != 0 => std::process::exit(code),
            Ok(_) => return,
            Err(e) => {
                eprintln!("Fatal: {e:#}");
                std::process::exit(EXIT_PROVIDER);
            }
        }
    }

    println!("Run \"automatond --help\" for usage information.");
    println!("Run \"automatond --run\" to start the daemon.");
}
