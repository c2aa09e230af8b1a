// fobkey: desktop controller for the key fob
//
// Cross-platform (macOS, Linux, Windows) command-line host: scans for the fob,
// answers its challenges with sealed authenticate packets, and keeps the
// nonce counter on disk.

mod ble;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use fobkey_core::session::{
    self, ConnectionOrchestrator, ConnectionState, ConnectionStatus, HandshakeMode,
    OrchestratorConfig, OrchestratorDelegate, OrchestratorError,
};
use fobkey_core::transport::{event_channel, PeripheralId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Parser)]
#[command(name = "fobkey")]
#[command(about = "fobkey: authenticate to a BLE key fob", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected and answer every challenge (Ctrl-C to stop)
    Run,
    /// Connect, send one handshake, exit
    Auth,
    /// Read the fob's battery level
    Battery,
    /// Inspect the nonce counter
    Nonce {
        #[command(subcommand)]
        action: NonceAction,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show configuration and nonce state
    Status,
}

#[derive(Subcommand)]
enum NonceAction {
    Show,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run => cmd_run().await,
        Commands::Auth => cmd_auth().await,
        Commands::Battery => cmd_battery().await,
        Commands::Nonce { action } => cmd_nonce(action),
        Commands::Config { action } => cmd_config(action),
        Commands::Status => cmd_status(),
    }
}

/// What ends a session besides Ctrl-C
#[derive(Clone, Copy, PartialEq, Eq)]
enum StopOn {
    Never,
    Authenticated,
    BatteryLevel,
}

struct ConsoleDelegate {
    stop_on: StopOn,
    done: Arc<Notify>,
}

impl OrchestratorDelegate for ConsoleDelegate {
    fn on_state_changed(&self, _from: ConnectionState, to: ConnectionState) {
        println!("  {} {}", "•".dimmed(), to.to_string().bright_cyan());
    }

    fn on_authenticated(&self, counter: u64) {
        println!("{} Authenticated (nonce {})", "✓".green(), counter);
        if self.stop_on == StopOn::Authenticated {
            self.done.notify_one();
        }
    }

    fn on_battery_level(&self, percent: u8) {
        println!("{} Battery: {}%", "✓".green(), percent);
        if self.stop_on == StopOn::BatteryLevel {
            self.done.notify_one();
        }
    }

    fn on_fault(&self, error: &OrchestratorError) {
        eprintln!("{} {}", "✗".red(), error);
    }
}

async fn run_session(
    session_config: OrchestratorConfig,
    stop_on: StopOn,
    deadline: Option<Duration>,
) -> Result<ConnectionStatus> {
    let mut config = config::Config::load()?;
    let key = config.shared_key()?;
    let db_path = config.nonce_db_path()?;
    let db_path = db_path.to_str().context("Nonce database path is not UTF-8")?;
    let nonces = fobkey_core::open_nonce_manager(db_path)
        .context("Failed to open nonce database (is another fobkey running?)")?;

    let (events_tx, events_rx) = event_channel();
    let transport = ble::BtleTransport::spawn(events_tx).await?;

    let done = Arc::new(Notify::new());
    let delegate = Arc::new(ConsoleDelegate {
        stop_on,
        done: done.clone(),
    });
    let mut orchestrator = ConnectionOrchestrator::new(transport, nonces, key, session_config)
        .with_delegate(delegate);
    if let Some(known) = &config.known_peripheral {
        orchestrator = orchestrator.with_known_peripheral(PeripheralId::new(known.as_str()));
    }

    let stop = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = done.notified() => {}
        }
    };
    let tick = Duration::from_millis(config.tick_interval_ms.max(1));
    let event_loop = session::run(&mut orchestrator, events_rx, tick, stop);

    let outcome = match deadline {
        Some(limit) => match tokio::time::timeout(limit, event_loop).await.ok() {
            Some(result) => result.map_err(anyhow::Error::from),
            None => {
                orchestrator.shutdown();
                Err(anyhow::anyhow!("Timed out after {}s", limit.as_secs()))
            }
        },
        None => event_loop.await.map_err(anyhow::Error::from),
    };

    let remembered = orchestrator.known_peripheral().map(|p| p.to_string());
    if remembered.is_some() && remembered != config.known_peripheral {
        config.known_peripheral = remembered;
        config.save()?;
    }

    outcome.context("Session failed")?;
    Ok(orchestrator.status())
}

async fn cmd_run() -> Result<()> {
    let config = config::Config::load()?;
    println!("{}", "fobkey".bold());
    println!(
        "  Handshake: {}  (Ctrl-C to stop)",
        config.session.handshake_mode.to_string().bright_cyan()
    );
    println!();

    let status = run_session(config.session, StopOn::Never, None).await?;
    println!();
    println!(
        "{} Session ended: {} handshakes",
        "✓".green(),
        status.authenticated_count
    );
    Ok(())
}

async fn cmd_auth() -> Result<()> {
    let config = config::Config::load()?;
    let session_config = config.session.with_mode(HandshakeMode::Eager);
    let deadline = Duration::from_secs(config.scan_duration);

    println!("{}", "Authenticating...".bold());
    let status = run_session(session_config, StopOn::Authenticated, Some(deadline)).await?;
    if let Some(nonce) = status.last_nonce {
        println!("  Nonce used: {}", nonce);
    }
    Ok(())
}

async fn cmd_battery() -> Result<()> {
    let config = config::Config::load()?;
    let mut session_config = config.session;
    session_config.read_battery_on_connect = true;
    let deadline = Duration::from_secs(config.scan_duration);

    println!("{}", "Reading battery level...".bold());
    let status = run_session(session_config, StopOn::BatteryLevel, Some(deadline)).await?;
    if status.battery_level.is_none() {
        anyhow::bail!("Fob did not report a battery level");
    }
    Ok(())
}

fn cmd_nonce(action: NonceAction) -> Result<()> {
    match action {
        NonceAction::Show => {
            let config = config::Config::load()?;
            let db_path = config.nonce_db_path()?;
            let db_str = db_path.to_str().context("Nonce database path is not UTF-8")?;
            let nonces = fobkey_core::open_nonce_manager(db_str)
                .context("Failed to open nonce database")?;
            let next = nonces.restore().context("Failed to read nonce counter")?;

            println!("{}", "Nonce counter".bold());
            println!("  {:<12} {}", "next".bright_cyan(), next);
            println!("  {:<12} {}", "database".bright_cyan(), db_path.display());
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            let shown = config.get(&key).unwrap_or(value);
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), shown);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = config::Config::load()?;

    println!("{}", "fobkey Status".bold());
    println!();

    println!("Config:      {}", config::Config::config_file()?.display());
    let key_state = if config.key_hex.is_some() {
        "configured".green()
    } else {
        "missing".red()
    };
    println!("Key:         {}", key_state);
    println!("Handshake:   {}", config.session.handshake_mode);
    println!(
        "Fob:         {}",
        config.known_peripheral.as_deref().unwrap_or("(scan)")
    );

    let db_path = config.nonce_db_path()?;
    let next = db_path
        .to_str()
        .and_then(|path| fobkey_core::open_nonce_manager(path).ok())
        .and_then(|nonces| nonces.restore().ok());
    match next {
        Some(next) => println!("Next nonce:  {}", next),
        None => println!("Next nonce:  {}", "(database unavailable)".dimmed()),
    }

    Ok(())
}
