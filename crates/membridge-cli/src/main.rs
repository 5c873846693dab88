//! membridge CLI
//!
//! Profile tooling and an offline simulation of the bridge.
//!
//! ## Usage
//!
//! ```bash
//! # Check a profile and list entries that will be ignored
//! membridge profile validate profiles/demo.json
//!
//! # Where does a flag live?
//! membridge profile locate profiles/demo.json recv_ready
//!
//! # Show the effective bridge configuration
//! membridge config show
//!
//! # Run the real loop against a simulated emulator and session
//! membridge simulate --profile profiles/demo.json --items 1,2,3 --check chest_cave
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use membridge_core::codec;
use membridge_core::logging::{write_run_metadata, JsonlLayer, RunMetadata};
use membridge_core::profile::{DeliverySlot, ResolvedFlag};
use membridge_core::{
    BridgeConfig, BridgeEvent, GameProfile, InMemoryPort, NetworkItem, ProcessHandle,
    ReconciliationLoop, ServerMessage, SessionEvent, SessionLink, TransportError,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

/// membridge - multiworld session ↔ emulator memory bridge
#[derive(Parser)]
#[command(name = "membridge")]
#[command(version)]
#[command(about = "Live synchronization between a multiworld session and emulated game memory")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Bridge configuration file (default: <config dir>/membridge/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSONL logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Game profile tooling
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Bridge configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run the reconciliation loop against a simulated emulator
    Simulate(SimulateArgs),
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Load and resolve a profile
    Validate {
        /// Profile file (JSON)
        file: PathBuf,
    },
    /// Print the resolved position of a flag
    Locate {
        /// Profile file (JSON)
        file: PathBuf,
        /// Flag id
        flag: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON
    Show,
}

#[derive(clap::Args)]
struct SimulateArgs {
    /// Profile file (JSON)
    #[arg(short, long)]
    profile: PathBuf,

    /// Item ids granted by the simulated session, in order
    #[arg(long, value_delimiter = ',')]
    items: Vec<u64>,

    /// Location flags the simulated game sets at start (repeatable)
    #[arg(long = "check")]
    checks: Vec<String>,

    /// Number of ticks to run before shutting down
    #[arg(long, default_value_t = 40)]
    ticks: u32,

    /// Override the tick interval
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Seed name shared by the save and the session
    #[arg(long, default_value = "SIMULATED")]
    seed: String,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

fn setup_logging(verbosity: u8, log_dir: Option<&Path>) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let jsonl = log_dir
        .map(|dir| JsonlLayer::new(dir, "cli"))
        .transpose()
        .context("Failed to open log directory")?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .init();
    Ok(())
}

/// Default configuration file (<config dir>/membridge/config.json)
fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("membridge")
        .join("config.json")
}

/// Explicit file must exist; the default one is optional.
fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config '{}'", path.display())),
        None => {
            let path = default_config_path();
            if path.exists() {
                debug!(path = %path.display(), "Loading default config");
                BridgeConfig::load(&path)
                    .with_context(|| format!("Failed to load config '{}'", path.display()))
            } else {
                Ok(BridgeConfig::default())
            }
        }
    }
}

fn load_profile(path: &Path) -> Result<GameProfile> {
    GameProfile::load(path).with_context(|| format!("Failed to load profile '{}'", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Profile { action } => match action {
            ProfileAction::Validate { file } => {
                let profile = load_profile(&file)?;
                let resolved = profile.resolve().context("Profile is invalid")?;

                println!("Profile OK: {}", resolved.game);
                println!("  Regions: {}", resolved.regions.len());
                println!("  Counters: {}", resolved.counters.len());
                println!(
                    "  Locations: {} toggles, {} groups",
                    resolved.locations.len(),
                    resolved.groups.len()
                );
                println!("  Items: {}", resolved.items.len());
                println!(
                    "  Death link: {}",
                    if resolved.death_link.is_some() { "yes" } else { "no" }
                );
                if !resolved.skipped.is_empty() {
                    println!();
                    println!("Skipped {} entries:", resolved.skipped.len());
                    for error in &resolved.skipped {
                        println!("  - {}", error);
                    }
                }
            }

            ProfileAction::Locate { file, flag } => {
                let profile = load_profile(&file)?;
                match profile.resolve_flag(&flag)? {
                    ResolvedFlag::Bit(loc) => {
                        println!("{}: toggle", flag);
                        println!("  Address: {:#08x}", loc.address);
                        println!("  Bit: {} ({:?})", loc.bit, loc.order);
                        println!("  Mask: {:#04x}", loc.mask());
                    }
                    ResolvedFlag::Counter(field) => {
                        println!("{}: counter", flag);
                        println!("  Address: {:#08x}", field.address);
                        println!("  Width: {} bytes ({:?} endian)", field.width, field.endianness);
                        println!("  Max: {}", field.max_value());
                    }
                    ResolvedFlag::Bytes(field) => {
                        println!("{}: bytes", flag);
                        println!("  Address: {:#08x}", field.address);
                        println!("  Length: {}", field.len);
                    }
                }
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_config(cli.config.as_deref())?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },

        Commands::Simulate(args) => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(ms) = args.tick_ms {
                config.tick_interval_ms = ms;
            }
            config.validate()?;
            simulate(args, config, cli.log_dir.as_deref()).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Simulation
// ============================================================================

/// Play the game's part of the delivery handshake: take the item, drop
/// ready, raise ack.
fn consume(process: &ProcessHandle, slot: &DeliverySlot) -> Result<bool, TransportError> {
    let ready = process.peek_byte(slot.ready.address)?;
    if !codec::is_set(ready, slot.ready.bit, slot.ready.order) {
        return Ok(false);
    }
    process.poke(
        slot.ready.address,
        &[codec::with_bit_cleared(ready, slot.ready.bit, slot.ready.order)],
    )?;
    let ack = process.peek_byte(slot.ack.address)?;
    process.poke(
        slot.ack.address,
        &[codec::with_bit_set(ack, slot.ack.bit, slot.ack.order)],
    )?;
    Ok(true)
}

fn spawn_player(process: ProcessHandle, slot: DeliverySlot, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            match consume(&process, &slot) {
                Ok(true) => debug!("Simulated game consumed an item"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Simulated game failed to read the slot"),
            }
        }
    })
}

fn spawn_printer(mut events: broadcast::Receiver<BridgeEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if json => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                },
                Ok(event) => println!("event: {}", event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event printer lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn simulate(args: SimulateArgs, config: BridgeConfig, log_dir: Option<&Path>) -> Result<()> {
    let profile = load_profile(&args.profile)?;
    let resolved = profile.resolve().context("Profile is invalid")?;

    if let Some(dir) = log_dir {
        let meta = RunMetadata::new("cli", resolved.game.clone(), config.clone())
            .with_profile_path(args.profile.display().to_string());
        write_run_metadata(dir, &meta)?;
    }

    let process = resolved
        .regions
        .iter()
        .fold(ProcessHandle::new(), |p, r| p.map(r.base, r.len));
    process.poke(
        resolved.session.address,
        &codec::fit_to_width(args.seed.as_bytes(), resolved.session.len as usize),
    )?;
    for flag in &args.checks {
        let loc = profile.resolve_bit(flag)?;
        let byte = process.peek_byte(loc.address)?;
        process.poke(loc.address, &[codec::with_bit_set(byte, loc.bit, loc.order)])?;
    }

    let cursor = resolved.delivery.cursor;
    let slot = resolved.delivery.clone();
    let interval = config.tick_interval();
    let (link, remote) = SessionLink::pair(membridge_core::remote::LINK_CHANNEL_CAPACITY);

    let mut runner = ReconciliationLoop::new(
        resolved,
        config,
        InMemoryPort::new(process.clone()),
        link,
    );
    let printer = spawn_printer(runner.subscribe(), args.json);
    let token = runner.shutdown_token();

    info!(
        game = %profile.game,
        items = args.items.len(),
        ticks = args.ticks,
        "Starting simulation"
    );
    remote
        .events
        .send(SessionEvent::Message(ServerMessage::Connected {
            slot: 1,
            slot_name: "Player".into(),
            seed_name: args.seed.clone(),
            checked_locations: Vec::new(),
        }))
        .await?;
    remote
        .events
        .send(SessionEvent::Message(ServerMessage::ReceivedItems {
            index: 0,
            items: args
                .items
                .iter()
                .map(|&item| NetworkItem {
                    item,
                    location: 0,
                    player: 2,
                })
                .collect(),
        }))
        .await?;

    let events_tx = remote.events;
    let mut outbound = remote.outbound;
    let server = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message.encode() {
                Ok(json) => println!("send: {}", json),
                Err(e) => warn!(error = %e, "Failed to encode message"),
            }
        }
    });
    let player = spawn_player(process.clone(), slot, interval / 2);

    let handle = tokio::spawn(async move {
        let result = runner.run().await;
        (result, runner)
    });

    tokio::select! {
        _ = tokio::time::sleep(interval * args.ticks) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    token.cancel();

    let (result, runner) = handle.await?;
    let checked = runner.bridge().scanner().checked().len();
    let status = runner.status().clone();
    drop(runner);
    drop(events_tx);
    player.abort();
    let _ = printer.await;
    let _ = server.await;

    let delivered = codec::decode_counter(
        &process.peek(cursor.address, cursor.width as u32)?,
        cursor.endianness,
    )?;
    println!();
    println!("Simulation finished: {}", status);
    println!("  Delivered: {}/{}", delivered, args.items.len());
    println!("  Locations checked: {}", checked);

    result?;
    Ok(())
}
