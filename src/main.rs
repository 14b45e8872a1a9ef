//! PartyWatch - Live party tracker
//!
//! Polls a GDB-style memory stub for the team block of a running game and
//! renders the occupied slots.

mod config;
mod display;
mod model;
mod network;
mod poller;
mod protocol;
mod team;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use display::{ConsolePresenter, Presenter};
use network::{MemoryClient, ReadMemory};
use poller::{PollEvent, Poller};

/// PartyWatch - Live party tracker over a memory stub
#[derive(Parser)]
#[command(name = "partywatch")]
#[command(author = "PartyWatch Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Track a game's party by polling a GDB-style memory stub", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the team and redraw it until interrupted
    Watch {
        /// Override the poll interval (ms)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Read the team once
    Team {
        /// Print the team as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read raw memory once
    Read {
        /// Start address (hex with 0x prefix, or decimal)
        #[arg(value_parser = parse_number)]
        address: u64,

        /// Number of bytes (hex with 0x prefix, or decimal)
        #[arg(value_parser = parse_number)]
        length: u64,

        /// Print a single hex string instead of a dump
        #[arg(long)]
        raw: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_number(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    match cli.command {
        Commands::Watch { interval } => {
            run_watch(config, interval).await?;
        }
        Commands::Team { json } => {
            run_team(config, json).await?;
        }
        Commands::Read {
            address,
            length,
            raw,
        } => {
            run_read(config, address, length as usize, raw).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                if let Some(path) = output {
                    Config::sample().save(&path)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", config::generate_sample_config()?);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<MemoryClient> {
    let mut client = MemoryClient::new(config.host.clone(), config.port, config.net_config());
    client.connect().await?;
    Ok(client)
}

/// Poll until Ctrl+C, rendering each new team
async fn run_watch(config: Config, interval: Option<u64>) -> anyhow::Result<()> {
    let layout = config.team_layout()?;
    let mut poller_config = config.poller_config();
    if let Some(ms) = interval {
        poller_config.interval = std::time::Duration::from_millis(ms);
    }

    let client = connect(&config).await?;
    let mut handle = Poller::new(client, layout, poller_config).spawn();
    let mut snapshots = handle.subscribe();
    let mut event_rx = handle
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("poller event receiver already taken"))?;

    let mut presenter = ConsolePresenter::stdout(&config.display.sprite_dir);
    presenter.update(&handle.latest().team)?;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                // The sender goes away with the poll task
                if changed.is_err() {
                    tracing::error!("Polling stopped");
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                tracing::debug!("Rendering cycle {}", snapshot.cycle);
                presenter.update(&snapshot.team)?;
            }
            Some(event) = event_rx.recv() => {
                match event {
                    PollEvent::Stopped { reason } => {
                        tracing::error!("Polling stopped: {:?}", reason);
                        break;
                    }
                    PollEvent::CycleFailed { cycle, consecutive, error } => {
                        tracing::debug!("Cycle {} failed ({} in a row): {}", cycle, consecutive, error);
                    }
                    PollEvent::Updated { cycle, members } => {
                        tracing::debug!("Cycle {} read {} members", cycle, members);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    let mut client = if handle.is_finished() {
        handle.join().await?
    } else {
        handle.stop().await?
    };
    client.close().await?;
    tracing::info!("Watch stopped");

    Ok(())
}

/// Read and print the team once
async fn run_team(config: Config, json: bool) -> anyhow::Result<()> {
    let layout = config.team_layout()?;
    let mut client = connect(&config).await?;
    let result = layout.read_team(&mut client).await;
    client.close().await?;
    let team = result?;

    if json {
        let summaries: Vec<_> = team.iter().map(|m| m.summary()).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        let mut presenter = ConsolePresenter::new(std::io::stdout(), &config.display.sprite_dir);
        presenter.update(&team)?;
    }

    Ok(())
}

/// Read a raw memory range once
async fn run_read(config: Config, address: u64, length: usize, raw: bool) -> anyhow::Result<()> {
    let mut client = connect(&config).await?;
    let result = client.read_memory(address, length).await;
    client.close().await?;
    let bytes = result?;

    if raw {
        println!("{}", protocol::encode_hex(&bytes));
        return Ok(());
    }

    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!(
            "{:016x}  {:<47}  {}",
            address.wrapping_add((i * 16) as u64),
            hex.join(" "),
            ascii
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["partywatch", "team", "--json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_read_accepts_hex() {
        let cli = Cli::try_parse_from(["partywatch", "read", "0x2024284", "100"]).unwrap();
        match cli.command {
            Commands::Read { address, length, .. } => {
                assert_eq!(address, 0x2024284);
                assert_eq!(length, 100);
            }
            _ => panic!("expected read"),
        }
    }

    #[test]
    fn test_parse_number_rejects_garbage() {
        assert!(parse_number("0xzz").is_err());
        assert!(parse_number("twelve").is_err());
        assert_eq!(parse_number("0X10").unwrap(), 16);
    }
}
