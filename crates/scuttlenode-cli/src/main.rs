//! Scuttlenode CLI
//!
//! Thin wrapper around scuttlenode-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show identity, peers and log size
//! scuttlenode status
//!
//! # Publish a message on the local feed
//! scuttlenode publish '{"type":"post","text":"hello"}'
//!
//! # Follow someone
//! scuttlenode follow @<base64>.ed25519
//!
//! # Replicate with a peer until it disconnects
//! scuttlenode connect @<base64>.ed25519 10.0.0.7:8008
//!
//! # Read the receive log
//! scuttlenode receive-log --from 0 --limit 20
//!
//! # Accept peers until Ctrl+C
//! scuttlenode serve
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use scuttlenode_core::{BanHash, FeedRef, IdentityRef, Node, NodeConfig, ReceiveLogEntry};
use serde_json::json;
use tracing::info;

/// Scuttlenode - Secure Scuttlebutt peer
#[derive(Parser)]
#[command(name = "scuttlenode")]
#[command(version)]
#[command(about = "Scuttlenode - Secure Scuttlebutt peer")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.scuttlenode)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Listen address, overriding the configuration file
    #[arg(short, long, global = true)]
    listen: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity, listen address, peers and receive log length
    Status,

    /// Publish a message with JSON content on the local feed
    Publish {
        /// Message content, e.g. '{"type":"post","text":"hi"}'
        content: String,
    },

    /// Follow an identity
    Follow {
        /// Identity to follow (@<base64>.ed25519)
        identity: String,
    },

    /// Dial a peer and replicate until it disconnects
    Connect {
        /// Identity of the peer (@<base64>.ed25519)
        identity: String,
        /// Address of the peer (host:port)
        address: String,
    },

    /// Accept peers and replicate until Ctrl+C
    Serve,

    /// Print receive log entries
    ReceiveLog {
        /// First receive log sequence
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Maximum number of entries
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Print local messages in receive log order
    PublishedLog {
        /// Only messages after this receive log sequence
        #[arg(long)]
        after: Option<u64>,
    },

    /// Ban a feed, deleting what is stored of it
    Ban {
        /// Feed ref or hex ban hash
        target: String,
    },

    /// Lift a ban
    Unban {
        /// Feed ref or hex ban hash
        target: String,
    },

    /// Replicate a feed outside the follow graph
    Want {
        /// Feed to replicate (@<base64>.ed25519)
        feed: String,
        /// How long to keep wanting it
        #[arg(long, default_value_t = 30)]
        days: i64,
    },

    /// Stop replicating a wanted feed
    Unwant {
        /// Feed to forget (@<base64>.ed25519)
        feed: String,
    },

    /// Create the data directory, identity and config.json
    Init,
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.scuttlenode)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".scuttlenode")
}

fn parse_identity(s: &str) -> Result<IdentityRef> {
    s.parse().map_err(|e| anyhow::anyhow!("Invalid identity '{}': {}", s, e))
}

fn parse_feed(s: &str) -> Result<FeedRef> {
    s.parse().map_err(|e| anyhow::anyhow!("Invalid feed '{}': {}", s, e))
}

/// A ban target is either a feed ref or the hex hash of one.
fn parse_ban_hash(s: &str) -> Result<BanHash> {
    if s.starts_with('@') {
        return Ok(parse_feed(s)?.ban_hash());
    }
    BanHash::from_hex(s).map_err(|e| anyhow::anyhow!("Invalid ban hash '{}': {}", s, e))
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("Cannot resolve '{}'", address))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("No address found for '{}'", address))
}

fn print_entries(entries: &[ReceiveLogEntry]) -> Result<()> {
    for entry in entries {
        let message = entry.message.to_keyed_value(entry.message.timestamp as i64)?;
        println!("{}", json!({"sequence": entry.sequence, "message": message}));
    }
    Ok(())
}

fn want_until(days: i64) -> Result<DateTime<Utc>> {
    if days <= 0 {
        anyhow::bail!("--days must be positive (got {})", days);
    }
    Ok(Utc::now() + chrono::Duration::days(days))
}

fn load_config(cli: &Cli, data_dir: &Path) -> Result<NodeConfig> {
    let mut config = NodeConfig::load(data_dir)?;
    if let Some(listen) = cli.listen {
        config.listen_address = listen;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config = load_config(&cli, &data_dir)?;

    let node = Node::with_config(&data_dir, config).await?;

    match cli.command {
        Commands::Init => {
            node.config().save(node.data_dir())?;
            println!("Identity: {}", node.identity());
            println!(
                "Config: {}",
                node.data_dir().join(scuttlenode_core::config::CONFIG_FILE_NAME).display()
            );
        }

        Commands::Status => {
            let status = node.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Publish { content } => {
            let id = node.publish(content.as_bytes())?;
            println!("{}", id);
        }

        Commands::Follow { identity } => {
            let target = parse_identity(&identity)?;
            let id = node.follow(&target)?;
            println!("{}", id);
        }

        Commands::Connect { identity, address } => {
            let remote = parse_identity(&identity)?;
            let addr = resolve(&address).await?;
            node.connect(remote, addr).await?;
            println!("Connected to {} at {}", remote, addr);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!("Received shutdown signal...");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        if node.peers().is_empty() {
                            println!("Peer disconnected");
                            break;
                        }
                    }
                }
            }
            node.shutdown();
        }

        Commands::Serve => {
            let addr = node.listen(None).await?;
            println!("Identity: {}", node.identity());
            println!("Listening on {}", addr);
            println!("Node is running. Press Ctrl+C to stop.");

            let status_interval = Duration::from_secs(60);
            let mut ticker = tokio::time::interval(status_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!("Received shutdown signal...");
                        break;
                    }
                    _ = ticker.tick() => {
                        let status = node.status()?;
                        info!(
                            peers = status.peers.len(),
                            active_tasks = status.active_tasks,
                            receive_log_len = status.receive_log_len,
                            "Status"
                        );
                    }
                }
            }
            node.shutdown();
        }

        Commands::ReceiveLog { from, limit } => {
            print_entries(&node.receive_log(from, limit)?)?;
        }

        Commands::PublishedLog { after } => {
            print_entries(&node.published_log(after)?)?;
        }

        Commands::Ban { target } => {
            let hash = parse_ban_hash(&target)?;
            node.add_to_ban_list(hash)?;
            println!("Banned {}", hash.to_hex());
        }

        Commands::Unban { target } => {
            let hash = parse_ban_hash(&target)?;
            if node.remove_from_ban_list(hash)? {
                println!("Unbanned {}", hash.to_hex());
            } else {
                println!("{} was not banned", hash.to_hex());
            }
        }

        Commands::Want { feed, days } => {
            let feed = parse_feed(&feed)?;
            let until = want_until(days)?;
            node.add_to_want_list(feed, until)?;
            println!("Wanting {} until {}", feed, until.to_rfc3339());
        }

        Commands::Unwant { feed } => {
            let feed = parse_feed(&feed)?;
            node.remove_from_want_list(feed)?;
            println!("No longer wanting {}", feed);
        }
    }

    Ok(())
}
