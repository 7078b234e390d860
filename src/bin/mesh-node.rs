//! Mesh Node Application
//!
//! Runs one node of the playback mesh and takes operator commands on stdin.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio_mesh::{
    audio::device::list_output_devices,
    config::{MeshConfig, OutputKind},
    MeshHandle, MeshNode,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to the per-user config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to accept mesh links on
    #[arg(long)]
    listen: Option<String>,

    /// Peer to dial and keep connected; may be repeated
    #[arg(long)]
    connect: Vec<String>,

    /// Name shown to other nodes
    #[arg(long)]
    name: Option<String>,

    /// Start as leader
    #[arg(long)]
    leader: bool,

    /// Keep time without opening an output device
    #[arg(long)]
    simulated: bool,

    /// Output device name
    #[arg(long)]
    device: Option<String>,

    /// File to load and distribute once running (leader only)
    #[arg(long)]
    load: Option<PathBuf>,
}

const HELP: &str = "\
commands:
  leader | follower        change role
  load <path>              load and distribute a file (leader)
  play | pause | stop      transport (leader)
  volume <0.0-1.0>         output gain (broadcast when leader)
  connect <host:port>      dial a peer
  peers                    list connected peers
  status                   node status as JSON
  devices                  list output devices
  quit                     leave the mesh";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = apply_args(MeshConfig::load(args.config.as_deref())?, &args);

    tracing::info!("Starting mesh node {}", config.node.display_name);

    let node = MeshNode::start(config)
        .await
        .context("could not join the mesh")?;

    println!("node id: {}", node.identity().id);
    if let Some(addr) = node.listen_addr() {
        println!("listening on {}", addr);
    }

    if let Some(path) = &args.load {
        match node.load_file(path).await {
            Ok(info) => println!("loaded {} ({:.1}s)", info.name, info.duration_seconds),
            Err(e) => eprintln!("load failed: {}", e),
        }
    }

    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_command(&node, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    node.shutdown().await?;
    Ok(())
}

/// Command-line flags win over the file
fn apply_args(mut config: MeshConfig, args: &Args) -> MeshConfig {
    if let Some(listen) = &args.listen {
        config.network.listen_addr = Some(listen.clone());
    }
    config.network.peers.extend(args.connect.iter().cloned());
    if let Some(name) = &args.name {
        config.node.display_name = name.clone();
    }
    if args.leader {
        config.node.start_as_leader = true;
    }
    if args.simulated {
        config.audio.output = OutputKind::Simulated;
    }
    if let Some(device) = &args.device {
        config.audio.device = Some(device.clone());
    }
    config
}

/// Run one operator command. Returns `false` when the operator quits.
async fn run_command(node: &MeshHandle, line: &str) -> Result<bool> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let argument = parts.next().map(str::trim).unwrap_or_default();

    let outcome = match command {
        "" => Ok(()),
        "leader" => node.become_leader().await.map(|changed| report_role(changed, "leader")),
        "follower" => node
            .become_follower()
            .await
            .map(|changed| report_role(changed, "follower")),
        "load" if !argument.is_empty() => node.load_file(argument).await.map(|info| {
            println!(
                "loaded {} ({} bytes, {:.1}s)",
                info.name, info.byte_size, info.duration_seconds
            )
        }),
        "play" => node.play().await,
        "pause" => node.pause().await,
        "stop" => node.stop().await,
        "volume" => match argument.parse::<f32>() {
            Ok(level) => node
                .set_volume(level)
                .await
                .map(|applied| println!("volume {:.2}", applied)),
            Err(_) => {
                println!("usage: volume <0.0-1.0>");
                Ok(())
            }
        },
        "connect" if !argument.is_empty() => node.connect(argument).await,
        "peers" => node.status().await.map(|status| {
            if status.peers.is_empty() {
                println!("no peers");
            }
            for peer in status.peers {
                let latency = peer
                    .metrics
                    .map(|m| format!("{:.1} ms ({:?})", m.latest_latency_ms, m.quality))
                    .unwrap_or_else(|| "-".to_string());
                let role = if peer.summary.claims_leader { "leader" } else { "follower" };
                println!(
                    "  {} [{}] {} {}",
                    peer.summary.display_name, role, peer.summary.remote_id, latency
                );
            }
        }),
        "status" => {
            let status = node.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        "devices" => {
            for device in list_output_devices() {
                let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
                println!("  {}{}", device.name, default_marker);
                println!("    Sample rates: {:?}", device.sample_rates);
                println!("    Channels: {:?}", device.channels);
            }
            Ok(())
        }
        "quit" | "exit" => return Ok(false),
        _ => {
            println!("{}", HELP);
            Ok(())
        }
    };

    if let Err(e) = outcome {
        println!("error: {}", e);
    }
    Ok(true)
}

fn report_role(changed: bool, role: &str) {
    if changed {
        println!("now {}", role);
    } else {
        println!("already {}", role);
    }
}
