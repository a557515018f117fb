//! gattmesh CLI
//!
//! Fragment planning and in-memory mesh simulation for the gattmesh transport

mod config;
mod progress;

use clap::{Parser, Subcommand};
use gattmesh_core::{FragmentHeader, Message, MessageType, PeerId, split_message};
use gattmesh_transport::{LoopbackNode, TransferEvent, TransportEvent};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferProgress, format_bytes};

/// gattmesh - mesh packet transport over BLE GATT links
#[derive(Parser)]
#[command(name = "gattmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a payload of the given size is fragmented
    Split {
        /// Payload size in bytes
        #[arg(required = true)]
        size: usize,

        /// Fragmentation threshold (defaults to config)
        #[arg(long)]
        threshold: Option<usize>,

        /// Maximum chunk size (defaults to config)
        #[arg(long)]
        chunk: Option<usize>,
    },

    /// Run an in-memory mesh and send one message from the first node
    Simulate {
        /// Number of nodes, including the sender
        #[arg(short, long, default_value_t = 4)]
        nodes: usize,

        /// Payload size in bytes
        #[arg(short, long, default_value_t = 4096)]
        size: usize,

        /// Send to the last node only instead of broadcasting
        #[arg(long)]
        direct: bool,

        /// Also connect every peer back to the sender (two paths per peer)
        #[arg(long)]
        dual: bool,

        /// Reject this many of the sender's first writes
        #[arg(long, default_value_t = 0)]
        reject: usize,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref())?;
    config.validate()?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Split {
            size,
            threshold,
            chunk,
        } => {
            show_split(size, threshold, chunk, &config)?;
        }
        Commands::Simulate {
            nodes,
            size,
            direct,
            dual,
            reject,
        } => {
            simulate(nodes, size, direct, dual, reject, &config).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Print the fragment plan for a payload
fn show_split(
    size: usize,
    threshold: Option<usize>,
    chunk: Option<usize>,
    config: &Config,
) -> anyhow::Result<()> {
    let threshold = threshold.unwrap_or(config.fragment.threshold);
    let chunk = chunk.unwrap_or(config.fragment.max_chunk);

    let message = Message::new(MessageType::Message, PeerId::new([0; 8]), vec![0u8; size]);
    let fragments = split_message(&message, threshold, chunk)?;

    println!("Payload: {}", format_bytes(size as u64));
    println!("Encoded: {} bytes", message.encoded_len());
    println!("Threshold: {threshold} bytes, max chunk: {chunk} bytes");
    println!();

    if fragments.len() == 1 {
        println!("Sent unfragmented");
        return Ok(());
    }

    println!("{} fragments:", fragments.len());
    for fragment in &fragments {
        let (header, data) = FragmentHeader::parse(fragment.payload())?;
        if header.index() == 0 {
            println!("  set id: {}", header.set_id());
        }
        println!(
            "  [{:>3}/{}] chunk {:>4} bytes, on the wire {:>4} bytes",
            header.index(),
            header.total(),
            data.len(),
            fragment.encoded_len()
        );
    }

    Ok(())
}

/// Build a star mesh around node 0 and send one message through it
async fn simulate(
    nodes: usize,
    size: usize,
    direct: bool,
    dual: bool,
    reject: usize,
    config: &Config,
) -> anyhow::Result<()> {
    if nodes < 2 {
        anyhow::bail!("A mesh needs at least 2 nodes");
    }

    let transport_config = config.to_transport();
    let mut mesh = Vec::with_capacity(nodes);
    let mut inboxes = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let id = PeerId::new((i as u64 + 1).to_be_bytes());
        let (node, events) = LoopbackNode::spawn(format!("n{i}"), id, transport_config.clone())?;
        mesh.push(node);
        inboxes.push(events);
    }

    let source = &mesh[0];
    for (i, peer) in mesh.iter().enumerate().skip(1) {
        LoopbackNode::connect(source, peer, Some(-40 - i as i16));
        if dual {
            LoopbackNode::connect(peer, source, Some(-70));
        }
    }
    source.link.reject_writes(reject);

    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let mut message = Message::new(MessageType::FileTransfer, source.id, payload.clone());
    let receivers: Vec<usize> = if direct {
        message = message.with_recipient(mesh[nodes - 1].id);
        vec![nodes - 1]
    } else {
        (1..nodes).collect()
    };

    println!("Nodes: {nodes} (dual paths: {dual})");
    println!("Payload: {}", format_bytes(size as u64));
    println!(
        "Mode: {}",
        if direct { "direct to last node" } else { "broadcast" }
    );
    println!();

    let started = Instant::now();
    let handle = source.transport.send(message, None)?;
    let progress = TransferProgress::new(0, handle.id().as_str());

    let mut source_events = inboxes.remove(0);
    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        track_transfer(&mut source_events, &progress),
    )
    .await;
    match outcome {
        Ok(true) => progress.finish_with_message(format!(
            "All units issued in {:.1?}",
            started.elapsed()
        )),
        Ok(false) => {
            progress.abandon();
            anyhow::bail!("Transfer {} cancelled", handle.id());
        }
        Err(_) => {
            progress.abandon();
            anyhow::bail!("Transfer {} timed out", handle.id());
        }
    }

    let mut delivered = 0;
    for index in receivers.iter().copied() {
        let inbox = &mut inboxes[index - 1];
        match tokio::time::timeout(Duration::from_secs(5), next_message(inbox)).await {
            Ok(Some(message)) if message.payload() == payload.as_slice() => {
                delivered += 1;
                tracing::debug!("n{} received {} bytes", index, message.payload().len());
            }
            Ok(Some(_)) => tracing::warn!("n{} received a corrupted payload", index),
            _ => tracing::warn!("n{} did not receive the message", index),
        }
    }

    let stats = source.transport.scheduler().stats().await?;
    println!();
    println!("Delivered: {}/{}", delivered, receivers.len());
    println!("Elapsed: {:.1?}", started.elapsed());
    println!(
        "Scheduler: issued={} completed={} retried={} dropped={} expired={}",
        stats.issued, stats.completed, stats.retried, stats.dropped, stats.expired
    );

    for node in &mesh {
        node.transport.shutdown().await;
    }

    if delivered < receivers.len() {
        anyhow::bail!("{} receivers missed the message", receivers.len() - delivered);
    }
    Ok(())
}

/// Follow transfer events until completion; false if cancelled
async fn track_transfer(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    progress: &TransferProgress,
) -> bool {
    while let Some(event) = events.recv().await {
        let TransportEvent::Transfer(event) = event else {
            continue;
        };
        match event {
            TransferEvent::Started { total, .. } => progress.set_total(total as u64),
            TransferEvent::Progress { done, .. } => progress.update(done as u64),
            TransferEvent::Completed { .. } => return true,
            TransferEvent::Cancelled { .. } => return false,
        }
    }
    false
}

async fn next_message(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Option<Message> {
    while let Some(event) = events.recv().await {
        if let TransportEvent::MessageReceived { message, .. } = event {
            return Some(message);
        }
    }
    None
}
