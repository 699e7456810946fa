//! # skiff-node
//!
//! Loopback runner: starts a seeding and a downloading session on an
//! in-process bus, transfers one file between them and prints a JSON
//! report. Useful as a smoke test for a configuration.

mod config;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skiff_client::{spawn_session, ClientEvent, SecurityMode, SessionHandle, SessionStatus};
use skiff_net::MemoryBus;
use skiff_shared::protocol::{Channel, FileAnnouncement};
use skiff_shared::{PeerId, TransferConfig};
use skiff_store::{MemoryPieceStore, PieceStore, SqlitePieceStore};

use crate::config::NodeConfig;

// Seeder sorts first so it coordinates forward-secure rooms
const SEEDER_ID: &str = "node-a-seeder";
const LEECHER_ID: &str = "node-b-leecher";

#[derive(Debug, Serialize)]
struct Report {
    file: FileAnnouncement,
    verified: bool,
    elapsed_ms: u128,
    artifact: String,
    seeder: SessionStatus,
    leecher: SessionStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,skiff_client=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting skiff-node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let node = NodeConfig::from_args_and_env(std::env::args().skip(1))?;
    let transfer = TransferConfig::from_env();
    info!(?node, "Loaded runner configuration");
    info!(?transfer, "Loaded transfer configuration");

    // -----------------------------------------------------------------------
    // 3. Run, or stop on Ctrl+C
    // -----------------------------------------------------------------------
    let run = tokio::time::timeout(node.timeout, run(&node, transfer));
    let report = tokio::select! {
        result = run => result.context("transfer timed out")??,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.verified {
        bail!("downloaded bytes differ from the source file");
    }
    Ok(())
}

fn open_store(node: &NodeConfig) -> Arc<dyn PieceStore> {
    if node.sqlite {
        match SqlitePieceStore::open_default() {
            Ok(store) => return Arc::new(store),
            Err(e) => warn!(error = %e, "SQLite piece store unavailable, using memory"),
        }
    }
    Arc::new(MemoryPieceStore::new())
}

async fn run(node: &NodeConfig, config: TransferConfig) -> anyhow::Result<Report> {
    let bus = if node.loss_rate > 0.0 {
        MemoryBus::with_loss(node.loss_rate)
    } else {
        MemoryBus::new()
    };

    let (seeder, _seeder_events) = join(&bus, SEEDER_ID, node, config.clone(), None);
    let (leecher, mut events) = join(&bus, LEECHER_ID, node, config, Some(open_store(node)));

    if node.mode == SecurityMode::ForwardSecure {
        let epoch_id = wait_for(&mut events, |e| match e {
            ClientEvent::EpochKeyAdopted { epoch_id, from } if from.as_str() == SEEDER_ID => {
                Some(epoch_id)
            }
            _ => None,
        })
        .await?;
        info!(epoch_id = %epoch_id, "Leecher holds the seeder's epoch key");
    }

    let started = Instant::now();
    let file = seeder
        .share_file(&node.file)
        .await
        .with_context(|| format!("sharing {}", node.file.display()))?;

    wait_for(&mut events, |e| match e {
        ClientEvent::FileAnnounced { announcement, .. } if announcement.file_id == file.file_id => {
            Some(())
        }
        _ => None,
    })
    .await?;
    leecher.download(file.file_id).await?;

    let artifact = wait_for(&mut events, |e| match e {
        ClientEvent::DownloadProgress {
            received, total, ..
        } => {
            info!(received, total, "Progress");
            None
        }
        ClientEvent::DownloadComplete { artifact, .. } => Some(Ok(artifact)),
        ClientEvent::DownloadFailed { reason, .. } => Some(Err(reason)),
        _ => None,
    })
    .await?
    .map_err(|reason| anyhow::anyhow!("download failed: {reason}"))?;
    let elapsed_ms = started.elapsed().as_millis();

    let original = tokio::fs::read(&node.file).await?;
    let downloaded = artifact.read().await?;

    let report = Report {
        file,
        verified: original == downloaded,
        elapsed_ms,
        artifact: format!("{artifact:?}"),
        seeder: seeder.status().await?,
        leecher: leecher.status().await?,
    };

    seeder.shutdown().await;
    leecher.shutdown().await;
    Ok(report)
}

fn join(
    bus: &MemoryBus,
    id: &str,
    node: &NodeConfig,
    config: TransferConfig,
    store: Option<Arc<dyn PieceStore>>,
) -> (SessionHandle, UnboundedReceiver<ClientEvent>) {
    let peer = PeerId::new(id);
    let (tx, rx) = bus.connect(peer.clone(), &Channel::ALL);
    spawn_session(peer, node.room.clone(), node.mode.clone(), config, store, tx, rx)
}

async fn wait_for<T>(
    events: &mut UnboundedReceiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> anyhow::Result<T> {
    while let Some(event) = events.recv().await {
        if let Some(value) = pick(event) {
            return Ok(value);
        }
    }
    bail!("session stopped unexpectedly")
}
