use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tally_core::{
    limits::{MAX_STORAGE_BYTES, MAX_SYNC_ATTEMPTS},
    FormData,
};
use tally_sync::{
    ClientConfig, EventKind, LinkProbe, OfflineClient, StaticLink, SubmissionOutcome, SyncEvent,
    SyncOutcome,
};
use tokio::signal;
use tracing::{info, warn};

mod probe;
mod telemetry;

use probe::TcpProbe;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(
    name = "tally-kiosk",
    author,
    version,
    about = "Collect survey responses offline-first and sync them to the Tally server"
)]
struct Cli {
    /// Base URL of the Tally server.
    #[arg(long, env = "TALLY_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    server_url: String,

    /// Directory holding the device's pending queue and ledgers.
    #[arg(long, env = "TALLY_DATA_DIR", default_value = "tally-data")]
    data_dir: PathBuf,

    /// Local storage ceiling in bytes.
    #[arg(long, env = "TALLY_MAX_STORAGE_BYTES", default_value_t = MAX_STORAGE_BYTES)]
    max_storage_bytes: u64,

    /// Delivery attempts before a queued record is failed for good.
    #[arg(long, env = "TALLY_MAX_SYNC_ATTEMPTS", default_value_t = MAX_SYNC_ATTEMPTS)]
    max_sync_attempts: u32,

    /// Upper bound on a single delivery attempt.
    #[arg(long, env = "TALLY_DELIVERY_TIMEOUT_SECS", default_value_t = 10)]
    delivery_timeout_secs: u64,

    #[arg(long, env = "TALLY_SYNC_INTERVAL_SECS", default_value_t = 30)]
    sync_interval_secs: u64,

    #[arg(long, env = "TALLY_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    heartbeat_interval_secs: u64,

    /// How often `run` re-probes the server's reachability.
    #[arg(long, env = "TALLY_LINK_POLL_SECS", default_value_t = 5)]
    link_poll_secs: u64,

    /// Free-form device descriptor shown on the dashboard.
    #[arg(long, env = "TALLY_DEVICE_INFO")]
    device_info: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a filled form read from a JSON file (`-` for stdin).
    Submit { file: PathBuf },
    /// Run one sync pass now.
    Sync,
    /// Show the local queue and ledgers.
    Status,
    /// List sessions the server currently tracks.
    Sessions,
    /// Stay online as a kiosk: heartbeat, watch the link and sync in the background.
    Run {
        /// Section to report for this kiosk.
        #[arg(long)]
        section: Option<String>,
    },
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.server_url.clone(),
            data_dir: Some(self.data_dir.clone()),
            max_storage_bytes: self.max_storage_bytes,
            max_sync_attempts: self.max_sync_attempts,
            delivery_timeout: Duration::from_secs(self.delivery_timeout_secs),
            sync_interval: Duration::from_secs(self.sync_interval_secs.max(1)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            link_poll_interval: Duration::from_secs(self.link_poll_secs.max(1)),
            device_info: self.device_info.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter)?;

    let config = cli.client_config();
    let probe = Arc::new(TcpProbe::for_server(&config.server_url, PROBE_TIMEOUT)?);
    let link_up = {
        let probe = Arc::clone(&probe);
        tokio::task::spawn_blocking(move || probe.link_up())
            .await
            .context("link probe task failed")?
    };
    info!(server = %probe.target(), link_up, "initial link probe");

    let client = OfflineClient::open(config, &StaticLink::new(link_up))
        .context("failed to open offline client")?;
    let _failures = client.bus().subscribe(EventKind::SyncCompleted, |event| {
        if let SyncEvent::SyncCompleted(report) = event {
            if !report.permanently_failed.is_empty() {
                warn!(
                    ids = ?report.permanently_failed,
                    "these responses could not be synced; contact support"
                );
            }
        }
    });
    let _evictions = client.bus().subscribe(EventKind::RecordsEvicted, |event| {
        if let SyncEvent::RecordsEvicted { ids, freed_bytes } = event {
            warn!(?ids, freed_bytes, "local storage full; oldest pending records dropped");
        }
    });

    match cli.command {
        Command::Submit { file } => submit(&client, &file).await,
        Command::Sync => sync(&client).await,
        Command::Status => status(&client, cli.max_storage_bytes),
        Command::Sessions => sessions(&client).await,
        Command::Run { section } => run(&client, probe, section).await,
    }
}

async fn submit(client: &OfflineClient, file: &Path) -> Result<()> {
    let raw = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read form from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?
    };
    let form: FormData = serde_json::from_str(&raw).context("form file is not valid form JSON")?;

    let outcome = client
        .submitter()
        .submit(form)
        .await
        .context("response could not be saved on this device")?;
    match &outcome {
        SubmissionOutcome::Delivered { id } => println!("delivered {id}"),
        SubmissionOutcome::QueuedOffline { id } => {
            println!("saved {id} on this device; it will be sent once the server is reachable")
        }
    }

    if client.monitor().is_online() && client.queue().pending_len() > 0 {
        client.engine().sync_now().await;
    }
    Ok(())
}

async fn sync(client: &OfflineClient) -> Result<()> {
    let report = client.engine().sync_now().await;
    match report.outcome {
        SyncOutcome::Offline => println!("offline: {} records waiting", report.remaining),
        SyncOutcome::Coalesced => println!("a sync pass is already running"),
        SyncOutcome::Completed => println!(
            "synced {} records, {} still pending, {} failed permanently",
            report.succeeded,
            report.remaining,
            report.permanently_failed.len()
        ),
    }
    Ok(())
}

fn status(client: &OfflineClient, capacity: u64) -> Result<()> {
    let queue = client.queue();
    let failed: Vec<_> = queue
        .failed()
        .into_iter()
        .map(|entry| {
            json!({
                "id": entry.record.id,
                "reason": entry.reason,
                "failedAt": entry.failed_at,
            })
        })
        .collect();
    let summary = json!({
        "online": client.monitor().is_online(),
        "pending": queue.pending_len(),
        "resolved": queue.resolved().len(),
        "failed": failed,
        "usedBytes": queue.used_bytes(),
        "capacityBytes": capacity,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn sessions(client: &OfflineClient) -> Result<()> {
    let sessions = client
        .remote()
        .fetch_sessions()
        .await
        .context("failed to fetch sessions from server")?;
    for view in sessions {
        println!(
            "{}\t{:?}\t{}s\t{}",
            view.session.session_id,
            view.status,
            view.elapsed_seconds,
            view.session.section.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run(client: &OfflineClient, probe: Arc<TcpProbe>, section: Option<String>) -> Result<()> {
    let presence = client.presence();
    let delivered = presence
        .register()
        .await
        .context("failed to register session")?;
    info!(session_id = presence.session_id(), delivered, "kiosk session registered");
    if section.is_some() {
        presence.set_section(section).await;
    }

    let handles = client.start(probe);
    let _ = signal::ctrl_c().await;
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }

    if let Err(err) = presence.unregister().await {
        warn!(error = %err, "failed to unregister session");
    }
    Ok(())
}
