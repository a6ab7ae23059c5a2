use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mesh_peers::config::{
    generate_session_id, DEFAULT_HEARTBEAT_TEXT, DEFAULT_SIGNALLER_URL, DEFAULT_STUN_URL,
};
use mesh_peers::telemetry::logging::{self, LogConfig, LogLevel};
use mesh_peers::{MeshConfig, MeshSession};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mesh-peers", about = "Spawn virtual peers that mesh through a rendezvous service")]
struct Cli {
    /// Rendezvous service base URL (http, https, ws or wss).
    #[arg(long, env = "MESH_SIGNALLER_URL", default_value = DEFAULT_SIGNALLER_URL)]
    signaller_url: String,

    /// Session id to connect with; random when omitted.
    #[arg(long)]
    session_id: Option<String>,

    /// Number of local peers to create.
    #[arg(long, default_value_t = 1)]
    peers: usize,

    #[arg(long, default_value_t = 150)]
    spawn_interval_ms: u64,

    /// STUN/TURN server url; repeat for several.
    #[arg(long = "stun-url")]
    stun_urls: Vec<String>,

    /// Use host candidates only.
    #[arg(long, conflicts_with = "stun_urls")]
    no_stun: bool,

    #[arg(long, default_value_t = 15)]
    publish_interval_secs: u64,

    /// How often to log the session counters.
    #[arg(long, default_value_t = 10)]
    report_interval_secs: u64,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn mesh_config(&self) -> Result<MeshConfig> {
        let ice_servers = if self.no_stun {
            Vec::new()
        } else if self.stun_urls.is_empty() {
            vec![DEFAULT_STUN_URL.to_string()]
        } else {
            self.stun_urls.clone()
        };
        let config = MeshConfig {
            signaller_url: self.signaller_url.clone(),
            session_id: self.session_id.clone().unwrap_or_else(generate_session_id),
            ice_servers,
            publish_interval: Duration::from_secs(self.publish_interval_secs),
            heartbeat_text: DEFAULT_HEARTBEAT_TEXT.to_string(),
        };
        config.validate().context("invalid mesh configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let config = cli.mesh_config()?;
    info!(
        target: "mesh",
        session = %config.session_id,
        peers = cli.peers,
        signaller = %config.signaller_url,
        "starting mesh-peers"
    );

    let session = MeshSession::connect(config)
        .await
        .context("failed to connect to rendezvous service")?;

    let spawn_interval = Duration::from_millis(cli.spawn_interval_ms);
    tokio::select! {
        created = session.spawn_peers(cli.peers, spawn_interval) => {
            match created {
                Ok(peers) => info!(target: "mesh", count = peers.len(), "peers created"),
                Err(err) => warn!(target: "mesh", error = %err, "peer creation stopped"),
            }
        }
        _ = signal::ctrl_c() => {
            session.teardown().await;
            return Ok(());
        }
    }

    let report_every = Duration::from_secs(cli.report_interval_secs.max(1));
    let mut report = tokio::time::interval(report_every);
    report.tick().await;
    loop {
        tokio::select! {
            _ = report.tick() => {
                let counters = session.counters();
                let connections = session.connections().await.unwrap_or_default();
                let ready = connections.iter().filter(|c| c.ready).count();
                info!(
                    target: "mesh",
                    connections = connections.len(),
                    ready,
                    counters = %serde_json::to_string(&counters).unwrap_or_default(),
                    "session status"
                );
            }
            _ = signal::ctrl_c() => break,
        }
    }

    info!(target: "mesh", "shutting down");
    session.teardown().await;
    Ok(())
}
