mod bridge;
mod supervisor;
mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use remind_core::cfg::{self, AppId, Config};
use remind_core::logx;
use remind_core::reconnect::ReconnectPolicy;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::bridge::WsBridge;
use crate::supervisor::Supervisor;

const APP: AppId = AppId {
    qualifier: "bo",
    organization: "sanmartin",
    application: "recordatorio",
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "WhatsApp gateway: pairing session, reconnects and /enviar-mensaje")]
struct Cli {
    /// Config file (shared with the daemon by default).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Folder holding the session and temp folders.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,
    /// Override `gateway.bridge_url`.
    #[arg(long)]
    bridge_url: Option<String>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = match cli.config.as_deref() {
        Some(p) => cfg::load_or_init_at(p)?,
        None => cfg::load_or_init(&APP)?,
    };
    if let Some(url) = cli.bridge_url {
        cfg.gateway.bridge_url = url;
    }
    logx::init(logx::level_for(cli.verbose, &cfg.log_level));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(1, 4))
        .enable_all()
        .build()?;
    rt.block_on(run(cfg, cli.work_dir))
}

async fn run(cfg: Config, work_dir: PathBuf) -> Result<()> {
    let addr: std::net::SocketAddr = cfg
        .gateway
        .http_addr
        .parse()
        .with_context(|| format!("gateway.http_addr {}", cfg.gateway.http_addr))?;
    info!("gateway boot bridge={} http={}", cfg.gateway.bridge_url, addr);

    let bridge = Arc::new(WsBridge::new(
        cfg.gateway.bridge_url.clone(),
        Duration::from_secs(cfg.gateway.send_timeout_secs.max(1)),
    ));
    let supervisor = Arc::new(Supervisor::new(
        bridge,
        ReconnectPolicy::from(&cfg.reconnect),
        &cfg.gateway,
        &work_dir,
        &cfg.country_prefix,
    ));

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (sd_tx, sd_rx) = watch::channel(false);
    let sup_task = tokio::spawn(supervisor.clone().run(cmd_rx, sd_rx.clone()));

    let app = web::router(web::AppState { supervisor, commands: cmd_tx });
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    info!("gateway listening on http://{}", addr);

    let mut sd = sd_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = sd.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutdown requested");
    let _ = sd_tx.send(true);

    if let Err(e) = server.await? {
        error!("http server failed: {}", e);
    }
    sup_task.await??;
    Ok(())
}
