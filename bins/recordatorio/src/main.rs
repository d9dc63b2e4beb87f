mod gateway_client;
mod module;
mod scheduler;
#[cfg(feature = "web-api")]
mod web;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use remind_core::cfg::{self, AppId, Config};
use remind_core::clock::{Clock, SystemClock};
use remind_core::logx;
use remind_core::persist::{ConfigStore, KvConfigStore};
use remind_core::schedule::Feature;
use remind_core::scheduler::{Scheduler, SchedulerOptions};
use remind_core::store::open_default;
use remind_core::transport::{MessagingTransport, TransportBulkSender};
use tracing::{error, info, warn};

use crate::gateway_client::HttpGateway;
use crate::module::{Module, ModuleCtx};
use crate::scheduler::ScheduleModule;

const APP: AppId = AppId {
    qualifier: "bo",
    organization: "sanmartin",
    application: env!("CARGO_PKG_NAME"),
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Daily reminder scheduler for the member messaging gateway")]
struct Cli {
    /// Config file (defaults to the per-user config dir).
    #[arg(long)]
    config: Option<PathBuf>,
    /// KV root override.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Load config and schedules, print them, and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = match cli.config.as_deref() {
        Some(p) => cfg::load_or_init_at(p)?,
        None => cfg::load_or_init(&APP)?,
    };
    logx::init(logx::level_for(cli.verbose, &cfg.log_level));

    let data = cfg::data_dir(&APP, &cfg, cli.data_dir.as_deref())?;
    let kv = open_default(&data).with_context(|| format!("open kv at {}", data.display()))?;
    let configs = KvConfigStore::new(kv.clone());

    if cli.check {
        println!("data_dir={}", data.display());
        for f in Feature::ALL {
            let c = configs.load_config(f)?;
            println!(
                "{} {} enabled={} lead_days={}",
                f,
                c.formatted_time(),
                c.enabled,
                c.lead_days
            );
        }
        return Ok(());
    }

    #[cfg(feature = "rt-single")]
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    #[cfg(not(feature = "rt-single"))]
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(1))
        .enable_all()
        .build()?;

    rt.block_on(run(cfg, kv, configs))
}

async fn run(cfg: Config, kv: remind_core::store::DefaultKv, configs: KvConfigStore) -> Result<()> {
    info!("{} boot gateway={} http={}", APP.application, cfg.gateway_url, cfg.http_addr);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let scheduler = Arc::new(Scheduler::new(
        clock.clone(),
        SchedulerOptions { coarse_period: cfg.coarse_period(), countdown_period: cfg.countdown_period() },
    ));
    let transport: Arc<dyn MessagingTransport> = Arc::new(HttpGateway::new(&cfg.gateway_url)?);

    let mut senders = HashMap::new();
    for f in Feature::ALL {
        let sender = Arc::new(TransportBulkSender::new(
            f,
            transport.clone(),
            kv.clone(),
            clock.clone(),
            cfg.country_prefix.clone(),
            cfg.send_pause(),
        ));
        scheduler.register(f, sender.clone());
        senders.insert(f, sender);
    }

    let (tx, rx) = tokio::sync::watch::channel(false);
    let ctx = ModuleCtx { kv, configs, scheduler: scheduler.clone(), shutdown: rx };

    let mut modules: Vec<Box<dyn Module>> = vec![Box::new(ScheduleModule)];
    #[cfg(feature = "web-api")]
    modules.push(Box::new(web::WebServer {
        http_addr: Some(cfg.http_addr.parse().with_context(|| format!("http_addr {}", cfg.http_addr))?),
        https_addr: match cfg.https_addr.as_deref() {
            Some(a) => Some(a.parse().with_context(|| format!("https_addr {a}"))?),
            None => None,
        },
        tls_cert_pem: cfg.tls_cert.clone(),
        tls_key_pem: cfg.tls_key.clone(),
        senders: Arc::new(senders),
        transport: transport.clone(),
    }));
    #[cfg(not(feature = "web-api"))]
    drop(senders);

    let mut handles = Vec::new();
    for m in modules {
        let name = m.name();
        info!("starting module {}", name);
        handles.push((name, m.spawn(ctx.clone())));
    }

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutdown requested");
    let _ = tx.send(true);

    for (name, h) in handles {
        match h.await {
            Ok(Ok(())) => info!("module {} stopped", name),
            Ok(Err(e)) => error!("module {} failed: {:#}", name, e),
            Err(e) => warn!("module {} panicked: {}", name, e),
        }
    }
    scheduler.shutdown();
    Ok(())
}
