use remind_core::dispatch::{DispatchReport, Notice};
use remind_core::persist::ConfigStore;
use remind_core::schedule::Feature;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::module::{Module, ModuleCtx};

/// Restores every feature's schedule at boot and reports dispatch notices.
pub struct ScheduleModule;

impl Module for ScheduleModule {
    fn name(&self) -> &'static str { "scheduler" }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut notices = ctx.scheduler.subscribe();

            for feature in Feature::ALL {
                match ctx.configs.load_config(feature) {
                    Ok(cfg) => match ctx.scheduler.apply(feature, cfg.clone()) {
                        Ok(state) => info!("schedule {} {} -> {:?}", feature, cfg.formatted_time(), state),
                        Err(e) => warn!("schedule {} not started: {}", feature, e),
                    },
                    Err(e) => warn!("schedule {} could not be loaded: {:#}", feature, e),
                }
            }

            loop {
                tokio::select! {
                    n = notices.recv() => match n {
                        Ok(notice) => report(&notice),
                        Err(RecvError::Lagged(missed)) => warn!("missed {} dispatch notices", missed),
                        Err(RecvError::Closed) => break,
                    },
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            ctx.scheduler.shutdown();
                            info!("scheduler stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

fn report(notice: &Notice) {
    match &notice.report {
        DispatchReport::Completed { outcome } => info!(
            "{} dispatch ({:?}) ok={} failed={} skipped={}",
            notice.feature, notice.trigger, outcome.succeeded_count, outcome.failed_count, outcome.skipped_count
        ),
        DispatchReport::Failed { error } => {
            warn!("{} dispatch ({:?}) failed: {}", notice.feature, notice.trigger, error)
        }
        DispatchReport::Skipped => {
            info!("{} dispatch ({:?}) ignored: previous run still in progress", notice.feature, notice.trigger)
        }
    }
}
