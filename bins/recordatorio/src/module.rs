use std::sync::Arc;

use remind_core::persist::KvConfigStore;
use remind_core::scheduler::Scheduler;
use remind_core::store::DefaultKv;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ModuleCtx {
    pub kv: DefaultKv,
    pub configs: KvConfigStore,
    pub scheduler: Arc<Scheduler>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
