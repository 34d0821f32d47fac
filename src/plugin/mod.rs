pub mod dnsnameresolver;
pub mod forward;
pub mod prometheus;

use anyhow::Result;
use std::sync::Arc;
use crate::config::PluginConfig;
use crate::plugin::dnsnameresolver::informer::Informer;
use crate::types::DnsMessage;

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> where Self: Sized;
    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage>;
    /// Runs in reverse order once the chain has produced its final answer.
    async fn post_process(&self, _msg: &mut DnsMessage) -> Result<()> {
        Ok(())
    }
    fn priority(&self) -> u8;
    /// Called once before the listeners are bound; an error aborts startup.
    async fn on_startup(&self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub struct SharedState {
    pub shutdown_tx: tokio::sync::watch::Sender<bool>,
    pub shutdown_rx: tokio::sync::watch::Receiver<bool>,
    binding_feed: parking_lot::Mutex<Option<Arc<dyn Informer>>>,
}

impl SharedState {
    pub fn new(binding_feed: Option<Arc<dyn Informer>>) -> Self {
        // 使用 watch channel 广播退出信号，所有监听任务共享同一个接收端的克隆
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            binding_feed: parking_lot::Mutex::new(binding_feed),
        }
    }

    /// Hands out the resolver binding feed. It can be taken only once.
    pub fn take_binding_feed(&self) -> Option<Arc<dyn Informer>> {
        self.binding_feed.lock().take()
    }
}

pub fn create_plugin(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Box<dyn Plugin>> {
    match config.name.as_str() {
        "dnsnameresolver" => Ok(Box::new(dnsnameresolver::DnsNameResolverPlugin::from_config(config, shared)?)),
        "forward" => Ok(Box::new(forward::ForwardPlugin::from_config(config, shared)?)),
        "prometheus" => Ok(Box::new(prometheus::PrometheusPlugin::from_config(config, shared)?)),
        _ => anyhow::bail!("Unknown plugin: {}", config.name),
    }
}
