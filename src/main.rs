//! CoreDNS Rust - DNS server with the dnsnameresolver plugin

pub mod config;
pub mod dns_server;
pub mod error;
pub mod plugin;
pub mod types;
pub mod wire;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use chrono::Local;
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use plugin::dnsnameresolver::informer::{ChannelInformer, Informer};

// 自定义本地时间格式化器，解决日志默认输出 UTC 时间的问题
struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "coredns-dnsnameresolver")]
#[command(about = "A DNS server tracking DNSNameResolver bindings", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "Corefile")]
    config: String,

    #[arg(long, default_value = "0.0.0.0:53")]
    address: String,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4); // 兜底：如果获取失败，默认分配 4 个线程

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("coredns-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // 按本地时区每天 00:00 切割的日志轮转器
    let file_appender = RollingFileAppender::new(
        "logs/coredns.log",
        RollingConditionBasic::new().daily(),
        30, // 仅保留最近 30 天的历史日志
    )?;

    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("Starting CoreDNS Rust version {}", env!("CARGO_PKG_VERSION"));
    info!(">>> Utilizing {} worker threads", cores);

    let abs_path = std::fs::canonicalize(&args.config)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| args.config.clone());
    info!(">>> Configuration path: {}", abs_path);

    // 集群 API 的传输层不在本进程内实现：这里接入一个空的 DNSNameResolver 数据源，
    // 立即报告初始同步完成，外部驱动可以通过 FeedSender 推送事件
    let (informer, feed) = ChannelInformer::new();
    feed.mark_synced();
    let binding_feed: Arc<dyn Informer> = informer;

    let shared = Arc::new(plugin::SharedState::new(Some(binding_feed)));
    let cfg = config::Config::load(&abs_path, shared.clone())?;
    for zone_config in &cfg.zones {
        info!("Zone: {} loaded with {} plugins", zone_config.name, zone_config.plugins.len());
    }

    let server = Arc::new(dns_server::DnsServer::new(cfg, shared.clone())?);
    server.startup().await?;

    // watch::Sender 不能直接 clone，通过 SharedState 的 Arc 在子任务中发送退出信号
    let shared_clone = shared.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        let _ = shared_clone.shutdown_tx.send(true);
    });

    let served = server.run(args.address.clone()).await;
    server.shutdown().await;
    drop(feed);
    served
}
