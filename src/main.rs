mod config;
mod engine;
mod network;
mod rewrite;
mod server;
mod upstream;
mod view;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LoggingConfig, RuntimeConfig, find_config, resolve_addr};
use crate::engine::Engine;
use crate::network::NetList;
use crate::upstream::UpstreamClient;

#[derive(Parser, Debug)]
#[command(author, version, about = "Split-horizon DNS answer filter", long_about = None)]
struct Args {
    /// 配置文件路径（YAML 或 JSON，按扩展名），优先于默认搜索路径
    #[arg(short = 'c', long = "config", env = "DNSVIEWS_CONFIG")]
    config: Option<PathBuf>,
    /// 启用调试日志（环境变量接受 true/yes/1/on）
    #[arg(
        long = "debug",
        env = "DNSVIEWS_DEBUG",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    debug: bool,
    /// 配置文件未设置 default_rule 时使用的全局默认规则（allow/deny）
    #[arg(long = "default-rule", env = "DNSVIEWS_DEFAULT_RULE")]
    default_rule: Option<String>,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loaded = find_config(args.config.as_deref()).context("load config")?;
    let cfg = RuntimeConfig::from_config(loaded.config, args.default_rule.as_deref())
        .with_context(|| format!("invalid config {}", loaded.path.display()))?;

    init_tracing(args.debug || cfg.debug, &cfg.logging);

    for skipped in &loaded.skipped {
        debug!(target = "config", path = %skipped.path.display(), reason = %skipped.reason, "config candidate skipped");
    }
    info!(
        target = "config",
        path = %loaded.path.display(),
        views = cfg.views.views().len(),
        default_rule = ?cfg.views.default_rule(),
        "config loaded"
    );
    for (idx, v) in cfg.views.views().iter().enumerate() {
        debug!(
            target = "config",
            index = idx,
            view = %v.name,
            sources = %fmt_nets(&v.sources),
            include = %fmt_nets(&v.include),
            exclude = %fmt_nets(&v.exclude),
            rule = ?v.rule,
            "view compiled"
        );
    }

    let upstream_addr = resolve_addr(&cfg.upstream)
        .await
        .context("parse upstream addr")?;
    let listen_addr = resolve_addr(&cfg.listen)
        .await
        .context("parse listen addr")?;
    let upstream_timeout = cfg.upstream_timeout;

    let engine = Engine::new(
        Arc::new(cfg.views),
        UpstreamClient::new(upstream_addr, upstream_timeout),
    );

    // UDP worker 数量：默认为 CPU 核心数，最少 1 个
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };
    let udp_sockets = server::bind_udp(listen_addr, udp_workers).context("bind udp listener")?;
    let tcp_listener = TcpListener::bind(listen_addr)
        .await
        .context("bind tcp listener")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listeners = JoinSet::new();
    for (worker_id, socket) in udp_sockets.into_iter().enumerate() {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        listeners.spawn(async move {
            server::run_udp_worker(worker_id, socket, engine, shutdown)
                .await
                .with_context(|| format!("udp worker {}", worker_id))
        });
    }
    {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        listeners.spawn(async move {
            server::run_tcp(tcp_listener, engine, shutdown)
                .await
                .context("tcp listener")
        });
    }

    info!(listen = %listen_addr, upstream = %upstream_addr, udp_workers, "dns views server started");

    let mut failure = server::supervise(&mut listeners, shutdown_signal()).await;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    while let Some(res) = listeners.join_next().await {
        if let Some(err) = server::listener_error(res) {
            failure.get_or_insert(err);
        }
    }

    if !engine.drain(upstream_timeout).await {
        warn!("in-flight requests still pending at exit");
    }
    info!(metrics = %engine.metrics_snapshot(), "shutdown complete");

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn fmt_nets(nets: &NetList) -> String {
    nets.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn init_tracing(debug: bool, logging: &LoggingConfig) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match (logging.json, logging.include_date) {
        (true, true) => registry.with(fmt::layer().json().with_target(false)).init(),
        (true, false) => registry
            .with(fmt::layer().json().with_target(false).without_time())
            .init(),
        (false, true) => registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init(),
        (false, false) => registry
            .with(fmt::layer().with_target(false).with_ansi(false).without_time())
            .init(),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot install SIGTERM handler, waiting for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received SIGINT");
    }
}
