mod config;
mod cooldown;
mod detector;
mod engine;
mod model;
mod motion;
mod notify;
mod process;
mod proxy;
mod reaper;
mod recorder;
mod resolver;
mod state;
mod store;
mod stream;
mod supervisor;
#[cfg(test)]
mod testing;
mod web;

use clap::Parser;
use config::AppConfig;
use engine::Engine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// NVR Core - camera process supervision
/// 解析命令行参数，加载配置文件，启动后台 supervisor 与 HTTP 服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "nvr.yaml")]
    config: String,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// 等待 Ctrl-C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，RUST_LOG 可覆盖默认级别
    init_logging();

    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    info!(
        "NVR core initialized. Recordings: {:?}, proxy: {}",
        config.recording.root,
        if config.proxy.enabled { "enabled" } else { "disabled" }
    );
    let listen = config.server.listen.clone();

    // 打开 feed 目录，失败则直接退出
    let engine = Arc::new(Engine::build(config).await?);

    // 路由同步 -> 首次 reconcile -> 首次清理孤儿进程
    engine.start().await;

    // 启动后台周期任务
    let shutdown = CancellationToken::new();
    let background = supervisor::spawn_background(engine.clone(), shutdown.clone());

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", listen);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    axum::serve(listener, web::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 停止后台任务，再停止所有子进程
    shutdown.cancel();
    futures::future::join_all(background).await;
    engine.shutdown().await;

    info!("Bye");
    Ok(())
}
