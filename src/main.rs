use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use geochat::{AppState, config::Config, platform::Platform, routes};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 缺少平台配置时直接退出
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Missing platform configuration: {}", e);
            std::process::exit(1);
        }
    };

    // 管理接口使用服务端密钥
    let platform = Platform::connect(&config, &config.service_role_key)
        .await
        .context("failed to connect to the data platform")?;

    let state = AppState {
        config: config.clone(),
        platform,
    };
    let app = routes::router(state);

    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Admin api listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
}
