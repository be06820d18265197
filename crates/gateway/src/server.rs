use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use taskfleet_core::config::GatewayConfig;
use taskfleet_infrastructure::BrokerHandles;

use crate::routes::{create_routes, AppState};

/// 启动网关并在收到关闭信号后停止接收新连接
pub async fn serve(
    config: &GatewayConfig,
    broker: &BrokerHandles,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    config.validate()?;
    let state = AppState::new(config, broker.queue.clone(), broker.registry.clone());
    let app = create_routes(state);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("网关无法绑定 {}", config.bind_address))?;
    info!(
        "网关监听 {} (已登记 {} 个Worker凭据)",
        config.bind_address,
        config.credentials.len()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("网关停止接收新请求");
        })
        .await
        .context("网关运行失败")?;
    Ok(())
}
