use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use taskfleet_core::config::GatewayConfig;
use taskfleet_core::traits::{TaskQueue, WorkerRegistry};

use crate::auth::Authenticator;
use crate::handlers::{
    ack_control, ack_tasks, health_check, heartbeat, poll_control, poll_tasks, publish_logs, publish_result,
    reclaim_control, reclaim_tasks, renew_tasks, reply,
};
use crate::middleware::guard;
use crate::rate_limit::RateLimiter;

/// 网关状态
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<dyn WorkerRegistry>,
    pub authenticator: Arc<Authenticator>,
    pub limiter: Arc<RateLimiter>,
    pub max_poll_count: usize,
    pub max_block: Duration,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(config: &GatewayConfig, queue: Arc<dyn TaskQueue>, registry: Arc<dyn WorkerRegistry>) -> Self {
        Self {
            queue,
            registry,
            authenticator: Arc::new(Authenticator::from_config(config)),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            max_poll_count: config.max_poll_count.max(1),
            max_block: Duration::from_millis(config.max_block_ms),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
        }
    }
}

/// 创建网关路由
pub fn create_routes(state: AppState) -> Router {
    let relay = Router::new()
        .route("/v1/heartbeat", post(heartbeat))
        .route("/v1/tasks/poll", post(poll_tasks))
        .route("/v1/tasks/ack", post(ack_tasks))
        .route("/v1/tasks/reclaim", post(reclaim_tasks))
        .route("/v1/tasks/renew", post(renew_tasks))
        .route("/v1/results", post(publish_result))
        .route("/v1/logs", post(publish_logs))
        .route("/v1/control/poll", post(poll_control))
        .route("/v1/control/ack", post(ack_control))
        .route("/v1/control/reclaim", post(reclaim_control))
        .route("/v1/control/reply", post(reply))
        .route_layer(from_fn_with_state(state.clone(), guard));

    Router::new()
        .route("/health", get(health_check))
        .merge(relay)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
