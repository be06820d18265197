//! Worker接入网关
//!
//! 为不能直连broker的Worker转发心跳、任务拉取、结果、日志和控制消息。
//! 网关本身不做任何调度决策。

pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod server;

pub use auth::{AuthError, AuthenticatedWorker, Authenticator};
pub use error::{GatewayError, GatewayResult};
pub use rate_limit::{RateLimitRejection, RateLimitScope, RateLimiter};
pub use routes::{create_routes, AppState};
pub use server::serve;
