use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::routes::AppState;

/// 请求体上限，日志批次是最大的请求
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// 认证、限流并限制处理时长
///
/// HMAC签名覆盖请求体，所以这里先读出请求体再原样放回。
pub async fn guard(State(state): State<AppState>, request: Request, next: Next) -> GatewayResult<Response> {
    let (mut parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("读取请求体失败: {e}")))?;
    let payload: serde_json::Value = if bytes.is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        serde_json::from_slice(&bytes).map_err(|e| GatewayError::BadRequest(format!("请求体不是合法JSON: {e}")))?
    };

    let worker = state.authenticator.authenticate(&parts.headers, &payload)?;
    state.limiter.check(&worker.worker_id).map_err(GatewayError::RateLimited)?;

    let path = parts.uri.path().to_string();
    debug!("Worker {} 请求 {}", worker.worker_id, path);
    metrics::counter!("taskfleet_gateway_requests_total", "path" => path).increment(1);

    parts.extensions.insert(worker);
    let request = Request::from_parts(parts, Body::from(bytes));
    tokio::time::timeout(state.request_timeout, next.run(request))
        .await
        .map_err(|_| GatewayError::Timeout)
}
