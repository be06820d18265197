use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use taskfleet_core::SchedulerError;

use crate::auth::AuthError;
use crate::rate_limit::RateLimitRejection;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("认证失败: {0}")]
    Authentication(#[from] AuthError),

    #[error("禁止访问: {0}")]
    Forbidden(String),

    #[error("请求过于频繁，{}秒后重试", .0.retry_after_seconds)]
    RateLimited(RateLimitRejection),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("请求超时")]
    Timeout,

    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Scheduler(SchedulerError::Transport(_)) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Scheduler(SchedulerError::Serialization(_)) => StatusCode::BAD_REQUEST,
            GatewayError::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "AUTHENTICATION_ERROR",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::RateLimited(_) => "RATE_LIMITED",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::Timeout => "TIMEOUT",
            GatewayError::Scheduler(SchedulerError::Transport(_)) => "BROKER_UNAVAILABLE",
            GatewayError::Scheduler(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        metrics::counter!("taskfleet_gateway_rejections_total", "type" => self.error_type()).increment(1);

        if let GatewayError::RateLimited(rejection) = &self {
            let body = Json(json!({
                "error": self.to_string(),
                "retry_after_seconds": rejection.retry_after_seconds,
                "remaining": rejection.remaining,
                "limit": rejection.limit,
                "scope": rejection.scope,
            }));
            let mut response = (status, body).into_response();
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(rejection.retry_after_seconds));
            return response;
        }

        // 内部错误的细节只写日志
        let message = match &self {
            GatewayError::Scheduler(e) if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!("网关处理请求失败: {e}");
                "系统内部错误".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));
        (status, body).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
