//! Worker认证
//!
//! 每个Worker在网关上登记一份凭据，认证方式由凭据决定，
//! 请求头中的方式不参与选择。

use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use taskfleet_core::config::{AuthMode, GatewayConfig, WorkerCredential};
use taskfleet_core::signing::{
    self, HEADER_API_KEY, HEADER_CERT_SUBJECT, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP, HEADER_WORKER_ID,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("缺少请求头 {0}")]
    MissingHeader(&'static str),

    #[error("未登记的Worker: {0}")]
    UnknownWorker(String),

    #[error("凭据无效")]
    InvalidCredential,

    #[error("时间戳超出允许范围")]
    TimestampOutOfRange,

    #[error("nonce已被使用")]
    NonceReused,

    #[error("签名无效")]
    InvalidSignature,
}

/// 认证通过的Worker，由中间件写入请求扩展
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedWorker {
    pub worker_id: String,
    pub mode: AuthMode,
}

/// 在时间戳容差窗口内记住已见过的nonce
#[derive(Debug, Default)]
struct NonceCache {
    /// (worker_id, nonce) -> 过期时间（unix秒）
    seen: HashMap<(String, String), i64>,
}

impl NonceCache {
    fn check_and_insert(&mut self, worker_id: &str, nonce: &str, now: i64, window: i64) -> bool {
        self.seen.retain(|_, expires_at| *expires_at > now);
        let key = (worker_id.to_string(), nonce.to_string());
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now + window);
        true
    }
}

pub struct Authenticator {
    credentials: HashMap<String, WorkerCredential>,
    tolerance: Duration,
    nonces: Mutex<NonceCache>,
}

impl Authenticator {
    pub fn new(credentials: Vec<WorkerCredential>, tolerance: Duration) -> Self {
        Self {
            credentials: credentials.into_iter().map(|c| (c.worker_id.clone(), c)).collect(),
            tolerance,
            nonces: Mutex::new(NonceCache::default()),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.credentials.clone(),
            Duration::from_secs(config.timestamp_tolerance_seconds),
        )
    }

    /// 校验请求头，HMAC模式下同时校验请求体签名
    pub fn authenticate(&self, headers: &HeaderMap, body: &serde_json::Value) -> Result<AuthenticatedWorker, AuthError> {
        self.authenticate_at(headers, body, chrono::Utc::now().timestamp())
    }

    pub(crate) fn authenticate_at(
        &self,
        headers: &HeaderMap,
        body: &serde_json::Value,
        now: i64,
    ) -> Result<AuthenticatedWorker, AuthError> {
        let worker_id = header(headers, HEADER_WORKER_ID)?;
        let credential = self
            .credentials
            .get(worker_id)
            .ok_or_else(|| AuthError::UnknownWorker(worker_id.to_string()))?;

        match credential.mode {
            AuthMode::ApiKey => {
                let presented = header(headers, HEADER_API_KEY)?;
                let expected = credential.secret.as_deref().ok_or(AuthError::InvalidCredential)?;
                if !signing::secrets_match(expected, presented) {
                    return Err(AuthError::InvalidCredential);
                }
            }
            AuthMode::Hmac => self.verify_hmac(credential, headers, body, now)?,
            AuthMode::Mtls => {
                // 该头由TLS终结方在校验客户端证书后写入
                let subject = header(headers, HEADER_CERT_SUBJECT)?;
                if credential.cert_subject.as_deref() != Some(subject) {
                    return Err(AuthError::InvalidCredential);
                }
            }
        }

        debug!("Worker {} 认证通过 ({:?})", worker_id, credential.mode);
        Ok(AuthenticatedWorker {
            worker_id: worker_id.to_string(),
            mode: credential.mode,
        })
    }

    fn verify_hmac(
        &self,
        credential: &WorkerCredential,
        headers: &HeaderMap,
        body: &serde_json::Value,
        now: i64,
    ) -> Result<(), AuthError> {
        let secret = credential.secret.as_deref().ok_or(AuthError::InvalidCredential)?;
        let timestamp: i64 = header(headers, HEADER_TIMESTAMP)?
            .parse()
            .map_err(|_| AuthError::TimestampOutOfRange)?;
        let nonce = header(headers, HEADER_NONCE)?;
        let signature = header(headers, HEADER_SIGNATURE)?;

        let window = self.tolerance.as_secs() as i64;
        if (now - timestamp).abs() > window {
            warn!("Worker {} 的请求时间戳偏差过大: {}", credential.worker_id, now - timestamp);
            return Err(AuthError::TimestampOutOfRange);
        }
        if !signing::verify(secret, timestamp, nonce, body, signature) {
            return Err(AuthError::InvalidSignature);
        }
        // 签名通过后才记录nonce，伪造请求不能占用合法nonce
        let mut nonces = self.nonces.lock().unwrap_or_else(|e| e.into_inner());
        // 时间戳最晚可以比当前时间晚一个窗口，nonce需要保留两个窗口
        if !nonces.check_and_insert(&credential.worker_id, nonce, now, window * 2) {
            warn!("Worker {} 重放了nonce {}", credential.worker_id, nonce);
            return Err(AuthError::NonceReused);
        }
        Ok(())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, AuthError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::MissingHeader(name))
}
