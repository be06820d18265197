use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use taskfleet_core::config::{AuthMode, WorkerAuthConfig};
use taskfleet_core::models::{
    AckRequest, ControlAckRequest, ControlReplyRequest, CountResponse, EntriesResponse, HeartbeatMessage,
    HeartbeatRequest, LogChunk, PollRequest, QueueEntry, ReclaimRequest, RenewRequest, ResultMessage, RuntimeReply,
};
use taskfleet_core::signing::{
    self, HEADER_API_KEY, HEADER_CERT_SUBJECT, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP, HEADER_WORKER_ID,
};
use taskfleet_core::{SchedulerError, SchedulerResult};

use super::WorkerChannel;

/// 阻塞拉取时在服务端等待之外留给网络的余量
const POLL_SLACK: Duration = Duration::from_secs(10);

/// 经由网关访问broker
pub struct GatewayChannel {
    client: reqwest::Client,
    base_url: String,
    worker_id: String,
    boot_id: String,
    auth: WorkerAuthConfig,
}

impl GatewayChannel {
    pub fn new(
        base_url: impl Into<String>,
        worker_id: &str,
        boot_id: &str,
        auth: WorkerAuthConfig,
    ) -> SchedulerResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            worker_id: worker_id.to_string(),
            boot_id: boot_id.to_string(),
            auth,
        })
    }

    fn auth_headers(&self, body: &serde_json::Value) -> SchedulerResult<Vec<(&'static str, String)>> {
        let mut headers = vec![(HEADER_WORKER_ID, self.worker_id.clone())];
        match self.auth.mode {
            AuthMode::ApiKey => {
                let key = self
                    .auth
                    .api_key
                    .clone()
                    .ok_or_else(|| SchedulerError::Configuration("未配置api_key".to_string()))?;
                headers.push((HEADER_API_KEY, key));
            }
            AuthMode::Hmac => {
                let secret = self
                    .auth
                    .hmac_secret
                    .as_deref()
                    .ok_or_else(|| SchedulerError::Configuration("未配置hmac_secret".to_string()))?;
                let timestamp = chrono::Utc::now().timestamp();
                let nonce = uuid::Uuid::new_v4().simple().to_string();
                let signature = signing::sign(secret, timestamp, &nonce, body)?;
                headers.push((HEADER_TIMESTAMP, timestamp.to_string()));
                headers.push((HEADER_NONCE, nonce));
                headers.push((HEADER_SIGNATURE, signature));
            }
            AuthMode::Mtls => {
                // 真正的证书校验由TLS终结方完成，这里只在开发环境下透传主题
                if let Some(subject) = &self.auth.cert_subject {
                    headers.push((HEADER_CERT_SUBJECT, subject.clone()));
                }
            }
        }
        Ok(headers)
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req, timeout: Option<Duration>) -> SchedulerResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_value(request)?;
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.post(&url).json(&body);
        for (name, value) in self.auth_headers(&body)? {
            builder = builder.header(name, value);
        }
        builder = builder.timeout(timeout.unwrap_or(Duration::from_secs(30)));

        let response = builder
            .send()
            .await
            .map_err(|e| SchedulerError::transport(format!("请求网关 {path} 失败: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| SchedulerError::Serialization(format!("解析网关响应失败: {e}")));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();
        debug!("网关返回 {status}: {text}");
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SchedulerError::Unauthorized(text),
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("请求 {path} 被网关限流");
                SchedulerError::RateLimited {
                    retry_after_seconds: retry_after.unwrap_or(1),
                }
            }
            s if s.is_server_error() => SchedulerError::transport(format!("网关错误 {s}: {text}")),
            s => SchedulerError::Internal(format!("网关拒绝请求 {s}: {text}")),
        })
    }
}

#[async_trait]
impl WorkerChannel for GatewayChannel {
    async fn heartbeat(&self, heartbeat: &HeartbeatMessage, ttl: Duration) -> SchedulerResult<()> {
        let request = HeartbeatRequest {
            heartbeat: heartbeat.clone(),
            ttl_seconds: ttl.as_secs().max(1),
        };
        let _: serde_json::Value = self.post("/v1/heartbeat", &request, None).await?;
        Ok(())
    }

    async fn poll_tasks(&self, count: usize, block: Option<Duration>) -> SchedulerResult<Vec<QueueEntry>> {
        let request = PollRequest {
            boot_id: self.boot_id.clone(),
            count,
            block_ms: block.map(|b| b.as_millis() as u64),
        };
        let timeout = block.map(|b| b + POLL_SLACK);
        let response: EntriesResponse = self.post("/v1/tasks/poll", &request, timeout).await?;
        Ok(response.entries)
    }

    async fn ack_tasks(&self, entry_ids: &[String]) -> SchedulerResult<usize> {
        let request = AckRequest {
            entry_ids: entry_ids.to_vec(),
        };
        let response: CountResponse = self.post("/v1/tasks/ack", &request, None).await?;
        Ok(response.count)
    }

    async fn reclaim_tasks(&self, min_idle: Duration, count: usize) -> SchedulerResult<Vec<QueueEntry>> {
        let request = ReclaimRequest {
            boot_id: self.boot_id.clone(),
            min_idle_ms: min_idle.as_millis() as u64,
            count,
        };
        let response: EntriesResponse = self.post("/v1/tasks/reclaim", &request, None).await?;
        Ok(response.entries)
    }

    async fn renew_tasks(&self, entry_ids: &[String]) -> SchedulerResult<usize> {
        let request = RenewRequest {
            boot_id: self.boot_id.clone(),
            entry_ids: entry_ids.to_vec(),
        };
        let response: CountResponse = self.post("/v1/tasks/renew", &request, None).await?;
        Ok(response.count)
    }

    async fn publish_result(&self, result: &ResultMessage) -> SchedulerResult<()> {
        let _: serde_json::Value = self.post("/v1/results", result, None).await?;
        Ok(())
    }

    async fn publish_logs(&self, chunk: &LogChunk) -> SchedulerResult<()> {
        let _: serde_json::Value = self.post("/v1/logs", chunk, None).await?;
        Ok(())
    }

    async fn poll_control(&self, count: usize, block: Option<Duration>) -> SchedulerResult<Vec<QueueEntry>> {
        let request = PollRequest {
            boot_id: self.boot_id.clone(),
            count,
            block_ms: block.map(|b| b.as_millis() as u64),
        };
        let timeout = block.map(|b| b + POLL_SLACK);
        let response: EntriesResponse = self.post("/v1/control/poll", &request, timeout).await?;
        Ok(response.entries)
    }

    async fn ack_control(&self, partition: &str, entry_ids: &[String]) -> SchedulerResult<usize> {
        let request = ControlAckRequest {
            partition: partition.to_string(),
            entry_ids: entry_ids.to_vec(),
        };
        let response: CountResponse = self.post("/v1/control/ack", &request, None).await?;
        Ok(response.count)
    }

    async fn reclaim_control(&self, min_idle: Duration, count: usize) -> SchedulerResult<Vec<QueueEntry>> {
        let request = ReclaimRequest {
            boot_id: self.boot_id.clone(),
            min_idle_ms: min_idle.as_millis() as u64,
            count,
        };
        let response: EntriesResponse = self.post("/v1/control/reclaim", &request, None).await?;
        Ok(response.entries)
    }

    async fn reply(&self, reply_stream: &str, reply: &RuntimeReply) -> SchedulerResult<()> {
        let request = ControlReplyRequest {
            reply_stream: reply_stream.to_string(),
            reply: reply.clone(),
        };
        let _: serde_json::Value = self.post("/v1/control/reply", &request, None).await?;
        Ok(())
    }
}
