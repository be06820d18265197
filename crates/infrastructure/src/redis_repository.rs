//! Redis上的运行实例仓储
//!
//! 多个Dispatcher共用同一份运行实例，Leader切换后新Leader能看到旧Leader
//! 创建的实例。每个实例以JSON保存在 `taskfleet:run:{execution_id}`，
//! 修改走读改写：读出当前值，在本地应用状态机，再由Lua脚本比较并写回。
//! fencing token的检查和写入在同一个脚本里完成，被罢免的Leader无法在
//! 检查与写入之间插入旧写入。

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use taskfleet_core::models::{ResultMessage, TaskRun};
use taskfleet_core::traits::{CreateOutcome, FencingToken, TaskRunRepository};
use taskfleet_core::{ApplyOutcome, SchedulerError, SchedulerResult};

use crate::redis_stream::RedisConnectionManager;
use crate::repository::{is_retry_candidate, plan_create, plan_mark_retried, plan_update};

const RUN_KEY_PREFIX: &str = "taskfleet:run:";
const FENCE_KEY: &str = "taskfleet:runs:fence";
/// 尚未结束的实例ID
const UNFINISHED_SET_KEY: &str = "taskfleet:runs:unfinished";
/// 等待重试判断的实例ID
const RETRY_SET_KEY: &str = "taskfleet:runs:retry";

/// 比较并写回的重试次数上限
const MAX_CAS_ATTEMPTS: usize = 16;

fn run_key(execution_id: &str) -> String {
    format!("{RUN_KEY_PREFIX}{execution_id}")
}

// KEYS: 实例key, fence key, 未结束集合, 重试集合
// ARGV: fencing token（空串表示不检查）, 期望的当前值（空串表示不存在）,
//       新值（空串表示不写）, execution_id, 是否未结束, 是否等待重试
const CAS_SCRIPT: &str = r#"
local presented = ARGV[1]
if presented ~= '' then
  local current = tonumber(redis.call('GET', KEYS[2]) or '0')
  if tonumber(presented) < current then
    return {'fence', tostring(current)}
  end
end
local stored = redis.call('GET', KEYS[1])
if stored == false then
  stored = ''
end
if stored ~= ARGV[2] then
  return {'conflict', stored}
end
if presented ~= '' then
  redis.call('SET', KEYS[2], presented)
end
if ARGV[3] ~= '' then
  redis.call('SET', KEYS[1], ARGV[3])
  if ARGV[5] == '1' then
    redis.call('SADD', KEYS[3], ARGV[4])
  else
    redis.call('SREM', KEYS[3], ARGV[4])
  end
  if ARGV[6] == '1' then
    redis.call('SADD', KEYS[4], ARGV[4])
  else
    redis.call('SREM', KEYS[4], ARGV[4])
  end
end
return {'ok'}
"#;

#[derive(Debug, PartialEq, Eq)]
enum CasReply {
    Written,
    Fenced(u64),
    /// 当前值已被他人修改，携带最新值（空串表示不存在）
    Conflict(String),
}

fn parse_cas_reply(reply: Vec<String>) -> SchedulerResult<CasReply> {
    let mut parts = reply.into_iter();
    match (parts.next().as_deref(), parts.next()) {
        (Some("ok"), _) => Ok(CasReply::Written),
        (Some("fence"), Some(current)) => current
            .parse()
            .map(CasReply::Fenced)
            .map_err(|e| SchedulerError::Serialization(format!("无法解析fencing token {current:?}: {e}"))),
        (Some("conflict"), current) => Ok(CasReply::Conflict(current.unwrap_or_default())),
        (other, _) => Err(SchedulerError::Internal(format!("运行实例脚本返回了未知结果 {other:?}"))),
    }
}

/// 写回时实例在两个索引集合中的归属
fn index_flags(run: &TaskRun) -> (&'static str, &'static str) {
    let flag = |member: bool| if member { "1" } else { "0" };
    (flag(!run.is_finished()), flag(is_retry_candidate(run)))
}

pub struct RedisTaskRunRepository {
    connection_manager: Arc<RedisConnectionManager>,
}

impl RedisTaskRunRepository {
    pub fn new(connection_manager: Arc<RedisConnectionManager>) -> Self {
        Self { connection_manager }
    }

    async fn load_raw(&self, execution_id: &str) -> SchedulerResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(run_key(execution_id));
        self.connection_manager.execute("get_run", &cmd).await
    }

    /// 读改写循环；`change` 可能因并发修改被调用多次
    async fn modify<R, F>(&self, execution_id: &str, fence: Option<FencingToken>, mut change: F) -> SchedulerResult<R>
    where
        R: Send,
        F: FnMut(Option<TaskRun>) -> (Option<TaskRun>, R) + Send,
    {
        let key = run_key(execution_id);
        let presented = fence.map(|f| f.0.to_string()).unwrap_or_default();
        let mut stored = self.load_raw(execution_id).await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = stored.as_deref().map(serde_json::from_str::<TaskRun>).transpose()?;
            let (next, result) = change(current);
            let (raw_next, unfinished, retry) = match &next {
                Some(run) => {
                    let (unfinished, retry) = index_flags(run);
                    (serde_json::to_string(run)?, unfinished, retry)
                }
                None => (String::new(), "0", "0"),
            };

            let mut cmd = redis::cmd("EVAL");
            cmd.arg(CAS_SCRIPT)
                .arg(4)
                .arg(&key)
                .arg(FENCE_KEY)
                .arg(UNFINISHED_SET_KEY)
                .arg(RETRY_SET_KEY)
                .arg(&presented)
                .arg(stored.as_deref().unwrap_or(""))
                .arg(&raw_next)
                .arg(execution_id)
                .arg(unfinished)
                .arg(retry);
            let reply: Vec<String> = self.connection_manager.execute("run_cas", &cmd).await?;
            match parse_cas_reply(reply)? {
                CasReply::Written => return Ok(result),
                CasReply::Fenced(current) => {
                    warn!("拒绝过期的fencing token {} (当前 {})", presented, current);
                    return Err(SchedulerError::StaleFencingToken {
                        presented: fence.map_or(0, |f| f.0),
                        current,
                    });
                }
                CasReply::Conflict(latest) => {
                    debug!("执行实例 {} 被并发修改，重新读取", execution_id);
                    stored = (!latest.is_empty()).then_some(latest);
                }
            }
        }
        Err(SchedulerError::transport(format!(
            "执行实例 {execution_id} 并发修改冲突，{MAX_CAS_ATTEMPTS} 次后放弃"
        )))
    }

    async fn load_indexed(&self, set_key: &str) -> SchedulerResult<Vec<TaskRun>> {
        let mut members = redis::cmd("SMEMBERS");
        members.arg(set_key);
        let ids: Vec<String> = self.connection_manager.execute("list_run_ids", &members).await?;
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut mget = redis::cmd("MGET");
        for id in &ids {
            mget.arg(run_key(id));
        }
        let raws: Vec<Option<String>> = self.connection_manager.execute("load_runs", &mget).await?;
        let mut runs = Vec::with_capacity(raws.len());
        for (id, raw) in ids.iter().zip(raws) {
            match raw.map(|r| serde_json::from_str::<TaskRun>(&r)) {
                Some(Ok(run)) => runs.push(run),
                Some(Err(e)) => warn!("执行实例 {} 的存储内容无法解析: {}", id, e),
                None => debug!("索引 {} 中的执行实例 {} 已不存在", set_key, id),
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }
}

#[async_trait]
impl TaskRunRepository for RedisTaskRunRepository {
    async fn create_run(&self, run: &TaskRun, fence: Option<FencingToken>) -> SchedulerResult<CreateOutcome> {
        self.modify(&run.execution_id, fence, |current| plan_create(current, run))
            .await
    }

    async fn get_run(&self, execution_id: &str) -> SchedulerResult<Option<TaskRun>> {
        match self.load_raw(execution_id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn apply_update(
        &self,
        update: &ResultMessage,
        fence: Option<FencingToken>,
    ) -> SchedulerResult<ApplyOutcome> {
        self.modify(&update.run_id, fence, |current| plan_update(current, update))
            .await?
    }

    async fn list_unfinished(&self, task_id: Option<i64>) -> SchedulerResult<Vec<TaskRun>> {
        let runs = self.load_indexed(UNFINISHED_SET_KEY).await?;
        Ok(runs
            .into_iter()
            .filter(|r| !r.is_finished())
            .filter(|r| task_id.map_or(true, |id| r.task_id == id))
            .collect())
    }

    async fn list_retry_candidates(&self) -> SchedulerResult<Vec<TaskRun>> {
        let runs = self.load_indexed(RETRY_SET_KEY).await?;
        Ok(runs.into_iter().filter(is_retry_candidate).collect())
    }

    async fn mark_retried(
        &self,
        execution_id: &str,
        retry_execution_id: &str,
        fence: Option<FencingToken>,
    ) -> SchedulerResult<bool> {
        self.modify(execution_id, fence, |current| {
            plan_mark_retried(current, execution_id, retry_execution_id)
        })
        .await?
    }
}
