//! 两条独立轨道的执行状态机
//!
//! 同一个 `execution_id` 的结果消息可能被重复投递或乱序到达，
//! 应用顺序如下：
//! 1. 目标状态与当前状态相同：重复消息，不做任何修改
//! 2. 当前状态已是终态：拒绝
//! 3. 与该轨道最后一次接受的更新同一来源，且上报时间更早：过期消息，不做任何修改
//! 4. 不在合法边集合内：拒绝
//! 5. 其余情况：应用

use chrono::{TimeZone, Utc};

use crate::models::{
    DispatchStatus, ResultMessage, RuntimeStatus, StatusChange, TaskRun, UpdateOrigin,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
    Stale,
    Rejected(String),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::Duplicate => "duplicate",
            ApplyOutcome::Stale => "stale",
            ApplyOutcome::Rejected(_) => "rejected",
        }
    }
}

/// 将一条结果消息应用到运行实例上
pub fn apply_update(run: &mut TaskRun, update: &ResultMessage) -> ApplyOutcome {
    match update.status {
        StatusChange::Dispatch(next) => apply_dispatch(run, next, update),
        StatusChange::Runtime(next) => apply_runtime(run, next, update),
    }
}

fn apply_dispatch(run: &mut TaskRun, next: DispatchStatus, update: &ResultMessage) -> ApplyOutcome {
    let current = run.dispatch_status;
    if current == next {
        return ApplyOutcome::Duplicate;
    }
    if current.is_terminal() {
        return ApplyOutcome::Rejected(format!("派发状态已是终态 {current}，忽略 {next}"));
    }
    if is_stale(update, run.dispatch_reported_by, run.dispatch_reported_at) {
        return ApplyOutcome::Stale;
    }
    if !current.can_transition_to(next) {
        return ApplyOutcome::Rejected(format!("非法的派发状态转换 {current} -> {next}"));
    }

    let at = timestamp(update.reported_at);
    run.dispatch_status = next;
    run.dispatch_reported_at = update.reported_at;
    run.dispatch_reported_by = Some(update.origin);
    if let Some(worker_id) = &update.worker_id {
        run.worker_id = Some(worker_id.clone());
    }
    if let Some(entry_id) = &update.entry_id {
        run.entry_id = Some(entry_id.clone());
    }
    match next {
        DispatchStatus::Dispatched => run.dispatched_at = Some(at),
        DispatchStatus::Acked => run.acked_at = Some(at),
        DispatchStatus::Failed | DispatchStatus::Rejected | DispatchStatus::Timeout => {
            if run.error_message.is_none() {
                run.error_message = Some(
                    update
                        .error_message
                        .clone()
                        .unwrap_or_else(|| format!("派发失败: {next}")),
                );
            }
        }
        _ => {}
    }
    ApplyOutcome::Applied
}

fn apply_runtime(run: &mut TaskRun, next: RuntimeStatus, update: &ResultMessage) -> ApplyOutcome {
    let current = run.runtime_status;
    if current == next {
        return ApplyOutcome::Duplicate;
    }
    if current.is_terminal() {
        return ApplyOutcome::Rejected(format!("运行状态已是终态 {current}，忽略 {next}"));
    }
    if is_stale(update, run.runtime_reported_by, run.runtime_reported_at) {
        return ApplyOutcome::Stale;
    }
    if !current.can_transition_to(next) {
        return ApplyOutcome::Rejected(format!("非法的运行状态转换 {current} -> {next}"));
    }

    let at = timestamp(update.reported_at);
    run.runtime_status = next;
    run.runtime_reported_at = update.reported_at;
    run.runtime_reported_by = Some(update.origin);
    if let Some(worker_id) = &update.worker_id {
        run.worker_id = Some(worker_id.clone());
    }

    if next == RuntimeStatus::Running {
        run.started_at = Some(update.started_at.unwrap_or(at));
        return ApplyOutcome::Applied;
    }

    run.finished_at = Some(update.finished_at.unwrap_or(at));
    if run.started_at.is_none() {
        run.started_at = update.started_at;
    }
    run.exit_code = update.exit_code;
    run.duration_ms = update.duration_ms;
    run.result = update.data.clone();
    run.error_message = match next {
        RuntimeStatus::Success => None,
        _ => Some(
            update
                .error_message
                .clone()
                .unwrap_or_else(|| default_runtime_message(next)),
        ),
    };
    ApplyOutcome::Applied
}

/// Dispatcher和Worker的时钟之间可能有偏差，跨来源的先后交给边集合判断
fn is_stale(update: &ResultMessage, last_origin: Option<UpdateOrigin>, last_at: i64) -> bool {
    last_origin == Some(update.origin) && update.reported_at < last_at
}

fn default_runtime_message(status: RuntimeStatus) -> String {
    match status {
        RuntimeStatus::Timeout => "执行超时".to_string(),
        RuntimeStatus::Cancelled => "执行被取消".to_string(),
        RuntimeStatus::Skipped => "执行被跳过".to_string(),
        _ => "执行失败".to_string(),
    }
}

fn timestamp(millis: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}
