use chrono::{DateTime, Duration, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::{debug, warn};

use taskfleet_core::models::ScheduleSpec;
use taskfleet_core::{SchedulerError, SchedulerResult};

/// 从未触发过的任务向前回看的窗口
const FIRST_RUN_LOOKBACK_SECONDS: i64 = 60;

/// CRON表达式解析和调度工具
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    /// 最近一个不晚于 `now` 且晚于 `last_fire` 的触发时间
    ///
    /// 从未触发过时只回看一分钟，错过太久的触发点不再补跑。
    pub fn due_fire_time(&self, last_fire: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = match last_fire {
            Some(last) => last,
            None => now - Duration::seconds(FIRST_RUN_LOOKBACK_SECONDS),
        };
        let due = self.schedule.after(&from).take_while(|t| *t <= now).last();
        if let Some(fire) = due {
            debug!(
                "CRON触发: 上次={:?}, 本次={}, 当前时间={}",
                last_fire.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string()),
                fire.format("%Y-%m-%d %H:%M:%S UTC"),
                now.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        due
    }
}

/// 计算某个调度规则在 `now` 时刻应当触发的时间点
///
/// 固定间隔按Unix纪元对齐，因此任何节点在同一时刻算出的触发点都相同，
/// 换主之后不会因为时钟起点不同而重复触发。手动任务永远不会到期。
pub fn due_fire_time(
    schedule: &ScheduleSpec,
    last_fire: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SchedulerResult<Option<DateTime<Utc>>> {
    let due = match schedule {
        ScheduleSpec::Cron { expr } => CronScheduler::new(expr)?.due_fire_time(last_fire, now),
        ScheduleSpec::Interval { seconds } => {
            if *seconds == 0 {
                return Err(SchedulerError::Configuration("调度间隔必须大于0".to_string()));
            }
            let step = *seconds as i64;
            let aligned = now.timestamp().div_euclid(step) * step;
            let fire = Utc.timestamp_opt(aligned, 0).single().ok_or_else(|| {
                SchedulerError::Internal(format!("无法表示的触发时间: {aligned}"))
            })?;
            match last_fire {
                Some(last) if fire <= last => None,
                None if now - fire > Duration::seconds(FIRST_RUN_LOOKBACK_SECONDS) => None,
                _ => Some(fire),
            }
        }
        ScheduleSpec::Manual => None,
    };
    if let (Some(fire), Some(last)) = (due, last_fire) {
        if fire < last {
            warn!("计算出的触发时间 {} 早于上次触发 {}", fire, last);
            return Ok(None);
        }
    }
    Ok(due)
}
