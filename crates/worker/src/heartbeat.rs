//! 心跳内容：主机资源采样和能力表

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::debug;

use taskfleet_core::models::{HeartbeatMessage, ResourceLimits, TransportMode, WorkerStatus};

/// 一次资源采样，百分比取值0-100
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// CPU使用率需要两次采样之间的差值
#[derive(Debug, Default)]
pub struct SystemSampler {
    last_cpu: Option<(u64, u64)>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self) -> SystemSample {
        let cpu_percent = std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|stat| parse_proc_stat(&stat))
            .map(|current| {
                let percent = self
                    .last_cpu
                    .map_or(0.0, |previous| cpu_percent_between(previous, current));
                self.last_cpu = Some(current);
                percent
            })
            .unwrap_or(0.0);
        let memory_percent = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|info| parse_meminfo(&info))
            .unwrap_or(0.0);
        SystemSample {
            cpu_percent,
            memory_percent,
            disk_percent: disk_percent("/").unwrap_or(0.0),
        }
    }
}

/// 返回 (空闲, 总计) jiffies
pub fn parse_proc_stat(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((idle, values.iter().sum()))
}

fn cpu_percent_between(previous: (u64, u64), current: (u64, u64)) -> f64 {
    let total = current.1.saturating_sub(previous.1);
    if total == 0 {
        return 0.0;
    }
    let idle = current.0.saturating_sub(previous.0);
    (total.saturating_sub(idle) as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

pub fn parse_meminfo(info: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        info.lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|v| v.parse().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

fn disk_percent(path: &str) -> Option<f64> {
    #[cfg(unix)]
    {
        let stat = nix::sys::statvfs::statvfs(path).ok()?;
        let total = stat.blocks() as f64;
        if total == 0.0 {
            return None;
        }
        let free = stat.blocks_available() as f64;
        Some(((total - free) / total * 100.0).clamp(0.0, 100.0))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

/// `gpu=a100` 解析为字符串能力，`browser` 解析为 `true`
pub fn parse_capabilities(entries: &[String]) -> BTreeMap<String, serde_json::Value> {
    entries
        .iter()
        .filter(|e| !e.trim().is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, value)) => (name.trim().to_string(), serde_json::Value::String(value.trim().to_string())),
            None => (entry.trim().to_string(), serde_json::Value::Bool(true)),
        })
        .collect()
}

/// Worker身份中不随心跳变化的部分
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub boot_id: String,
    pub hostname: String,
    pub transport: TransportMode,
    pub capabilities: BTreeMap<String, serde_json::Value>,
    pub resource_limits: ResourceLimits,
}

impl WorkerIdentity {
    pub fn heartbeat(
        &self,
        status: WorkerStatus,
        sample: SystemSample,
        running_tasks: usize,
        max_concurrency: usize,
    ) -> HeartbeatMessage {
        debug!(
            "心跳: status={status:?}, running={running_tasks}, cpu={:.1}%",
            sample.cpu_percent
        );
        HeartbeatMessage {
            worker_id: self.worker_id.clone(),
            boot_id: self.boot_id.clone(),
            hostname: self.hostname.clone(),
            status,
            transport: self.transport,
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            disk_percent: sample.disk_percent,
            running_tasks: running_tasks as u32,
            max_concurrency: max_concurrency as u32,
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            capabilities: self.capabilities.clone(),
            resource_limits: self.resource_limits.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent_from_deltas() {
        let first = parse_proc_stat("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        assert_eq!(first, (800, 1000));
        let second = parse_proc_stat("cpu  200 0 200 1400 200 0 0 0 0 0\n").unwrap();
        assert!((cpu_percent_between(first, second) - 20.0).abs() < 1e-9);
        assert_eq!(cpu_percent_between(second, second), 0.0);
    }

    #[test]
    fn test_meminfo() {
        let info = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert!((parse_meminfo(info).unwrap() - 75.0).abs() < 1e-9);
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_capabilities() {
        let caps = parse_capabilities(&["browser".to_string(), "gpu = a100".to_string(), " ".to_string()]);
        assert_eq!(caps.len(), 2);
        assert_eq!(caps["browser"], serde_json::Value::Bool(true));
        assert_eq!(caps["gpu"], serde_json::json!("a100"));
    }

    #[test]
    fn test_sample_in_range() {
        let mut sampler = SystemSampler::new();
        let sample = sampler.sample();
        for value in [sample.cpu_percent, sample.memory_percent, sample.disk_percent] {
            assert!((0.0..=100.0).contains(&value));
        }
    }
}
