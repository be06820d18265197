//! 子进程资源限制
//!
//! CPU时间、地址空间和文件描述符通过rlimit在exec之前设置；
//! 内存另外通过 `/proc/{pid}/status` 的VmRSS主动监控。

use taskfleet_core::models::ResourceLimits;

/// 在子进程中、exec之前调用，只能使用async-signal-safe的操作
#[cfg(unix)]
pub fn apply_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    if let Some(cpu) = limits.cpu_seconds {
        // 软限制触发SIGXCPU，硬限制再留一秒
        setrlimit(Resource::RLIMIT_CPU, cpu, cpu.saturating_add(1))?;
    }
    if let Some(mb) = limits.memory_mb {
        let bytes = mb.saturating_mul(1024 * 1024);
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(files) = limits.max_open_files {
        setrlimit(Resource::RLIMIT_NOFILE, files, files)?;
    }
    Ok(())
}

/// 读取进程当前的常驻内存（KB），进程已退出或平台不支持时返回 `None`
pub fn read_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

pub fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// 内存上限换算为KB
pub fn memory_limit_kb(limits: &ResourceLimits) -> Option<u64> {
    limits.memory_mb.map(|mb| mb.saturating_mul(1024))
}
