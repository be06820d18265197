//! 进程执行器
//!
//! 把 [`ExecutionPlan`] 作为隔离的子进程运行：清空环境后只放行白名单变量，
//! 可选临时工作目录和包装命令，exec前设置rlimit，运行中监控内存和输出行数，
//! 超时或取消时先向进程组发送SIGTERM，宽限期后SIGKILL。

pub mod artifacts;
pub mod limits;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use taskfleet_core::config::WorkerConfig;
use taskfleet_core::models::{ExecutionPlan, ExecutionResult, ExitReason, LogLine, LogStream, ResourceUsage};

/// 取消信号，可在多个地方克隆持有
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // 发送端由自身持有，不会关闭
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub grace_period: Duration,
    pub artifact_root: Option<PathBuf>,
    pub monitor_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            artifact_root: None,
            monitor_interval: Duration::from_millis(200),
        }
    }
}

impl From<&WorkerConfig> for ExecutorSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            grace_period: Duration::from_secs(config.grace_period_seconds),
            artifact_root: config.artifact_root.as_ref().map(PathBuf::from),
            ..Default::default()
        }
    }
}

/// 读取输出的任务之间共享的计数
struct OutputState {
    stdout_lines: AtomicU64,
    stderr_lines: AtomicU64,
    max_lines: Option<u64>,
    exceeded: AtomicBool,
    limit_hit: Notify,
    last_stderr: Mutex<Option<String>>,
}

impl OutputState {
    fn new(max_lines: Option<u64>) -> Self {
        Self {
            stdout_lines: AtomicU64::new(0),
            stderr_lines: AtomicU64::new(0),
            max_lines,
            exceeded: AtomicBool::new(false),
            limit_hit: Notify::new(),
            last_stderr: Mutex::new(None),
        }
    }

    /// 记录一行输出，返回是否仍可转发
    fn record(&self, stream: LogStream, line: &str) -> bool {
        let counter = match stream {
            LogStream::Stdout => &self.stdout_lines,
            LogStream::Stderr => &self.stderr_lines,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if stream == LogStream::Stderr {
            if let Ok(mut last) = self.last_stderr.lock() {
                *last = Some(line.to_string());
            }
        }
        let total = self.stdout_lines.load(Ordering::Relaxed) + self.stderr_lines.load(Ordering::Relaxed);
        match self.max_lines {
            Some(max) if total > max => {
                if !self.exceeded.swap(true, Ordering::SeqCst) {
                    self.limit_hit.notify_one();
                }
                false
            }
            _ => true,
        }
    }

    fn usage(&self, max_rss_kb: Option<u64>) -> ResourceUsage {
        ResourceUsage {
            max_rss_kb,
            stdout_lines: self.stdout_lines.load(Ordering::Relaxed),
            stderr_lines: self.stderr_lines.load(Ordering::Relaxed),
        }
    }

    fn last_stderr(&self) -> Option<String> {
        self.last_stderr.lock().ok().and_then(|last| last.clone())
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Terminate(ExitReason),
}

pub struct ProcessExecutor {
    settings: ExecutorSettings,
}

impl ProcessExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// 执行计划并返回结果；启动失败同样以结果形式返回
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        log_tx: mpsc::Sender<LogLine>,
        cancel: CancelToken,
    ) -> ExecutionResult {
        let span = info_span!("execute", execution_id = %plan.execution_id, plugin = %plan.plugin);
        let result = self.run(plan, log_tx, cancel).instrument(span).await;

        metrics::counter!("taskfleet_executions_total", "exit_reason" => result.exit_reason.as_str())
            .increment(1);
        metrics::histogram!("taskfleet_execution_duration_seconds").record(result.duration_ms as f64 / 1000.0);
        result
    }

    async fn run(&self, plan: &ExecutionPlan, log_tx: mpsc::Sender<LogLine>, cancel: CancelToken) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let failed = |reason: ExitReason, message: String| ExecutionResult {
            execution_id: plan.execution_id.clone(),
            exit_reason: reason,
            exit_code: None,
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            usage: ResourceUsage::default(),
            artifacts: vec![],
            error_message: Some(message),
        };

        if cancel.is_cancelled() {
            return failed(ExitReason::Cancelled, "执行开始前已被取消".to_string());
        }

        // 临时目录在本函数返回时删除
        let scratch = if plan.sandbox.scratch_dir {
            match tempfile::Builder::new().prefix("taskfleet-").tempdir() {
                Ok(dir) => Some(dir),
                Err(e) => return failed(ExitReason::SpawnFailed, format!("创建临时工作目录失败: {e}")),
            }
        } else {
            None
        };
        let working_dir = match resolve_working_dir(scratch.as_ref().map(|d| d.path()), plan.working_dir.as_deref()) {
            Ok(dir) => dir,
            Err(e) => return failed(ExitReason::SpawnFailed, format!("准备工作目录失败: {e}")),
        };

        let mut command = build_command(plan, working_dir.as_deref());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("启动进程 {} 失败: {e}", plan.command);
                return failed(ExitReason::SpawnFailed, format!("启动进程 {} 失败: {e}", plan.command));
            }
        };
        let pid = child.id();
        info!("进程已启动: pid={pid:?}, command={}", plan.command);

        let output = Arc::new(OutputState::new(plan.limits.max_output_lines));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, LogStream::Stdout, &plan.execution_id, log_tx.clone(), output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, LogStream::Stderr, &plan.execution_id, log_tx, output.clone()));
        }

        let memory_limit_kb = limits::memory_limit_kb(&plan.limits);
        let mut max_rss_kb: Option<u64> = None;
        let deadline = tokio::time::sleep(plan.timeout);
        tokio::pin!(deadline);
        let mut monitor = tokio::time::interval(self.settings.monitor_interval);
        monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                status = child.wait() => break Outcome::Exited(status),
                _ = &mut deadline => break Outcome::Terminate(ExitReason::Timeout),
                _ = cancel.cancelled() => break Outcome::Terminate(ExitReason::Cancelled),
                _ = output.limit_hit.notified() => break Outcome::Terminate(ExitReason::OutputLimitExceeded),
                _ = monitor.tick() => {
                    let Some(rss) = pid.and_then(limits::read_rss_kb) else { continue };
                    max_rss_kb = Some(max_rss_kb.map_or(rss, |m| m.max(rss)));
                    if memory_limit_kb.is_some_and(|limit| rss > limit) {
                        warn!("常驻内存 {rss}KB 超出限制");
                        break Outcome::Terminate(ExitReason::MemoryLimitExceeded);
                    }
                }
            }
        };

        let (status, forced_reason) = match outcome {
            Outcome::Exited(status) => (status, None),
            Outcome::Terminate(reason) => {
                info!("终止进程: {}", reason.as_str());
                (terminate(&mut child, pid, self.settings.grace_period).await, Some(reason))
            }
        };

        // 孙进程可能继承了管道，不无限等待
        for reader in readers {
            if tokio::time::timeout(Duration::from_secs(2), reader).await.is_err() {
                debug!("输出读取任务未能及时结束");
            }
        }

        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        let exit_reason = match forced_reason {
            Some(reason) => reason,
            None if output.exceeded.load(Ordering::SeqCst) => ExitReason::OutputLimitExceeded,
            None => match &status {
                Ok(status) => classify_exit(status, plan),
                Err(_) => ExitReason::Signaled,
            },
        };

        let mut error_message = match &status {
            Err(e) => Some(format!("等待进程结束失败: {e}")),
            Ok(_) => None,
        };
        if exit_reason != ExitReason::Completed && error_message.is_none() {
            let base = exit_reason.default_message(exit_code).unwrap_or_default();
            error_message = Some(match output.last_stderr() {
                Some(tail) if exit_reason == ExitReason::NonZeroExit => format!("{base}: {tail}"),
                _ => base,
            });
        }

        let artifacts = if plan.artifact_patterns.is_empty() {
            vec![]
        } else {
            let dir = working_dir.clone().unwrap_or_else(|| PathBuf::from("."));
            let patterns = plan.artifact_patterns.clone();
            let root = self.settings.artifact_root.clone();
            let execution_id = plan.execution_id.clone();
            tokio::task::spawn_blocking(move || {
                artifacts::collect_artifacts(&dir, &patterns, root.as_deref(), &execution_id)
            })
            .await
            .unwrap_or_else(|e| {
                warn!("产物收集任务失败: {e}");
                vec![]
            })
        };
        drop(scratch);

        let finished_at = Utc::now();
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "执行结束: exit_reason={}, exit_code={exit_code:?}, duration={duration_ms}ms",
            exit_reason.as_str()
        );
        ExecutionResult {
            execution_id: plan.execution_id.clone(),
            exit_reason,
            exit_code,
            started_at,
            finished_at,
            duration_ms,
            usage: output.usage(max_rss_kb),
            artifacts,
            error_message,
        }
    }
}

fn resolve_working_dir(scratch: Option<&Path>, requested: Option<&Path>) -> std::io::Result<Option<PathBuf>> {
    match (scratch, requested) {
        (Some(scratch), Some(dir)) if dir.is_relative() => {
            let dir = scratch.join(dir);
            std::fs::create_dir_all(&dir)?;
            Ok(Some(dir))
        }
        (Some(scratch), _) => Ok(Some(scratch.to_path_buf())),
        (None, dir) => Ok(dir.map(Path::to_path_buf)),
    }
}

fn build_command(plan: &ExecutionPlan, working_dir: Option<&Path>) -> Command {
    let (program, prefix_args) = match plan.sandbox.wrapper.split_first() {
        Some((launcher, rest)) => {
            let mut args = rest.to_vec();
            args.push(plan.command.clone());
            (launcher.clone(), args)
        }
        None => (plan.command.clone(), vec![]),
    };

    let mut command = Command::new(program);
    command
        .args(prefix_args)
        .args(&plan.args)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for key in &plan.sandbox.env_allowlist {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    command.envs(&plan.env);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    #[cfg(unix)]
    {
        command.process_group(0);
        let rlimits = plan.limits.clone();
        // SAFETY: 闭包只调用setrlimit，不分配内存也不加锁
        unsafe {
            command.pre_exec(move || limits::apply_rlimits(&rlimits));
        }
    }
    command
}

fn spawn_reader<R>(
    reader: R,
    stream: LogStream,
    execution_id: &str,
    log_tx: mpsc::Sender<LogLine>,
    output: Arc<OutputState>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let execution_id = execution_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut forwarding = true;
        // 超限后继续读空管道，避免子进程阻塞在写上
        while let Ok(Some(line)) = lines.next_line().await {
            if !forwarding || !output.record(stream, &line) {
                forwarding = false;
                continue;
            }
            let log = LogLine {
                execution_id: execution_id.clone(),
                stream,
                line,
                timestamp: Utc::now(),
            };
            if log_tx.send(log).await.is_err() {
                forwarding = false;
            }
        }
    })
}

fn classify_exit(status: &ExitStatus, plan: &ExecutionPlan) -> ExitReason {
    if status.success() {
        return ExitReason::Completed;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        let sigxcpu = nix::sys::signal::Signal::SIGXCPU as i32;
        if status.signal() == Some(sigxcpu) {
            return ExitReason::CpuLimitExceeded;
        }
        // shell包装时子进程的信号以 128+N 的退出码出现
        if plan.limits.cpu_seconds.is_some() && status.code() == Some(128 + sigxcpu) {
            return ExitReason::CpuLimitExceeded;
        }
        if status.signal().is_some() {
            return ExitReason::Signaled;
        }
    }
    #[cfg(not(unix))]
    let _ = plan;
    ExitReason::NonZeroExit
}

/// SIGTERM整个进程组，宽限期内未退出则SIGKILL
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!("发送SIGTERM失败: {e}");
        }
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                // 组内可能还有残留的子进程
                let _ = killpg(group, Signal::SIGKILL);
                return status;
            }
            Err(_) => {
                warn!("进程在 {grace:?} 宽限期内未退出，发送SIGKILL");
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    debug!("发送SIGKILL失败: {e}");
                }
                return child.wait().await;
            }
        }
    }

    #[cfg(not(unix))]
    let _ = (pid, grace);
    child.start_kill()?;
    child.wait().await
}
