use futures_util::stream::{self, Stream};
use regex::{Regex, RegexBuilder};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::command::LaunchCommand;
use crate::config::{MonitorSettings, TuningSettings};
use crate::error::{Result, TuneError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ready,
    OutOfMemory,
}

/// Ordered `(pattern, signal)` pairs; the first matching pattern decides.
pub struct SignatureTable {
    entries: Vec<(Regex, Signal)>,
    oom_exit_codes: Vec<i32>,
}

impl SignatureTable {
    pub fn new(entries: Vec<(Regex, Signal)>, oom_exit_codes: Vec<i32>) -> Self {
        Self { entries, oom_exit_codes }
    }

    /// OOM signatures are checked before readiness ones.
    pub fn from_settings(settings: &MonitorSettings) -> Result<Self> {
        let compile = |pattern: &String| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| TuneError::Config(format!("bad monitor pattern '{}': {}", pattern, e)))
        };
        let mut entries = Vec::new();
        for p in &settings.oom_patterns {
            entries.push((compile(p)?, Signal::OutOfMemory));
        }
        for p in &settings.success_patterns {
            entries.push((compile(p)?, Signal::Ready));
        }
        Ok(Self::new(entries, settings.oom_exit_codes.clone()))
    }

    pub fn classify(&self, line: &str) -> Option<Signal> {
        self.entries
            .iter()
            .find(|(re, _)| re.is_match(line))
            .map(|(_, signal)| *signal)
    }

    pub fn is_oom_exit(&self, code: i32) -> bool {
        self.oom_exit_codes.contains(&code)
    }
}

/// Cooperative cancellation shared between the front end and the monitor.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Success,
    Oom { reason: String },
    Crash { exit_code: Option<i32>, tail: Vec<String> },
    UserStopped,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub treat_timeout_as_oom: bool,
    pub tail_lines: usize,
}

impl WatchOptions {
    pub fn from_settings(monitor: &MonitorSettings, tuning: &TuningSettings) -> Self {
        Self {
            timeout: Duration::from_secs(tuning.loading_timeout_secs),
            poll_interval: Duration::from_millis(monitor.poll_interval_ms),
            treat_timeout_as_oom: tuning.treat_timeout_as_oom,
            tail_lines: monitor.tail_lines,
        }
    }
}

enum Event {
    Line(Option<String>),
    Exited(std::io::Result<ExitStatus>),
    Tick,
}

/// A running inference process with its merged stdout/stderr.
pub struct LaunchHandle {
    child: Child,
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<String>,
    output_open: bool,
    stopped: bool,
    grace: Duration,
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            // Servers print non-UTF-8 model names and progress bytes.
            let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Spawn the process and start pumping its output.
pub fn start(command: &LaunchCommand, grace: Duration) -> Result<LaunchHandle> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    }

    let mut child = cmd.spawn().map_err(|source| TuneError::Spawn {
        program: command.program.clone(),
        source,
    })?;
    let pid = child.id();
    log::info!("[monitor] started {} (pid {:?})", command.program, pid);

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(out) = child.stdout.take() {
        forward_lines(out, tx.clone());
    }
    if let Some(err) = child.stderr.take() {
        forward_lines(err, tx);
    }

    Ok(LaunchHandle {
        child,
        pid,
        lines: rx,
        output_open: true,
        stopped: false,
        grace,
    })
}

impl LaunchHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next merged output line; `None` once both streams are closed.
    pub async fn next_line(&mut self) -> Option<String> {
        if !self.output_open {
            return None;
        }
        let line = self.lines.recv().await;
        if line.is_none() {
            self.output_open = false;
        }
        line
    }

    /// Remaining output as a lazy stream that ends at process exit.
    pub fn stream(&mut self) -> impl Stream<Item = String> + '_ {
        stream::unfold(self, |handle| async move {
            let line = handle.next_line().await?;
            Some((line, handle))
        })
    }

    /// Follow the process until it classifies, exits, times out or is stopped.
    pub async fn watch<F>(
        &mut self,
        table: &SignatureTable,
        stop: &StopFlag,
        opts: &WatchOptions,
        mut on_line: F,
    ) -> LaunchOutcome
    where
        F: FnMut(&str),
    {
        let deadline = Instant::now() + opts.timeout;
        let mut tick = tokio::time::interval(opts.poll_interval);
        let mut tail: VecDeque<String> = VecDeque::with_capacity(opts.tail_lines);

        loop {
            if stop.is_requested() {
                log::info!("[monitor] stop requested");
                self.stop().await;
                return LaunchOutcome::UserStopped;
            }
            if Instant::now() >= deadline {
                log::warn!("[monitor] no ready signal within {:?}", opts.timeout);
                self.stop().await;
                return if opts.treat_timeout_as_oom {
                    LaunchOutcome::Oom {
                        reason: format!("timed out after {}s without a ready signal", opts.timeout.as_secs()),
                    }
                } else {
                    LaunchOutcome::Crash {
                        exit_code: None,
                        tail: tail.into_iter().collect(),
                    }
                };
            }

            let output_open = self.output_open;
            let event = tokio::select! {
                line = self.lines.recv(), if output_open => Event::Line(line),
                status = self.child.wait(), if !output_open => Event::Exited(status),
                _ = tick.tick() => Event::Tick,
            };

            match event {
                Event::Tick => {}
                Event::Line(None) => self.output_open = false,
                Event::Line(Some(line)) => {
                    on_line(&line);
                    let signal = table.classify(&line);
                    if tail.len() == opts.tail_lines {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                    match signal {
                        Some(Signal::Ready) => {
                            log::info!("[monitor] ready");
                            return LaunchOutcome::Success;
                        }
                        Some(Signal::OutOfMemory) => {
                            let reason = tail.back().cloned().unwrap_or_default();
                            log::warn!("[monitor] out of memory: {}", reason);
                            self.stop().await;
                            return LaunchOutcome::Oom { reason };
                        }
                        None => {}
                    }
                }
                Event::Exited(status) => {
                    self.stopped = true;
                    let code = status.ok().and_then(|s| s.code());
                    if let Some(code) = code.filter(|c| table.is_oom_exit(*c)) {
                        log::warn!("[monitor] exited with OOM code {}", code);
                        return LaunchOutcome::Oom {
                            reason: format!("exit code {}", code),
                        };
                    }
                    log::warn!("[monitor] exited before ready (code {:?})", code);
                    return LaunchOutcome::Crash {
                        exit_code: code,
                        tail: tail.into_iter().collect(),
                    };
                }
            }
        }
    }

    /// Drain output after a successful start until the process exits or a
    /// stop is requested. Returns the exit code when the process ended itself.
    pub async fn follow<F>(&mut self, stop: &StopFlag, poll_interval: Duration, mut on_line: F) -> Option<i32>
    where
        F: FnMut(&str),
    {
        let mut tick = tokio::time::interval(poll_interval);
        loop {
            if stop.is_requested() {
                self.stop().await;
                return None;
            }
            let output_open = self.output_open;
            let event = tokio::select! {
                line = self.lines.recv(), if output_open => Event::Line(line),
                status = self.child.wait(), if !output_open => Event::Exited(status),
                _ = tick.tick() => Event::Tick,
            };
            match event {
                Event::Tick => {}
                Event::Line(Some(line)) => on_line(&line),
                Event::Line(None) => self.output_open = false,
                Event::Exited(status) => {
                    self.stopped = true;
                    return status.ok().and_then(|s| s.code());
                }
            }
        }
    }

    /// Graceful terminate, then kill after the grace period. Safe to call
    /// repeatedly and after the process already exited.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        if let Some(pid) = self.pid {
            #[cfg(target_os = "windows")]
            let graceful = Command::new("taskkill")
                .args(["/T", "/PID", &pid.to_string()])
                .creation_flags(0x08000000)
                .output()
                .await;
            #[cfg(not(target_os = "windows"))]
            let graceful = Command::new("kill").args(["-TERM", &pid.to_string()]).output().await;
            if let Err(e) = graceful {
                log::debug!("[monitor] graceful stop failed: {}", e);
            }
        }

        if tokio::time::timeout(self.grace, self.child.wait()).await.is_err() {
            log::warn!("[monitor] pid {:?} ignored terminate, killing", self.pid);
            #[cfg(target_os = "windows")]
            {
                if let Some(pid) = self.pid {
                    let _ = Command::new("taskkill")
                        .args(["/F", "/T", "/PID", &pid.to_string()])
                        .creation_flags(0x08000000)
                        .output()
                        .await;
                }
            }
            if let Err(e) = self.child.kill().await {
                log::debug!("[monitor] kill failed: {}", e);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn sh(script: &str) -> LaunchCommand {
        LaunchCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn table() -> SignatureTable {
        SignatureTable::from_settings(&MonitorSettings::default()).unwrap()
    }

    fn opts(timeout_ms: u64, treat_timeout_as_oom: bool) -> WatchOptions {
        WatchOptions {
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(20),
            treat_timeout_as_oom,
            tail_lines: 40,
        }
    }

    async fn run(script: &str, stop: &StopFlag, o: WatchOptions) -> (LaunchOutcome, Vec<String>) {
        let mut handle = start(&sh(script), Duration::from_secs(2)).unwrap();
        let mut seen = Vec::new();
        let outcome = handle.watch(&table(), stop, &o, |l| seen.push(l.to_string())).await;
        handle.stop().await;
        (outcome, seen)
    }

    // ── Classification ──

    #[test]
    fn test_table_order_and_case() {
        let t = table();
        assert_eq!(t.classify("CUDA OUT OF MEMORY while loading"), Some(Signal::OutOfMemory));
        assert_eq!(t.classify("Starting Kobold API on port 5001"), Some(Signal::Ready));
        assert_eq!(t.classify("loading tensors"), None);
        assert!(t.is_oom_exit(2));
        assert!(!t.is_oom_exit(1));
    }

    #[tokio::test]
    async fn test_ready_line_is_success() {
        let (outcome, seen) = run(
            "echo loading; echo 'Starting Kobold API on port 5001'; sleep 5",
            &StopFlag::new(),
            opts(5000, true),
        )
        .await;
        assert_eq!(outcome, LaunchOutcome::Success);
        assert_eq!(seen.last().map(String::as_str), Some("Starting Kobold API on port 5001"));
    }

    #[tokio::test]
    async fn test_stderr_oom_line_is_oom() {
        let (outcome, _) = run("echo 'CUDA out of memory' >&2; sleep 5", &StopFlag::new(), opts(5000, true)).await;
        assert!(matches!(outcome, LaunchOutcome::Oom { ref reason } if reason.contains("out of memory")));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_crash() {
        let (outcome, _) = run("echo boom; exit 3", &StopFlag::new(), opts(5000, true)).await;
        assert_eq!(
            outcome,
            LaunchOutcome::Crash {
                exit_code: Some(3),
                tail: vec!["boom".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_oom_exit_code() {
        let (outcome, _) = run("exit 2", &StopFlag::new(), opts(5000, true)).await;
        assert!(matches!(outcome, LaunchOutcome::Oom { .. }));
    }

    #[tokio::test]
    async fn test_clean_exit_before_ready_is_crash() {
        let (outcome, _) = run("echo done", &StopFlag::new(), opts(5000, true)).await;
        assert!(matches!(outcome, LaunchOutcome::Crash { exit_code: Some(0), .. }));
    }

    #[tokio::test]
    async fn test_stop_flag_is_user_stopped() {
        let stop = StopFlag::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.request();
        });
        let started = std::time::Instant::now();
        let (outcome, _) = run("sleep 30", &stop, opts(20_000, true)).await;
        assert_eq!(outcome, LaunchOutcome::UserStopped);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_ignored_terminate_is_killed_after_grace() {
        let script = "trap '' TERM; echo up; while true; do sleep 0.1; done";
        let mut handle = start(&sh(script), Duration::from_millis(300)).unwrap();
        assert!(handle.pid().is_some());

        let stop = StopFlag::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.request();
        });
        let started = std::time::Instant::now();
        let outcome = handle.watch(&table(), &stop, &opts(20_000, true), |_| {}).await;
        assert_eq!(outcome, LaunchOutcome::UserStopped);

        handle.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(handle.child.try_wait(), Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_output() {
        let (outcome, seen) = run(
            "printf 'model caf\\351 loaded\\r\\n'; echo 'Starting Kobold API on port 5001'; sleep 5",
            &StopFlag::new(),
            opts(5000, true),
        )
        .await;
        assert_eq!(outcome, LaunchOutcome::Success);
        assert_eq!(seen[0], "model caf\u{FFFD} loaded");
        assert_eq!(seen.last().map(String::as_str), Some("Starting Kobold API on port 5001"));
    }

    #[tokio::test]
    async fn test_timeout_classification() {
        let (outcome, _) = run("sleep 30", &StopFlag::new(), opts(200, true)).await;
        assert!(matches!(outcome, LaunchOutcome::Oom { .. }));
        let (outcome, _) = run("sleep 30", &StopFlag::new(), opts(200, false)).await;
        assert!(matches!(outcome, LaunchOutcome::Crash { exit_code: None, .. }));
    }

    // ── Handle ──

    #[tokio::test]
    async fn test_stream_ends_at_exit() {
        let mut handle = start(&sh("printf 'a\\nb\\n'"), Duration::from_secs(1)).unwrap();
        let lines: Vec<String> = handle.stream().collect().await;
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
        handle.stop().await;
        handle.stop().await;
        assert!(handle.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let cmd = LaunchCommand {
            program: "/definitely/not/here".to_string(),
            args: vec![],
        };
        assert!(matches!(start(&cmd, Duration::from_secs(1)), Err(TuneError::Spawn { .. })));
    }
}
