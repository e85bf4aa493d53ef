use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::logs::{TargetLog, sanitize_line, tail};

pub mod pool;

pub use pool::{PoolReport, TargetOutcome, run_pool};

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskSpawned {
        id: String,
    },
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Line-oriented terminal output plus an end-of-run summary.
pub struct StdoutSink {
    show_logs: bool,
    state: Mutex<StdoutState>,
}

#[derive(Default)]
struct StdoutState {
    started_at: Option<Instant>,
    started: usize,
    ok: usize,
    failed: Vec<String>,
    busy_ms: u128,
}

impl StdoutSink {
    pub fn new(show_logs: bool) -> Self {
        Self {
            show_logs,
            state: Mutex::new(StdoutState::default()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskSpawned { .. } => {}
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started += 1;
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if self.show_logs {
                    println!("[{id}] {line}");
                }
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    s.busy_ms += elapsed_ms;
                    if ok {
                        s.ok += 1;
                    } else {
                        s.failed.push(id.clone());
                    }
                }
                if ok {
                    println!("DONE: {id} ({})", format_elapsed_hms((elapsed_ms / 1000) as u64));
                } else {
                    // The full diagnostic is printed once by the caller.
                    let first = error.as_deref().and_then(|e| e.lines().next()).unwrap_or("");
                    println!("FAIL: {id} {first}");
                }
            }
            ExecEvent::ExecutorDone { ok, .. } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  targets: started={} ok={} failed={}",
                    s.started,
                    s.ok,
                    s.failed.len()
                );
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                println!(
                    "  summed_target_time: {}",
                    format_elapsed_hms((s.busy_ms / 1000) as u64)
                );
                if !s.failed.is_empty() {
                    s.failed.sort();
                    println!("  failed_targets: {}", s.failed.join(", "));
                }
                *s = StdoutState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Discards everything; used when a caller only wants the returned report.
pub struct NullSink;

impl ExecSink for NullSink {
    fn emit(&self, _ev: ExecEvent) {}
}

#[derive(Default)]
struct SharedExecState {
    // Process group ids of running children, so cancellation can reach them.
    child_pgroups: Mutex<BTreeMap<u32, String>>,
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    deadline: Option<(Instant, Duration)>,
    log: Option<TargetLog>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            current_task_id: None,
            deadline: None,
            log: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    /// Every command run through this context shares one budget of `timeout`.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some((Instant::now() + timeout, timeout));
    }

    pub fn set_log(&mut self, log: TargetLog) {
        self.log = Some(log);
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log.as_ref().map(|l| l.path().to_path_buf())
    }

    pub fn log(&self, msg: &str) {
        if let Some(raw) = &self.log {
            raw.append(msg);
        }
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: sanitize_line(msg),
        });
    }

    pub fn kill_running_children(&self) {
        let pgids: Vec<u32> = self
            .shared
            .child_pgroups
            .lock()
            .ok()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default();
        for pgid in pgids {
            kill_pgroup(pgid, true);
        }
    }

    fn register_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            let owner = self
                .current_task_id
                .clone()
                .unwrap_or_else(|| "<none>".into());
            g.insert(pgid, owner);
        }
    }

    fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.remove(&pgid);
        }
    }

    /// Run `cmd` to completion, streaming output to the raw log and the sink.
    ///
    /// Non-zero exit is a `Build` error and an expired target budget is a
    /// `Timeout` error; in both cases the diagnostic points at the raw log.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        let program = describe(&cmd);
        if self.cancelled() {
            return Err(Error::msg("cancelled"));
        }
        if self.dry_run {
            self.log(&format!("DRY-RUN: {program}"));
            return Ok(());
        }
        if let Some(raw) = &self.log {
            raw.banner(&program);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn {program}: {e}")))?;
        let pgid = child.id();
        self.register_child_pgroup(pgid);

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut timed_out = false;
        loop {
            let line = match self.deadline {
                Some((at, _)) => {
                    let left = at.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        timed_out = true;
                        break;
                    }
                    match rx.recv_timeout(left) {
                        Ok(line) => line,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            timed_out = true;
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(line) => line,
                    Err(_) => break,
                },
            };
            if !line.trim().is_empty() {
                self.log(&line);
            }
            if self.cancelled() {
                terminate(&mut child, pgid);
                break;
            }
        }

        // Output closed, but the process may still be running.
        if let Some((at, _)) = self.deadline
            && !timed_out
        {
            while matches!(child.try_wait(), Ok(None)) {
                if Instant::now() >= at {
                    timed_out = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        if timed_out {
            terminate(&mut child, pgid);
        }
        let status = wait_child(&mut child, &program);
        self.unregister_child_pgroup(pgid);

        if timed_out {
            return Err(self.timeout_error(&program));
        }
        if self.cancelled() {
            return Err(Error::msg("cancelled"));
        }
        let status = status?;
        if !status.success() {
            return Err(self.failure_error(&program, status));
        }
        Ok(())
    }

    fn log_detail(&self) -> String {
        self.log_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<no log>".into())
    }

    fn timeout_error(&self, program: &str) -> Error {
        let budget = self.deadline.map(|(_, d)| d.as_secs()).unwrap_or_default();
        let target = self.current_task_id.clone().unwrap_or_default();
        Error::Timeout(
            Diagnostic::new(Gate::Build, format!("target '{target}' exceeded its {budget}s timeout"))
                .check(Check::pass("command started").with_detail(program.to_string()))
                .check(Check::fail("finished within budget").with_detail(format!("{budget}s")))
                .check(Check::pass("process group terminated"))
                .root_cause("the build hung or is far slower than expected (emulated builds run several times slower)")
                .fix(format!(
                    "inspect {} and raise build.timeout_secs or build.emulated_timeout_factor if the build was progressing",
                    self.log_detail()
                )),
        )
    }

    fn failure_error(&self, program: &str, status: ExitStatus) -> Error {
        let target = self.current_task_id.clone().unwrap_or_default();
        let last = self
            .log_path()
            .map(|p| tail(&p, 3).join(" | "))
            .unwrap_or_default();
        let mut diag = Diagnostic::new(Gate::Build, format!("build step failed for '{target}'"))
            .check(Check::fail(format!("run {program}")).with_detail(status.to_string()));
        if !last.is_empty() {
            diag = diag.check(Check::fail("last output").with_detail(last));
        }
        Error::Build(
            diag.root_cause("the upstream build system rejected the configuration or failed to compile")
                .fix(format!("read the full output in {}", self.log_detail())),
        )
    }
}

fn describe(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        out.push(' ');
        out.push_str(&a.to_string_lossy());
    }
    out
}

fn terminate(child: &mut Child, pgid: u32) {
    kill_pgroup(pgid, false);
    let grace = Instant::now() + Duration::from_secs(2);
    while Instant::now() < grace {
        if matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    kill_pgroup(pgid, true);
    let _ = child.kill();
}

fn wait_child(child: &mut Child, program: &str) -> Result<ExitStatus> {
    child
        .wait()
        .map_err(|e| Error::msg(format!("wait failed for {program}: {e}")))
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative pid addresses the whole group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let mut flush = |pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(pending).into_owned());
            pending.clear();
        }
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                flush(&mut pending);
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }
    flush(&mut pending);
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn ctx_with_log(dir: &std::path::Path) -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));
        ctx.set_task("opus");
        ctx.set_log(TargetLog::open(&dir.join("opus.log")).expect("log"));
        (ctx, rx)
    }

    #[test]
    fn output_reaches_sink_sanitized_and_log_raw() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (ctx, rx) = ctx_with_log(tmp.path());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf '\\033[32mchecking cc\\033[0m\\n'");
        ctx.run_cmd(cmd).expect("run");

        let lines: Vec<String> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskLog { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert!(lines.iter().any(|l| l == "checking cc"), "{lines:?}");
        let raw = std::fs::read_to_string(tmp.path().join("opus.log")).expect("raw");
        assert!(raw.contains("\u{1b}[32m"));
    }

    #[test]
    fn non_zero_exit_is_a_build_error_pointing_at_the_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (ctx, _rx) = ctx_with_log(tmp.path());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'undefined reference to ogg_sync_init' >&2; exit 2");
        let err = ctx.run_cmd(cmd).expect_err("must fail");
        assert_eq!(err.kind(), "BuildError");
        let text = err.to_string();
        assert!(text.contains("opus.log"), "{text}");
        assert!(text.contains("ogg_sync_init"), "{text}");
    }

    #[test]
    fn timeout_kills_the_process_group() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut ctx, _rx) = ctx_with_log(tmp.path());
        ctx.set_timeout(Duration::from_millis(300));
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let start = Instant::now();
        let err = ctx.run_cmd(cmd).expect_err("must time out");
        assert_eq!(err.kind(), "TimeoutError");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn dry_run_does_not_spawn() {
        let (tx, rx) = mpsc::channel();
        let ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)));
        ctx.run_cmd(Command::new("/definitely/not/here")).expect("dry run");
        assert!(rx.try_iter().any(|ev| matches!(
            ev,
            ExecEvent::TaskLog { line, .. } if line.starts_with("DRY-RUN")
        )));
    }
}
