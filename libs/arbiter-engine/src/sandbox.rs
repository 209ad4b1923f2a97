//! Process Sandbox - One Child, Kernel Limits, Hard Watchdog
//!
//! **Isolation Rules (Applied in the Child Before exec):**
//! 1. `setsid()`: the child leads its own session and process group
//! 2. Network namespace unshared (per `NetworkIsolation`)
//! 3. RLIMIT_CPU soft = ceil(limit), hard = soft + 1 second
//! 4. RLIMIT_AS = memory limit (when the runtime tolerates it)
//! 5. RLIMIT_CORE = 0, RLIMIT_FSIZE and RLIMIT_NOFILE capped
//!
//! **Parent Side:**
//! - Environment cleared; HOME and TMPDIR point at the working directory
//! - stdin written from a task, stdout/stderr drained with a byte cap
//! - Wall-clock watchdog via `tokio::time::timeout`; on expiry the whole
//!   process group is SIGKILLed
//! - The leader is awaited without being reaped (`waitid` + `WNOWAIT`), so its
//!   pid and process group stay reserved while the group is killed and its
//!   CPU time is read. Only then is it reaped.
//! - Early exits kill the process group through the guard's drop
//!
//! The sandbox reports what happened. Mapping that to a verdict is the
//! executor's job.

use anyhow::{Context, Result};
use arbiter_common::NetworkIsolation;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::memory::MemoryTracker;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_FILE_SIZE_BYTES: u64 = 64 * 1024 * 1024;
const MAX_OPEN_FILES: u64 = 64;
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
/// How long output pipes may stay open after the child is gone
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdin: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub cpu_time_ms: u32,
    /// RLIMIT_AS in bytes; `None` leaves the address space unlimited
    pub memory_bytes: Option<u64>,
    pub wall_time: Duration,
    pub max_output_bytes: usize,
    pub network: NetworkIsolation,
}

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// Killed by the wall-clock watchdog
    WatchdogKilled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Output pipes were still held open after the child exited
    pub output_incomplete: bool,
    pub elapsed: Duration,
    /// User + system CPU time of the child, when the host reports it
    pub cpu_time: Option<Duration>,
    pub peak_memory_kb: Option<u64>,
}

/// Kills the child's process group when dropped, until released
struct ProcessGroupGuard {
    pgid: libc::pid_t,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pgid: libc::pid_t) -> Self {
        Self { pgid, armed: true }
    }

    /// The leader has been reaped; the group id may be reused from here on
    fn release(mut self) {
        self.armed = false;
    }

    fn kill(&self) {
        // ESRCH once the group is gone; nothing to do then
        unsafe {
            libc::killpg(self.pgid, libc::SIGKILL);
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.kill();
        }
    }
}

/// Block until `pid` has exited, leaving it unreaped
fn wait_exited(pid: libc::pid_t) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            // already reaped elsewhere; the reap below reports it
            Some(libc::ECHILD) => return Ok(()),
            _ => return Err(err),
        }
    }
}

/// CPU time of an exited, unreaped process: utime + stime plus the times of
/// children it waited for
#[cfg(target_os = "linux")]
fn cpu_time(pid: libc::pid_t) -> Option<Duration> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_cpu_ticks(&stat).and_then(ticks_to_duration)
}

#[cfg(not(target_os = "linux"))]
fn cpu_time(_pid: libc::pid_t) -> Option<Duration> {
    None
}

/// Fields 14-17 of `/proc/<pid>/stat`. The command name may hold spaces and
/// parentheses, so counting starts after its closing `)`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    fields
        .get(11..15)?
        .iter()
        .map(|f| f.parse::<u64>().ok())
        .sum()
}

fn ticks_to_duration(ticks: u64) -> Option<Duration> {
    let per_second = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if per_second <= 0 {
        return None;
    }
    Some(Duration::from_millis(ticks.saturating_mul(1000) / per_second as u64))
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read to EOF, keeping at most `cap` bytes; the rest is discarded so the
/// writer never blocks on a full pipe
async fn drain_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    sink: Arc<Mutex<Capture>>,
) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let mut capture = sink.lock().await;
        let room = cap.saturating_sub(capture.bytes.len());
        if n > room {
            capture.truncated = true;
        }
        capture.bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
}

#[cfg(target_env = "gnu")]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(target_env = "gnu"))]
type Resource = libc::c_int;

fn set_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn isolate_network(mode: NetworkIsolation) -> io::Result<()> {
    if mode == NetworkIsolation::Off {
        return Ok(());
    }
    if unsafe { libc::unshare(libc::CLONE_NEWNET) } == 0 {
        return Ok(());
    }
    // unprivileged: a fresh user namespace grants CAP_SYS_ADMIN over the new netns
    if unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) } == 0 {
        return Ok(());
    }
    match mode {
        NetworkIsolation::Required => Err(io::Error::last_os_error()),
        NetworkIsolation::BestEffort | NetworkIsolation::Off => Ok(()),
    }
}

#[cfg(not(target_os = "linux"))]
fn isolate_network(mode: NetworkIsolation) -> io::Result<()> {
    match mode {
        NetworkIsolation::Required => Err(io::Error::from(io::ErrorKind::Unsupported)),
        NetworkIsolation::BestEffort | NetworkIsolation::Off => Ok(()),
    }
}

/// Runs in the forked child between fork and exec. Syscalls only, no allocation.
fn confine_child(limits: &SandboxLimits) -> io::Result<()> {
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    isolate_network(limits.network)?;

    let cpu_secs = u64::from(limits.cpu_time_ms).div_ceil(1000).max(1);
    set_limit(libc::RLIMIT_CPU, cpu_secs, cpu_secs + 1)?;
    if let Some(bytes) = limits.memory_bytes {
        set_limit(libc::RLIMIT_AS, bytes, bytes)?;
    }
    set_limit(libc::RLIMIT_CORE, 0, 0)?;
    set_limit(libc::RLIMIT_FSIZE, MAX_FILE_SIZE_BYTES, MAX_FILE_SIZE_BYTES)?;
    set_limit(libc::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;

    Ok(())
}

/// Run one command under the sandbox and report how it ended.
///
/// Errors are host-side failures only (spawn, pipe setup, wait). Anything the
/// child does, including dying to a signal, is reported in the outcome.
#[tracing::instrument(skip(command, limits), fields(program = %command.program))]
pub async fn run_sandboxed(command: SandboxCommand, limits: SandboxLimits) -> Result<ProcessOutcome> {
    let SandboxCommand {
        program,
        args,
        working_dir,
        stdin: input,
    } = command;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(&working_dir)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", &working_dir)
        .env("TMPDIR", &working_dir)
        .env("LANG", "C.UTF-8")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    unsafe {
        cmd.pre_exec(move || confine_child(&limits));
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;

    let pid = child.id().context("child exited before its pid was read")?;
    let group = ProcessGroupGuard::new(pid as libc::pid_t);
    let tracker = MemoryTracker::start(pid, MEMORY_SAMPLE_INTERVAL);

    let mut stdin = child.stdin.take().context("failed to open child stdin")?;
    let stdout = child.stdout.take().context("failed to open child stdout")?;
    let stderr = child.stderr.take().context("failed to open child stderr")?;

    let writer = tokio::spawn(async move {
        // EPIPE is expected when the program never reads its input
        if let Err(e) = stdin.write_all(&input).await {
            debug!("stdin write stopped: {}", e);
        }
        drop(stdin);
    });

    let stdout_capture = Arc::new(Mutex::new(Capture::default()));
    let stderr_capture = Arc::new(Mutex::new(Capture::default()));
    let stdout_reader = tokio::spawn(drain_capped(
        stdout,
        limits.max_output_bytes,
        Arc::clone(&stdout_capture),
    ));
    let stderr_reader = tokio::spawn(drain_capped(
        stderr,
        limits.max_output_bytes,
        Arc::clone(&stderr_capture),
    ));

    let leader = pid as libc::pid_t;
    let mut exit_watch = tokio::task::spawn_blocking(move || -> io::Result<Option<Duration>> {
        wait_exited(leader)?;
        Ok(cpu_time(leader))
    });

    let (watchdog_fired, cpu_time) =
        match tokio::time::timeout(limits.wall_time, &mut exit_watch).await {
            Ok(joined) => (false, joined),
            Err(_) => {
                group.kill();
                (true, exit_watch.await)
            }
        };
    let cpu_time = cpu_time
        .context("exit watcher failed")?
        .context("failed to wait for sandboxed process")?;
    let elapsed = start.elapsed();

    // leader is a zombie: the group id is still ours, stragglers go with it
    group.kill();
    let status = child
        .wait()
        .await
        .context("failed to reap sandboxed process")?;
    group.release();

    let termination = if watchdog_fired {
        Termination::WatchdogKilled
    } else {
        match (status.code(), status.signal()) {
            (Some(code), _) => Termination::Exited(code),
            (None, Some(signal)) => Termination::Signaled(signal),
            (None, None) => Termination::Signaled(libc::SIGKILL),
        }
    };

    let peak_memory_kb = tracker.finish().await;

    let mut output_incomplete = false;
    for reader in [stdout_reader, stderr_reader] {
        let abort = reader.abort_handle();
        match tokio::time::timeout(PIPE_DRAIN_GRACE, reader).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("output pipe read failed: {}", e),
            Ok(Err(e)) => warn!("output reader task failed: {}", e),
            Err(_) => {
                abort.abort();
                output_incomplete = true;
            }
        }
    }
    writer.abort();

    let stdout = std::mem::take(&mut *stdout_capture.lock().await);
    let stderr = std::mem::take(&mut *stderr_capture.lock().await);

    Ok(ProcessOutcome {
        termination,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        output_incomplete,
        elapsed,
        cpu_time,
        peak_memory_kb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str, dir: &TempDir, stdin: &str) -> SandboxCommand {
        SandboxCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: dir.path().to_path_buf(),
            stdin: stdin.as_bytes().to_vec(),
        }
    }

    fn limits(cpu_time_ms: u32, wall_ms: u64) -> SandboxLimits {
        SandboxLimits {
            cpu_time_ms,
            memory_bytes: Some(256 * 1024 * 1024),
            wall_time: Duration::from_millis(wall_ms),
            max_output_bytes: 64 * 1024,
            network: NetworkIsolation::Off,
        }
    }

    #[tokio::test]
    async fn test_stdin_round_trip() {
        let dir = TempDir::new().unwrap();
        let outcome = run_sandboxed(sh("cat", &dir, "hello\nworld\n"), limits(1000, 2000))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Exited(0));
        assert_eq!(outcome.stdout, b"hello\nworld\n");
        assert!(!outcome.stdout_truncated);
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let dir = TempDir::new().unwrap();
        let outcome = run_sandboxed(sh("echo boom >&2; exit 3", &dir, ""), limits(1000, 2000))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Exited(3));
        assert_eq!(outcome.stderr, b"boom\n");
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        let dir = TempDir::new().unwrap();
        let outcome = run_sandboxed(sh("echo \"$HOME|$CARGO\"", &dir, ""), limits(1000, 2000))
            .await
            .unwrap();

        let expected = format!("{}|\n", dir.path().display());
        assert_eq!(String::from_utf8_lossy(&outcome.stdout), expected);
    }

    #[tokio::test]
    async fn test_watchdog_kills_sleeper() {
        let dir = TempDir::new().unwrap();
        let outcome = run_sandboxed(sh("sleep 10", &dir, ""), limits(1000, 300))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::WatchdogKilled);
        assert!(outcome.elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cpu_limit_signals_busy_loop() {
        let dir = TempDir::new().unwrap();
        let outcome = run_sandboxed(sh("while :; do :; done", &dir, ""), limits(1000, 5000))
            .await
            .unwrap();

        assert!(matches!(
            outcome.termination,
            Termination::Signaled(libc::SIGXCPU) | Termination::Signaled(libc::SIGKILL)
        ));
    }

    #[tokio::test]
    async fn test_background_children_do_not_hold_the_run() {
        let dir = TempDir::new().unwrap();
        let outcome = run_sandboxed(sh("sleep 10 & echo started", &dir, ""), limits(1000, 5000))
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Exited(0));
        assert_eq!(outcome.stdout, b"started\n");
        assert!(outcome.elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_output_is_capped_and_drained() {
        let dir = TempDir::new().unwrap();
        let mut limits = limits(2000, 5000);
        limits.max_output_bytes = 1000;

        let outcome = run_sandboxed(sh("head -c 500000 /dev/zero", &dir, ""), limits)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Exited(0));
        assert_eq!(outcome.stdout.len(), 1000);
        assert!(outcome.stdout_truncated);
    }

    #[tokio::test]
    async fn test_cpu_time_is_reported() {
        let dir = TempDir::new().unwrap();
        let busy = run_sandboxed(sh("while :; do :; done", &dir, ""), limits(5000, 600))
            .await
            .unwrap();
        let idle = run_sandboxed(sh("sleep 0.3", &dir, ""), limits(5000, 5000))
            .await
            .unwrap();

        assert_eq!(busy.termination, Termination::WatchdogKilled);
        assert!(busy.cpu_time.is_some_and(|t| t >= Duration::from_millis(100)));
        assert_eq!(idle.termination, Termination::Exited(0));
        assert!(idle.cpu_time.is_some_and(|t| t < Duration::from_millis(200)));
    }

    #[test]
    fn test_parse_cpu_ticks() {
        // utime=120 stime=30 cutime=5 cstime=1
        let stat = "4242 (my (odd) prog) Z 1 4242 4242 0 -1 4194564 0 0 0 0 120 30 5 1 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat), Some(156));
        assert_eq!(parse_cpu_ticks("4242 (short) Z 1"), None);
    }

    #[tokio::test]
    async fn test_exited_leader_stays_unreaped() {
        let mut child = Command::new("/bin/true").spawn().unwrap();
        let pid = child.id().unwrap() as libc::pid_t;

        tokio::task::spawn_blocking(move || wait_exited(pid))
            .await
            .unwrap()
            .unwrap();

        // zombie keeps its pid (and process group) until reaped
        assert_eq!(unsafe { libc::kill(pid, 0) }, 0);
        assert!(child.wait().await.unwrap().success());
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }

    #[tokio::test]
    async fn test_missing_program_is_host_error() {
        let dir = TempDir::new().unwrap();
        let command = SandboxCommand {
            program: "/nonexistent/toolchain".to_string(),
            args: vec![],
            working_dir: dir.path().to_path_buf(),
            stdin: vec![],
        };

        assert!(run_sandboxed(command, limits(1000, 1000)).await.is_err());
    }
}
