// Installation logic
//
// This module contains the install pipeline stages, the OS-specific backends (Windows +
// Linux) and shared utilities for running external commands with timeouts/retries.
//
// IMPORTANT:
// - Never log secrets (API keys, tokens). Arguments go through `mask_arg`.
// - Stages run strictly one after another; nothing here spawns background work that
//   outlives a stage.

pub mod environment;
pub mod fetch;
pub mod files;
pub mod firewall;
pub mod linux;
pub mod pipeline;
pub mod resolver;
pub mod service;
pub mod stager;
pub mod verifier;
pub mod windows;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::utils::logging::mask_arg;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub operation: String,
    /// Retry on transient spawn/IO failures. Off for commands that must not run twice.
    pub retry_transient: bool,
}

impl CommandSpec {
    pub fn new<S: AsRef<str>>(program: impl Into<String>, args: &[S]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
            cwd: None,
            timeout: Duration::from_secs(30),
            operation: "cmd".to_string(),
            retry_transient: true,
        }
    }

    pub fn operation(mut self, op: impl Into<String>) -> Self {
        self.operation = op.into();
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = dur;
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retry_transient = false;
        self
    }

    /// Build from a configured `[program, args...]` vector.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Command is empty"))?;
        Ok(Self::new(program.clone(), args))
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| mask_arg(a)));
        parts.join(" ")
    }
}

/// Seam for every external process the provisioner spawns.
///
/// Returns captured output even on non-zero exit (caller decides success); `Err` means the
/// process could not be run at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Production runner: spawns real processes via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        run_cmd_with_timeout(spec).await
    }
}

/// Spawn/IO failures worth another attempt: interrupted calls, a just-written executable
/// still held open (ETXTBSY, Windows sharing violation), or a busy resource.
fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    const ETXTBSY: i32 = 26;
    const ERROR_SHARING_VIOLATION: i32 = 32;

    let io_transient = e.chain().filter_map(|c| c.downcast_ref::<std::io::Error>()).any(|io| {
        matches!(
            io.kind(),
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
        ) || match io.raw_os_error() {
            Some(code) if cfg!(windows) => code == ERROR_SHARING_VIOLATION,
            Some(code) => code == ETXTBSY,
            None => false,
        }
    });
    if io_transient {
        return true;
    }
    let msg = format!("{:#}", e).to_ascii_lowercase();
    ["text file busy", "temporarily unavailable", "used by another process", "resource busy"]
        .iter()
        .any(|needle| msg.contains(needle))
}

/// Read a child pipe to completion on its own task so a chatty process cannot block on a
/// full pipe while we wait for it.
fn drain<R>(pipe: Option<R>, stream: &'static str, operation: &str) -> Result<JoinHandle<std::io::Result<String>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut pipe =
        pipe.ok_or_else(|| anyhow::anyhow!("Failed to capture {} (operation={})", stream, operation))?;
    Ok(tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }))
}

async fn collect(task: JoinHandle<std::io::Result<String>>, stream: &str) -> Result<String> {
    task.await
        .with_context(|| format!("{} reader task failed", stream))?
        .with_context(|| format!("Failed to read {}", stream))
}

async fn run_cmd_with_timeout_once(spec: &CommandSpec) -> Result<CommandOutput> {
    let started = Instant::now();
    debug!(
        "[PHASE: installation] [STEP: cmd] spawning (operation={}, cmd={}, cwd={:?}, timeout_ms={})",
        spec.operation,
        spec.display(),
        spec.cwd,
        spec.timeout.as_millis()
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            spec.program, spec.operation
        )
    })?;
    let stdout = drain(child.stdout.take(), "stdout", &spec.operation)?;
    let stderr = drain(child.stderr.take(), "stderr", &spec.operation)?;

    let status = match timeout(spec.timeout, child.wait()).await {
        Ok(waited) => waited.with_context(|| {
            format!(
                "Command wait failed (operation={}, program={})",
                spec.operation, spec.program
            )
        })?,
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] timeout reached, killing process (operation={}, program={}, timeout_ms={})",
                spec.operation,
                spec.program,
                spec.timeout.as_millis()
            );
            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: installation] [STEP: cmd] failed to kill timed-out process (operation={}): {}",
                    spec.operation, e
                );
            }
            anyhow::bail!(
                "Command timed out after {}ms (operation={}, program={})",
                spec.timeout.as_millis(),
                spec.operation,
                spec.program
            );
        }
    };

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: collect(stdout, "stdout").await?,
        stderr: collect(stderr, "stderr").await?,
        duration_ms: started.elapsed().as_millis(),
    };
    debug!(
        "[PHASE: installation] [STEP: cmd] finished (operation={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        spec.operation,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );
    Ok(out)
}

/// Run an external command with a timeout and up to 3 retries for transient failures.
///
/// Timeouts are not retried: a build step that hangs once will hang again.
pub async fn run_cmd_with_timeout(spec: &CommandSpec) -> Result<CommandOutput> {
    let started = Instant::now();
    info!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout entered (operation={}, program={}, args_count={}, timeout_ms={})",
        spec.operation,
        spec.program,
        spec.args.len(),
        spec.timeout.as_millis()
    );

    let result = if spec.retry_transient {
        let retry_strategy = ExponentialBackoff::from_millis(200)
            .factor(2)
            .max_delay(Duration::from_secs(2))
            .take(3)
            .map(jitter);

        RetryIf::start(
            retry_strategy,
            || run_cmd_with_timeout_once(spec),
            |e: &anyhow::Error| {
                let transient = is_transient_exec_error(e);
                if transient {
                    warn!(
                        "[PHASE: installation] [STEP: cmd] Transient command failure detected; will retry (operation={}, program={}, err={})",
                        spec.operation,
                        spec.program,
                        e
                    );
                }
                transient
            },
        )
        .await
    } else {
        run_cmd_with_timeout_once(spec).await
    };

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout exit (operation={}, program={}, exit_code={:?}, duration_ms={})",
                spec.operation,
                spec.program,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout error (operation={}, program={}, duration_ms={}, err={:?})",
                spec.operation,
                spec.program,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}

/// Run a command and turn a non-zero exit into an error carrying stderr.
pub async fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let out = runner.run(spec).await?;
    if !out.success() {
        let detail = if out.stderr.trim().is_empty() {
            out.stdout.trim()
        } else {
            out.stderr.trim()
        };
        anyhow::bail!(
            "`{}` exited with {:?}: {}",
            spec.display(),
            out.exit_code,
            truncate(detail, 600)
        );
    }
    Ok(out)
}

/// Resolve a bare program name against an explicit directory first, then PATH.
///
/// Falls back to the bare name so the OS loader gets the final say.
pub fn resolve_program(program: &str, preferred_dir: Option<&Path>) -> String {
    if Path::new(program).components().count() > 1 {
        return program.to_string();
    }
    if let Some(dir) = preferred_dir {
        let cwd = std::env::current_dir().unwrap_or_else(|_| dir.to_path_buf());
        if let Ok(p) = which::which_in(program, Some(dir), cwd) {
            return p.to_string_lossy().to_string();
        }
    }
    match which::which(program) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => program.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{}...", head)
}
