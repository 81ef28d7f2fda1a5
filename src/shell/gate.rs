//! Command safety gate: allow/block policy, directory confinement, and
//! bounded execution of shell commands requested by the model.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Default command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-stream captured-output bound, in characters.
pub const DEFAULT_MAX_OUTPUT_LEN: usize = 50_000;

/// Marker appended when captured output exceeds the bound.
const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Destructive command patterns blocked by default. Entries starting with `^`
/// are regexes; everything else matches as an exact command or a prefix
/// followed by a space.
const DEFAULT_BLOCKLIST: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "rm -rf .",
    "rm -fr /",
    "mkfs",
    "fdisk",
    "parted",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "init 0",
    "chmod -R 777 /",
    "chown -R",
    r"^rm\s+(-[a-zA-Z]*[rf][a-zA-Z]*\s+)+/\S*",
    r"^dd\s+.*of=/dev/",
    r"^(curl|wget)\s+.*\|\s*(ba|z|da)?sh",
    r"^:\s*\(\s*\)\s*\{.*\|.*&.*\}\s*;",
];

/// Safety gate errors. Policy violations and timeouts throw; an ordinary
/// non-zero exit does not.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Command blocked by safety policy (rule: {rule}): {command}")]
    Blocked { command: String, rule: String },
    #[error("Working directory '{0}' is outside the allowed roots")]
    DisallowedDirectory(String),
    #[error("Command timed out after {0:.1}s")]
    Timeout(f64),
    #[error("Failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Invalid block rule '{0}': {1}")]
    InvalidRule(String, String),
}

/// One blocklist entry.
#[derive(Debug, Clone)]
enum BlockRule {
    /// Matches the whole command or a leading `<prefix> ` segment.
    Prefix(String),
    /// Regex match anchored however the pattern says.
    Pattern(Regex),
}

impl BlockRule {
    fn parse(raw: &str) -> Result<Self, GateError> {
        if raw.starts_with('^') {
            Regex::new(raw)
                .map(BlockRule::Pattern)
                .map_err(|e| GateError::InvalidRule(raw.to_string(), e.to_string()))
        } else {
            Ok(BlockRule::Prefix(raw.to_string()))
        }
    }

    fn matches(&self, command: &str) -> bool {
        match self {
            BlockRule::Prefix(prefix) => {
                command == prefix || command.starts_with(&format!("{} ", prefix))
            }
            BlockRule::Pattern(regex) => regex.is_match(command),
        }
    }

    fn describe(&self) -> String {
        match self {
            BlockRule::Prefix(p) => p.clone(),
            BlockRule::Pattern(r) => r.as_str().to_string(),
        }
    }
}

/// Execution request for one shell action.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    /// Interpreter override; `None` uses the host default.
    pub shell: Option<String>,
    /// Timeout override in seconds.
    pub timeout: Option<f64>,
    pub work_dir: Option<String>,
    pub capture_output: bool,
}

impl ShellRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: None,
            timeout: None,
            work_dir: None,
            capture_output: true,
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }
}

/// Result of one executed shell command. Non-zero exit codes land here, not
/// in [`GateError`].
#[derive(Debug, Clone)]
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub command: String,
}

impl ShellResult {
    /// Feedback block injected into the next inference prompt.
    pub fn format_feedback(&self) -> String {
        let mut out = format!(
            "Previous shell command: {}\nExit code: {} (took {:.1}s)",
            self.command,
            self.exit_code,
            self.duration.as_secs_f64()
        );
        if !self.stdout.trim().is_empty() {
            out.push_str("\nstdout:\n");
            out.push_str(self.stdout.trim_end());
        }
        if !self.stderr.trim().is_empty() {
            out.push_str("\nstderr:\n");
            out.push_str(self.stderr.trim_end());
        }
        out
    }
}

/// Policy plus executor for shell actions.
pub struct CommandGate {
    rules: Vec<BlockRule>,
    allowed_roots: Vec<PathBuf>,
    default_timeout: Duration,
    max_output_len: usize,
    shell_program: Option<String>,
}

impl Default for CommandGate {
    fn default() -> Self {
        let rules = DEFAULT_BLOCKLIST
            .iter()
            .map(|raw| BlockRule::parse(raw))
            .collect::<Result<Vec<_>, _>>()
            .unwrap_or_default();
        Self {
            rules,
            allowed_roots: Vec::new(),
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_output_len: DEFAULT_MAX_OUTPUT_LEN,
            shell_program: None,
        }
    }
}

impl CommandGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block rule on top of the defaults.
    pub fn with_block_rule(mut self, raw: &str) -> Result<Self, GateError> {
        self.rules.push(BlockRule::parse(raw)?);
        Ok(self)
    }

    /// Confine working directories to descendants of the given roots.
    /// With no roots configured, any directory is allowed.
    pub fn with_allowed_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.allowed_roots.push(normalize_path(&root.into()));
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_output_len(mut self, len: usize) -> Self {
        self.max_output_len = len;
        self
    }

    /// Override the host's default command interpreter.
    pub fn with_shell_program(mut self, program: impl Into<String>) -> Self {
        self.shell_program = Some(program.into());
        self
    }

    /// Decide whether a command may run in a working directory.
    ///
    /// Pure over its inputs: the same command and directory always yield the
    /// same decision.
    pub fn check(&self, command: &str, work_dir: Option<&str>) -> Result<(), GateError> {
        let command = command.trim();

        if let Some(rule) = self.rules.iter().find(|r| r.matches(command)) {
            return Err(GateError::Blocked {
                command: command.to_string(),
                rule: rule.describe(),
            });
        }

        if !self.allowed_roots.is_empty() {
            let resolved = resolve_work_dir(work_dir);
            let allowed = self
                .allowed_roots
                .iter()
                .any(|root| resolved.starts_with(root));
            if !allowed {
                return Err(GateError::DisallowedDirectory(
                    resolved.display().to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Validate and execute one command under containment.
    ///
    /// # Returns
    /// A [`ShellResult`] for any command that ran to completion, including
    /// failures; only policy violations and timeouts are errors.
    pub async fn execute(&self, request: &ShellRequest) -> Result<ShellResult, GateError> {
        self.check(&request.command, request.work_dir.as_deref())?;

        let (program, flag) = self.interpreter(request);
        let mut cmd = Command::new(&program);
        cmd.arg(flag).arg(&request.command);
        cmd.current_dir(resolve_work_dir(request.work_dir.as_deref()));
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        if request.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let timeout = request
            .timeout
            .map(Duration::from_secs_f64)
            .unwrap_or(self.default_timeout);

        let start = Instant::now();
        let mut child = cmd.spawn()?;

        // Streams are drained concurrently with the wait so a full pipe
        // buffer cannot deadlock the child.
        let cap = self.max_output_len;
        let stdout_task = spawn_reader(child.stdout.take(), cap);
        let stderr_task = spawn_reader(child.stderr.take(), cap);

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                child.kill().await.ok();
                tracing::warn!(command = %request.command, "command timed out");
                return Err(GateError::Timeout(timeout.as_secs_f64()));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(ShellResult {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
            command: request.command.clone(),
        })
    }

    fn interpreter(&self, request: &ShellRequest) -> (String, &'static str) {
        if let Some(shell) = request.shell.as_ref().or(self.shell_program.as_ref()) {
            let flag = if shell.contains("cmd") { "/C" } else { "-c" };
            return (shell.clone(), flag);
        }
        if cfg!(windows) {
            ("cmd".to_string(), "/C")
        } else {
            ("sh".to_string(), "-c")
        }
    }
}

fn spawn_reader<R>(reader: Option<R>, cap: usize) -> tokio::task::JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return String::new();
        };
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Keep draining past the cap so the child never blocks on
                    // a full pipe; only the retained text is bounded.
                    if buf.len() <= cap + 4 {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
        let text = String::from_utf8_lossy(&buf);
        if text.chars().count() > cap {
            let kept: String = text.chars().take(cap).collect();
            format!("{}{}", kept, TRUNCATION_MARKER)
        } else {
            text.into_owned()
        }
    })
}

/// Resolve a requested working directory to an absolute path, defaulting to
/// the process's current directory.
fn resolve_work_dir(work_dir: Option<&str>) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    match work_dir {
        Some(dir) => {
            let path = Path::new(dir);
            if path.is_absolute() {
                normalize_path(path)
            } else {
                normalize_path(&cwd.join(path))
            }
        }
        None => normalize_path(&cwd),
    }
}

/// Lexical normalization: fold `.` and `..` without touching the filesystem,
/// so confinement also holds for directories that do not exist yet.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
