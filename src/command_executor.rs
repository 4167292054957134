//! Sandboxed execution of allow-listed commands.
//!
//! A command line is accepted only when its first token matches a configured
//! prefix and the raw line contains no shell metacharacters. Accepted lines
//! are split into argv and spawned directly, never through a shell.

use crate::{CaptureError, CommandSettings};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Characters rejected anywhere in a command line.
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '\\', '\n', '\r',
];

const READ_CHUNK: usize = 8 * 1024;
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct CommandExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal, timed out or never started.
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
    pub truncated: bool,
}

impl CommandExecutionResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Program and arguments produced from a validated command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    allowed_prefixes: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn new(settings: &CommandSettings) -> Self {
        Self {
            allowed_prefixes: settings.allowed_prefixes.clone(),
            working_dir: settings.working_dir.clone(),
            timeout: settings.timeout,
            max_output_bytes: settings.max_output_bytes,
        }
    }

    /// Applies the allowlist and metacharacter checks and tokenizes the line.
    pub fn validate(&self, command_line: &str) -> Result<ParsedCommand, CaptureError> {
        let first = command_line
            .split_whitespace()
            .next()
            .ok_or_else(|| CaptureError::InvalidRequest("command is empty".to_string()))?;

        if !self.is_allowed_program(first) {
            warn!(security_event = true, program = first, "Rejected command outside allowlist");
            return Err(CaptureError::CommandNotAllowed(first.to_string()));
        }

        if command_line.contains(SHELL_METACHARACTERS) {
            warn!(security_event = true, command = command_line, "Rejected command with shell metacharacters");
            return Err(CaptureError::ForbiddenCharacters);
        }

        let mut tokens = tokenize(command_line)?.into_iter();
        let program = tokens
            .next()
            .ok_or_else(|| CaptureError::InvalidRequest("command is empty".to_string()))?;

        // Quotes can reshape the first token, so the spawned program is checked too
        if !self.is_allowed_program(&program) {
            warn!(security_event = true, program = %program, "Rejected command outside allowlist");
            return Err(CaptureError::CommandNotAllowed(program));
        }

        Ok(ParsedCommand {
            program,
            args: tokens.collect(),
        })
    }

    /// A program matches a prefix exactly or names a path below it. Paths
    /// containing `..` never match, since they can climb out of the prefix.
    fn is_allowed_program(&self, token: &str) -> bool {
        if Path::new(token).components().any(|c| c == Component::ParentDir) {
            return false;
        }

        self.allowed_prefixes.iter().any(|prefix| {
            token == prefix
                || token
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Validates and runs a command line.
    ///
    /// Only validation failures are errors. Every command that passes
    /// validation yields a result, including non-zero exits, timeouts and
    /// spawn failures.
    pub async fn run(&self, command_line: &str) -> Result<CommandExecutionResult, CaptureError> {
        let parsed = self.validate(command_line)?;
        let started = Instant::now();

        info!(program = %parsed.program, args = parsed.args.len(), "Executing command");

        let mut child = match Command::new(&parsed.program)
            .args(&parsed.args)
            .current_dir(&self.working_dir)
            .env("FORCE_COLOR", "1")
            .env("CLICOLOR_FORCE", "1")
            .env("TERM", "xterm-256color")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %parsed.program, error = %e, "Failed to spawn command");
                return Ok(CommandExecutionResult {
                    stdout: String::new(),
                    stderr: format!("failed to start {}: {}", parsed.program, e),
                    exit_code: None,
                    duration: started.elapsed(),
                    timed_out: false,
                    truncated: false,
                });
            }
        };

        let budget = Arc::new(AtomicUsize::new(self.max_output_bytes));
        let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_capped(out, budget.clone())));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_capped(err, budget.clone())));

        let (status, timed_out) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => (status.ok(), false),
            Err(_) => {
                warn!(program = %parsed.program, "Command timed out after {:?}, killing", self.timeout);
                let _ = child.start_kill();
                (child.wait().await.ok(), true)
            }
        };

        let (stdout, stdout_truncated) = collect_output(stdout_task).await;
        let (stderr, stderr_truncated) = collect_output(stderr_task).await;

        let result = CommandExecutionResult {
            stdout,
            stderr,
            exit_code: if timed_out { None } else { status.and_then(|s| s.code()) },
            duration: started.elapsed(),
            timed_out,
            truncated: stdout_truncated || stderr_truncated,
        };

        debug!(
            program = %parsed.program,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            truncated = result.truncated,
            "Command finished"
        );
        Ok(result)
    }
}

/// Splits a command line into tokens, treating quoted spans as one argument.
///
/// Quotes only group; there is no escaping or expansion of any kind.
pub fn tokenize(command_line: &str) -> Result<Vec<String>, CaptureError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in command_line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(CaptureError::InvalidRequest(
            "command has an unterminated quote".to_string(),
        ));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Reads a stream to the end, keeping bytes only while the shared budget lasts.
async fn read_capped<R>(mut reader: R, budget: Arc<AtomicUsize>) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let granted = budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| Some(left.saturating_sub(n)))
            .map(|left| left.min(n))
            .unwrap_or(0);

        kept.extend_from_slice(&chunk[..granted]);
        if granted < n {
            truncated = true;
        }
    }

    (kept, truncated)
}

async fn collect_output(
    task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>,
) -> (String, bool) {
    let Some(mut task) = task else {
        return (String::new(), false);
    };

    // A grandchild may still hold the pipe open after the child exits.
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(_)) => (String::new(), false),
        Err(_) => {
            task.abort();
            (String::new(), true)
        }
    }
}
