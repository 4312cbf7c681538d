// Shell Runner
// Executes script steps under sh, bash, pwsh, python, cmd or a custom `{0}` template

use crate::config::DEFAULT_OUTPUT_LIMIT;
use crate::execution::cancel::CancelSignal;
use crate::execution::outcome::{CapturedOutput, StepOutcome};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long to wait for output readers once the process is gone. A killed
/// shell can leave grandchildren holding the pipes open.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Interpreters supported by the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    Default,
    Sh,
    Bash,
    /// PowerShell Core (cross-platform)
    Pwsh,
    /// Windows PowerShell (falls back to pwsh elsewhere)
    PowerShell,
    /// python3, or python when python3 is missing
    Python,
    Cmd,
    /// Command template; `{0}` is replaced by the path of a file holding the script
    Custom(String),
}

impl FromStr for Shell {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sh" => Ok(Shell::Sh),
            "bash" => Ok(Shell::Bash),
            "pwsh" => Ok(Shell::Pwsh),
            "powershell" => Ok(Shell::PowerShell),
            "python" => Ok(Shell::Python),
            "cmd" => Ok(Shell::Cmd),
            template if template.contains("{0}") => Ok(Shell::Custom(template.to_string())),
            other => Err(format!(
                "unknown shell '{}' (expected sh, bash, pwsh, powershell, python, cmd or a command containing {{0}})",
                other
            )),
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shell::Default => f.write_str("default"),
            Shell::Sh => f.write_str("sh"),
            Shell::Bash => f.write_str("bash"),
            Shell::Pwsh => f.write_str("pwsh"),
            Shell::PowerShell => f.write_str("powershell"),
            Shell::Python => f.write_str("python"),
            Shell::Cmd => f.write_str("cmd"),
            Shell::Custom(template) => f.write_str(template),
        }
    }
}

impl Shell {
    /// Candidate executables and the arguments preceding an inline script
    fn inline_command(&self) -> Option<(&'static [&'static str], &'static [&'static str])> {
        let command: (&'static [&'static str], &'static [&'static str]) = match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    (&["cmd"], &["/D", "/C"])
                } else {
                    (&["sh"], &["-c"])
                }
            }
            Shell::Sh => (&["sh"], &["-c"]),
            Shell::Bash => (&["bash"], &["-c"]),
            Shell::Pwsh => (&["pwsh"], &["-NoLogo", "-NoProfile", "-Command"]),
            Shell::PowerShell => {
                if cfg!(target_os = "windows") {
                    (&["powershell.exe"], &["-NoLogo", "-NoProfile", "-Command"])
                } else {
                    (&["pwsh"], &["-NoLogo", "-NoProfile", "-Command"])
                }
            }
            Shell::Python => (&["python3", "python"], &["-c"]),
            Shell::Cmd => (&["cmd"], &["/D", "/C"]),
            Shell::Custom(_) => return None,
        };
        Some(command)
    }

    /// Build the command for `script`. Custom templates get the script
    /// written to a file under `scratch_dir`.
    fn command(&self, script: &str, scratch_dir: &Path) -> Result<(Command, Option<PathBuf>), String> {
        if let Some((candidates, args)) = self.inline_command() {
            let program = find_program(candidates)?;
            let mut cmd = Command::new(program);
            cmd.args(args).arg(script);
            return Ok((cmd, None));
        }

        let template = match self {
            Shell::Custom(template) => template,
            _ => return Err(format!("shell '{}' has no command", self)),
        };

        let mut parts = template.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| "custom shell template is empty".to_string())?;
        let program = find_program(&[program])?;

        std::fs::create_dir_all(scratch_dir)
            .map_err(|e| format!("failed to create {}: {}", scratch_dir.display(), e))?;
        let script_path = scratch_dir.join(format!("step-{}.script", uuid::Uuid::new_v4()));
        std::fs::write(&script_path, script)
            .map_err(|e| format!("failed to write {}: {}", script_path.display(), e))?;

        let path_arg = script_path.to_string_lossy().to_string();
        let mut cmd = Command::new(program);
        cmd.args(parts.map(|arg| arg.replace("{0}", &path_arg)));
        Ok((cmd, Some(script_path)))
    }
}

fn find_program(candidates: &[&str]) -> Result<PathBuf, String> {
    candidates
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| format!("interpreter '{}' not found on PATH", candidates.join("' or '")))
}

/// Configuration for shell execution
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Timeout for the process (None = no timeout)
    pub timeout: Option<Duration>,
    /// Bytes kept per stream; older output is dropped first
    pub output_limit: usize,
    /// Where custom-template script files are written
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            scratch_dir: None,
        }
    }
}

/// Output collected during script execution
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None when killed or never started)
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub truncated: bool,
}

impl ShellOutput {
    fn spawn_failure(message: String) -> Self {
        Self {
            stderr: message,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Convert shell output to a step outcome
    pub fn into_outcome(self) -> StepOutcome {
        let success = self.success();
        let captured = CapturedOutput {
            stdout: self.stdout,
            stderr: self.stderr,
            truncated: self.truncated,
            log_path: None,
        };
        if success {
            StepOutcome::success(self.exit_code, captured)
        } else {
            StepOutcome::failure(self.exit_code, captured)
        }
    }
}

/// Callback for handling output lines in real-time: `(line, is_stderr)`
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Keeps the tail of a stream, at most `limit` bytes
#[derive(Debug, Default)]
struct TailBuffer {
    limit: usize,
    text: String,
    truncated: bool,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn push_line(&mut self, line: &str) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);

        // compacted lazily: holds at most twice the limit between compactions
        if self.text.len() > self.limit.saturating_mul(2) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.truncated = true;
    }

    fn take(&mut self) -> (String, bool) {
        self.compact();
        (std::mem::take(&mut self.text), self.truncated)
    }
}

enum Exit {
    Code(Option<i32>),
    TimedOut(Duration),
    Cancelled,
}

/// Shell runner for executing scripts
#[derive(Debug, Clone)]
pub struct ShellRunner {
    /// Interpreter used for [`Shell::Default`]
    default_shell: Shell,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            default_shell: Shell::Default,
        }
    }

    /// Create a shell runner with a specific default shell
    pub fn with_default_shell(shell: Shell) -> Self {
        Self {
            default_shell: shell,
        }
    }

    /// Run `script` to completion, timeout or cancellation.
    ///
    /// Never fails: spawn errors come back as an output with no exit code and
    /// the reason on stderr.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        shell: &Shell,
        script: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
        config: &ShellConfig,
        cancel: &CancelSignal,
        on_output: Option<OutputCallback>,
    ) -> ShellOutput {
        let shell = if *shell == Shell::Default {
            &self.default_shell
        } else {
            shell
        };

        let scratch_dir = config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let (mut cmd, script_file) = match shell.command(script, &scratch_dir) {
            Ok(command) => command,
            Err(e) => return ShellOutput::spawn_failure(e),
        };

        cmd.current_dir(working_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // own process group, so a timeout or cancel reaches everything the script started
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(path) = script_file {
                    let _ = tokio::fs::remove_file(path).await;
                }
                return ShellOutput::spawn_failure(format!(
                    "Failed to spawn shell process '{}': {}",
                    shell, e
                ));
            }
        };
        let pid = child.id();

        let stdout = Arc::new(Mutex::new(TailBuffer::new(config.output_limit)));
        let stderr = Arc::new(Mutex::new(TailBuffer::new(config.output_limit)));

        let mut readers = Vec::new();
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_reader(pipe, false, stdout.clone(), on_output.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_reader(pipe, true, stderr.clone(), on_output));
        }

        let mut cancel = cancel.clone();
        let exit = tokio::select! {
            status = child.wait() => Exit::Code(status.ok().and_then(|s| s.code())),
            _ = sleep_or_pending(config.timeout) => Exit::TimedOut(config.timeout.unwrap_or_default()),
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        if !matches!(exit, Exit::Code(_)) {
            kill_process_group(pid);
            let _ = child.kill().await;
        }

        for mut reader in readers {
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        if let Some(path) = script_file {
            let _ = tokio::fs::remove_file(path).await;
        }

        let (stdout_text, stdout_truncated) = take_buffer(&stdout);
        let (stderr_text, stderr_truncated) = take_buffer(&stderr);
        let mut output = ShellOutput {
            stdout: stdout_text,
            stderr: stderr_text,
            truncated: stdout_truncated || stderr_truncated,
            ..Default::default()
        };

        match exit {
            Exit::Code(code) => output.exit_code = code,
            Exit::TimedOut(timeout) => {
                output.timed_out = true;
                append_line(&mut output.stderr, &format!("Process timed out after {:?}", timeout));
            }
            Exit::Cancelled => {
                output.cancelled = true;
                append_line(&mut output.stderr, "Process cancelled");
            }
        }
        output
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; the group id is the child's pid
        // because it was spawned as a group leader
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn sleep_or_pending(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

fn spawn_reader<R>(
    pipe: R,
    is_error: bool,
    buffer: Arc<Mutex<TailBuffer>>,
    on_output: Option<OutputCallback>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // a line longer than the limit arrives in limit-sized pieces
    let max_line = buffer
        .lock()
        .map(|buffer| buffer.limit)
        .unwrap_or(DEFAULT_OUTPUT_LIMIT)
        .max(1) as u64;

    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match (&mut reader).take(max_line).read_until(b'\n', &mut raw).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&raw);
                    let line = text.trim_end_matches(|c| c == '\n' || c == '\r');
                    if let Some(callback) = &on_output {
                        callback(line, is_error);
                    }
                    if let Ok(mut buffer) = buffer.lock() {
                        buffer.push_line(line);
                    }
                }
            }
        }
    })
}

fn take_buffer(buffer: &Mutex<TailBuffer>) -> (String, bool) {
    match buffer.lock() {
        Ok(mut buffer) => buffer.take(),
        Err(_) => (String::new(), false),
    }
}

fn append_line(text: &mut String, line: &str) {
    if !text.is_empty() {
        text.push('\n');
    }
    text.push_str(line);
}
