//! Execution wrapper for the external tools the system backend drives.
//!
//! Shell integration stays isolated here so backend logic can be exercised
//! with a scripted [`CommandRunner`] instead of real binaries.

use ironseal_core::error::{IronsealError, IronsealResult};
use ironseal_provider::{CommandOutput, CommandRunner};
use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Runs host binaries with a per-invocation timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn wait_with_timeout(
        &self,
        program: &str,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> IronsealResult<CommandOutput> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(IronsealError::Provider(format!(
                "{program} timed out after {:?}",
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| IronsealError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| IronsealError::Provider("stderr reader thread panicked".into()))??;

        Ok(CommandOutput {
            status: exit_status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl CommandRunner for SystemRunner {
    type Error = IronsealError;

    fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> IronsealResult<CommandOutput> {
        let mut command = Command::new(program);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command
            .spawn()
            .map_err(|err| IronsealError::Provider(format!("failed to spawn {program}: {err}")))?;

        if let Some(payload) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(payload)?;
                pipe.flush().ok();
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(program, child, stdout_pipe, stderr_pipe)
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<IronsealResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> IronsealResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

/// Older cryptsetup builds only know the `luks*` spelling of some actions.
pub(crate) fn action_unsupported(output: &CommandOutput) -> bool {
    let lower = output.diagnostic().to_ascii_lowercase();
    lower.contains("unknown action")
        || lower.contains("unknown command")
        || lower.contains("invalid action")
        || lower.contains("invalid command")
        || lower.contains("unknown option")
}

fn or_placeholder(diagnostic: &str) -> String {
    let trimmed = diagnostic.trim();
    if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    }
}

fn privilege_problem(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
}

fn missing_device(lower: &str) -> bool {
    lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
}

pub(crate) fn classify_open_failure(mapping: &str, node: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = or_placeholder(diagnostic);

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("keyslot")
        || lower.contains("key slot")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        return format!(
            "cryptsetup rejected the passphrase for `{node}` (mapping `{mapping}`): {diagnostic}"
        );
    }
    if privilege_problem(&lower) {
        return format!(
            "cryptsetup could not open `{node}` as `{mapping}`: {diagnostic}. This usually requires root"
        );
    }
    if missing_device(&lower) {
        return format!(
            "cryptsetup could not access `{node}` for mapping `{mapping}`: {diagnostic}. Confirm the partition node exists"
        );
    }
    format!("cryptsetup failed to open `{node}` as `{mapping}`: {diagnostic}")
}

pub(crate) fn classify_format_failure(node: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = or_placeholder(diagnostic);

    if lower.contains("volume key") && (lower.contains("invalid") || lower.contains("size")) {
        return format!("volume key rejected while formatting `{node}`: {diagnostic}");
    }
    if lower.contains("in use") || lower.contains("busy") {
        return format!("`{node}` is in use and cannot be formatted: {diagnostic}");
    }
    if privilege_problem(&lower) {
        return format!("cryptsetup could not format `{node}`: {diagnostic}. This usually requires root");
    }
    if missing_device(&lower) {
        return format!("cryptsetup could not access `{node}`: {diagnostic}. Confirm the partition node exists");
    }
    format!("cryptsetup failed to format `{node}`: {diagnostic}")
}

pub(crate) fn classify_close_failure(mapping: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = or_placeholder(diagnostic);
    if privilege_problem(&lower) {
        return format!("cryptsetup could not close `{mapping}`: {diagnostic}. This usually requires root");
    }
    if lower.contains("busy") || lower.contains("in use") {
        return format!("mapping `{mapping}` is still in use: {diagnostic}");
    }
    format!("cryptsetup failed to close `{mapping}`: {diagnostic}")
}

/// Mapping already gone counts as closed.
pub(crate) fn mapping_absent(output: &CommandOutput) -> bool {
    let lower = output.diagnostic().to_ascii_lowercase();
    lower.contains("does not exist") || lower.contains("doesn't exist") || lower.contains("not active")
}
