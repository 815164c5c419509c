//! Subprocess-style command runner contract.

use std::error::Error;

/// Captured result of one external tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr, fall back to stdout, for error messages.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }
}

/// Runs an external program and reports `(status, stdout, stderr)`.
///
/// A non-zero exit status is not an error at this layer; only failures to
/// spawn, feed or reap the process are.
pub trait CommandRunner {
    type Error: Error + Send + Sync + 'static;

    fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Self::Error>;
}
