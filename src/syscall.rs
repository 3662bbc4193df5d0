// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External program invocation.
//!
//! Every device rackops talks to is reached through an existing command line
//! tool, e.g., `snmpget`, `ipmitool`, `ping`, `kubectl`. Calls are described
//! by a typed [`Invocation`] whose arguments are handed to the program as a
//! vector, so nothing is ever glued together into a shell string.

use std::{
    ffi::{OsStr, OsString},
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, instrument};

/// A single call to an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    timeout: Duration,
}

impl Invocation {
    /// Construct new invocation of target program.
    ///
    /// Default timeout is five seconds.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a listing of arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set environment variable for the child process only.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bound the whole call by target duration.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of program being called.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments handed to the program.
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Run the program to completion and capture its output.
    ///
    /// The child is killed if the timeout elapses first.
    ///
    /// # Errors
    ///
    /// - Return [`SyscallError::Spawn`] if program cannot be started.
    /// - Return [`SyscallError::Timeout`] if program outlives the timeout.
    /// - Return [`SyscallError::Failed`] if program exits unsuccessfully.
    #[instrument(skip(self), fields(program = ?self.program), level = "debug")]
    pub async fn run(&self) -> Result<String> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| SyscallError::Timeout {
                program: self.program_lossy(),
                after: self.timeout,
            })?
            .map_err(|source| SyscallError::Spawn {
                program: self.program_lossy(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
        let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

        if !output.status.success() {
            let mut message = String::new();
            if !stdout.is_empty() {
                message.push_str(format!("stdout: {stdout}").as_str());
            }

            if !stderr.is_empty() {
                message.push_str(format!("stderr: {stderr}").as_str());
            }

            return Err(SyscallError::Failed {
                program: self.program_lossy(),
                message: chomp(message),
            });
        }

        let stdout = chomp(stdout);
        debug!("{stdout}");

        Ok(stdout)
    }

    fn program_lossy(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

// INVARIANT: Chomp trailing newlines.
fn chomp(message: String) -> String {
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message)
}

/// External program error types.
#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    /// Program could not be started at all.
    #[error("failed to run {program:?}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Program did not finish in time.
    #[error("command {program:?} timed out after {after:?}")]
    Timeout { program: String, after: Duration },

    /// Program exited with a failure status.
    #[error("command {program:?} failed:\n{message}")]
    Failed { program: String, message: String },
}

/// Friendly result alias :3
type Result<T, E = SyscallError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_invocation() {
        let call = Invocation::new("snmpget")
            .args(["-v", "2c"])
            .arg("pdu1")
            .timeout(Duration::from_secs(2));

        assert_eq!(call.program(), OsStr::new("snmpget"));
        assert_eq!(
            call.arguments(),
            &[OsString::from("-v"), "2c".into(), "pdu1".into()]
        );
    }

    #[test]
    fn chomp_trailing_newline() {
        assert_eq!(chomp("on\n".into()), "on");
        assert_eq!(chomp("on\r\n".into()), "on");
        assert_eq!(chomp("on".into()), "on");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_reports_failure_status() {
        let result = Invocation::new("false").run().await;
        assert!(matches!(result, Err(SyscallError::Failed { .. })));
    }

    #[tokio::test]
    async fn run_reports_missing_program() {
        let result = Invocation::new("rackops-no-such-program").run().await;
        assert!(matches!(result, Err(SyscallError::Spawn { .. })));
    }
}
