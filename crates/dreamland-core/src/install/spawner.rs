//! Spawning and reading the privileged operation.
//!
//! The operation itself is opaque to the manager: it is an external command
//! described by an [`OperationSpec`]. This module starts it with piped
//! output and reads that output line by line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::{Child, Command};

use super::InstallError;

/// Maximum length of a single output line; longer lines are truncated.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Description of the privileged operation to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Program to execute (a path, or a name looked up on `PATH`).
    pub command: String,

    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl OperationSpec {
    /// Start building a spec.
    #[must_use]
    pub fn builder() -> OperationSpecBuilder {
        OperationSpecBuilder::default()
    }

    /// Resolve the program to an existing file.
    ///
    /// Commands containing a path separator are checked as given; bare names
    /// are searched on `PATH`.
    #[must_use]
    pub fn resolve_program(&self) -> Option<PathBuf> {
        let command = Path::new(&self.command);
        if command.components().count() > 1 || command.is_absolute() {
            return command.is_file().then(|| command.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(command))
            .find(|candidate| candidate.is_file())
    }

    /// Check that the operation can be started on this host.
    ///
    /// # Errors
    ///
    /// Returns `InstallError::EnvironmentUnsupported` if the command is
    /// empty or missing, or the working directory does not exist.
    pub fn validate(&self) -> Result<PathBuf, InstallError> {
        if self.command.trim().is_empty() {
            return Err(InstallError::EnvironmentUnsupported {
                reason: "no installer command configured".to_string(),
            });
        }
        if let Some(cwd) = &self.cwd {
            if !cwd.is_dir() {
                return Err(InstallError::EnvironmentUnsupported {
                    reason: format!("working directory {} does not exist", cwd.display()),
                });
            }
        }
        self.resolve_program()
            .ok_or_else(|| InstallError::EnvironmentUnsupported {
                reason: format!("installer command '{}' not found", self.command),
            })
    }
}

/// Builder for [`OperationSpec`].
#[derive(Debug, Default)]
pub struct OperationSpecBuilder {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl OperationSpecBuilder {
    /// Set the program.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> OperationSpec {
        OperationSpec {
            command: self.command,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
        }
    }
}

/// A started operation.
pub(crate) struct SpawnedOperation {
    pub(crate) child: Child,
    pub(crate) pid: u32,
}

/// Start the operation with piped stdout/stderr.
///
/// The child is not killed when its handle is dropped: a partially applied
/// privileged operation must run to completion. On Unix it also leads its
/// own process group, so a terminal interrupt aimed at the manager does not
/// reach it.
pub(crate) fn spawn(spec: &OperationSpec) -> Result<SpawnedOperation, InstallError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| InstallError::from_io(format!("failed to start '{}'", spec.command), e))?;
    // Only `None` once the child has been reaped, which cannot happen yet.
    let pid = child.id().unwrap_or_default();

    Ok(SpawnedOperation { child, pid })
}

/// Read one line of at most `max_len` bytes, without its line terminator.
///
/// Returns `Ok(None)` at EOF. Bytes beyond `max_len` on the same line are
/// discarded. Invalid UTF-8 is replaced lossily.
pub(crate) async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> std::io::Result<Option<String>> {
    let mut bytes = Vec::with_capacity(max_len.min(8192));
    let mut total_read = 0usize;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if total_read == 0 {
                return Ok(None);
            }
            break;
        }

        let (used, done) = memchr::memchr(b'\n', available)
            .map_or((available.len(), false), |pos| (pos + 1, true));

        let remaining_capacity = max_len.saturating_sub(bytes.len());
        let to_keep = used.min(remaining_capacity);
        bytes.extend_from_slice(&available[..to_keep]);

        reader.consume(used);
        total_read += used;

        if done {
            break;
        }
    }

    if bytes.last() == Some(&b'\n') {
        bytes.pop();
    }
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn stdout_of(spec: &OperationSpec) -> Vec<String> {
        let mut spawned = spawn(spec).unwrap();
        let stdout = spawned.child.stdout.take().unwrap();
        let mut reader = tokio::io::BufReader::new(stdout);
        let mut lines = Vec::new();
        while let Some(line) = read_line_bounded(&mut reader, MAX_LINE_LENGTH).await.unwrap() {
            lines.push(line);
        }
        assert!(spawned.child.wait().await.unwrap().success());
        lines
    }

    /// Field 5 of `/proc/<pid>/stat`, counted after the parenthesised name.
    #[cfg(target_os = "linux")]
    fn pgid_from_stat(stat: &str) -> u32 {
        let after_name = &stat[stat.rfind(')').unwrap() + 1..];
        after_name.split_whitespace().nth(2).unwrap().parse().unwrap()
    }

    #[cfg(target_os = "linux")]
    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_installer_leads_its_own_process_group() {
        let spec = OperationSpec::builder()
            .command("sh")
            .args(["-c", "cat /proc/$$/stat"])
            .build();

        let mut spawned = spawn(&spec).unwrap();
        let pid = spawned.pid;
        let stdout = spawned.child.stdout.take().unwrap();
        let mut reader = tokio::io::BufReader::new(stdout);
        let stat = read_line_bounded(&mut reader, MAX_LINE_LENGTH)
            .await
            .unwrap()
            .unwrap();
        assert!(spawned.child.wait().await.unwrap().success());

        let installer_group = pgid_from_stat(&stat);
        let own_group = pgid_from_stat(&std::fs::read_to_string("/proc/self/stat").unwrap());
        assert_eq!(installer_group, pid);
        assert_ne!(installer_group, own_group);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_installer_sees_configured_environment() {
        let spec = OperationSpec::builder()
            .command("sh")
            .args(["-c", "echo \"$DREAMLAND_MODE:$DREAMLAND_TARGET\""])
            .env("DREAMLAND_MODE", "install")
            .env("DREAMLAND_TARGET", "/system/framework")
            .build();

        assert_eq!(stdout_of(&spec).await, ["install:/system/framework"]);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_installer_runs_in_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.zip"), b"").unwrap();
        let spec = OperationSpec::builder()
            .command("sh")
            .args(["-c", "ls"])
            .cwd(dir.path())
            .build();

        assert_eq!(stdout_of(&spec).await, ["payload.zip"]);
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_start_failure_names_the_installer() {
        let spec = OperationSpec::builder()
            .command("/nonexistent/dreamland/install.sh")
            .build();

        let Err(err) = spawn(&spec) else {
            panic!("missing installer started");
        };
        assert!(err.to_string().contains("/nonexistent/dreamland/install.sh"));
    }

    #[tokio::test]
    async fn test_read_line_bounded_lines() {
        let mut reader: &[u8] = b"first\r\nsecond\nlast";
        assert_eq!(
            read_line_bounded(&mut reader, 1024).await.unwrap().as_deref(),
            Some("first")
        );
        assert_eq!(
            read_line_bounded(&mut reader, 1024).await.unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(
            read_line_bounded(&mut reader, 1024).await.unwrap().as_deref(),
            Some("last")
        );
        assert_eq!(read_line_bounded(&mut reader, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_bounded_truncates() {
        let mut reader: &[u8] = b"abcdefgh\nnext\n";
        assert_eq!(
            read_line_bounded(&mut reader, 4).await.unwrap().as_deref(),
            Some("abcd")
        );
        assert_eq!(
            read_line_bounded(&mut reader, 4).await.unwrap().as_deref(),
            Some("next")
        );
    }

    #[tokio::test]
    async fn test_read_line_bounded_empty_line() {
        let mut reader: &[u8] = b"\n";
        assert_eq!(
            read_line_bounded(&mut reader, 16).await.unwrap().as_deref(),
            Some("")
        );
        assert_eq!(read_line_bounded(&mut reader, 16).await.unwrap(), None);
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let spec = OperationSpec::builder().command("  ").build();
        assert!(matches!(
            spec.validate(),
            Err(InstallError::EnvironmentUnsupported { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_cwd() {
        let spec = OperationSpec::builder()
            .command("sh")
            .cwd("/nonexistent/dreamland/cwd")
            .build();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_resolves_path_and_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("install.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        let spec = OperationSpec::builder()
            .command(script.to_string_lossy())
            .build();
        assert_eq!(spec.validate().unwrap(), script);

        let missing = OperationSpec::builder()
            .command(dir.path().join("missing.sh").to_string_lossy())
            .build();
        assert!(missing.validate().is_err());

        let on_path = OperationSpec::builder().command("sh").build();
        assert!(on_path.resolve_program().is_some());
    }
}
