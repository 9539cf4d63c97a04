use std::{fmt, path::Path, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

const DEVICE_DIR: &str = "/dev/";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Could not spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {}, stderr: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_owned()))]
    RunError {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("{program} did not finish within {}s", .limit.as_secs())]
    Timeout { program: String, limit: Duration },
    #[error("{program} wrote output that is not utf-8")]
    Utf8 { program: String },
}

/// A single external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
}

impl Cmd {
    pub fn new<S: Into<String>>(program: S, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs workload tools. The orchestrator only ever talks to this trait so a
/// sweep can be exercised without fio or filebench installed.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        cmd: &Cmd,
        limit: Option<Duration>,
    ) -> Result<CommandOutput, CommandError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        cmd: &Cmd,
        limit: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        debug!("Running {cmd}");
        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        let output = match limit {
            Some(limit) => timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| CommandError::Timeout {
                    program: cmd.program.clone(),
                    limit,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| CommandError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8(output.stdout).map_err(|_| CommandError::Utf8 {
            program: cmd.program.clone(),
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(CommandError::RunError {
                program: cmd.program.clone(),
                code: output.status.code(),
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

pub async fn simple_command_with_output(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let cmd = Cmd::new(program, args.iter().map(|x| x.to_string()));
    Ok(SystemRunner.run(&cmd, None).await?.stdout)
}

pub async fn simple_command_with_output_in_dir(
    program: &str,
    args: &[&str],
    dir: &Path,
) -> Result<String, CommandError> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.to_owned(),
            source,
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        return Err(CommandError::RunError {
            program: program.to_owned(),
            code: output.status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(stdout)
}

/// `/dev/nvme0n1` -> `nvme0n1`. Paths outside `/dev/` are returned untouched.
pub fn device_name(device: &str) -> &str {
    device.strip_prefix(DEVICE_DIR).unwrap_or(device)
}

pub fn try_split(value: &str, delimiter: char) -> Vec<String> {
    value
        .split(delimiter)
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_owned())
        .collect()
}

/// Loose boolean parsing for settings written as `1`, `t` or `true`.
pub fn cast_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "t" | "true")
}
