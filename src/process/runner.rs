//! Subprocess runner trait and the tokio-backed implementation.
//!
//! Commands are always spawned from an explicit program path and argument
//! vector; nothing is routed through a shell.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

/// Error type for subprocess execution.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The program did not finish within its time limit and was killed.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The program ran but exited unsuccessfully.
    #[error("{program} exited with status {code:?}: {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Talking to the running program failed.
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl SubprocessError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A privileged external command: program, arguments and optional stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedCommand {
    program: PathBuf,
    args: Vec<OsString>,
    stdin: Option<String>,
}

impl PrivilegedCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` to the command's standard input.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn input(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl fmt::Display for PrivilegedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Trait for running privileged commands.
///
/// Implementations must guarantee that a command never outlives its timeout:
/// when the limit passes the child is killed and reaped before returning.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run a command to completion and return its standard output.
    fn run(
        &self,
        command: &PrivilegedCommand,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, SubprocessError>> + Send;

    /// Launch a long-running command whose output is read line by line.
    fn spawn_streaming(
        &self,
        command: &PrivilegedCommand,
    ) -> Result<StreamingChild, SubprocessError>;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        command: &PrivilegedCommand,
        timeout: Duration,
    ) -> Result<String, SubprocessError> {
        debug!(%command, "running privileged command");
        let program = command.program_name();

        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| SubprocessError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::time::timeout(timeout, async {
            if let (Some(mut pipe), Some(input)) = (stdin, command.input()) {
                pipe.write_all(input.as_bytes()).await?;
            }
            let (stdout, stderr) = tokio::join!(read_pipe(stdout), read_pipe(stderr));
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, stdout?, stderr?))
        })
        .await;

        match outcome {
            Ok(Ok((status, stdout, _))) if status.success() => Ok(stdout),
            Ok(Ok((status, _, stderr))) => Err(SubprocessError::Exit {
                program,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            }),
            Ok(Err(source)) => {
                reap(&mut child).await;
                Err(SubprocessError::Io { program, source })
            }
            Err(_) => {
                warn!(%command, ?timeout, "privileged command timed out, killing it");
                reap(&mut child).await;
                Err(SubprocessError::Timeout { program, timeout })
            }
        }
    }

    fn spawn_streaming(
        &self,
        command: &PrivilegedCommand,
    ) -> Result<StreamingChild, SubprocessError> {
        StreamingChild::spawn(command)
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn reap(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!("kill failed, child already gone: {err}");
    }
    if let Err(err) = child.wait().await {
        warn!("failed to reap child process: {err}");
    }
}

/// A long-running child whose stdout and stderr are read as lines.
pub struct StreamingChild {
    child: Child,
    pid: u32,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
}

impl StreamingChild {
    /// Spawn `command` with both output streams captured.
    pub fn spawn(command: &PrivilegedCommand) -> Result<Self, SubprocessError> {
        let program = command.program_name();
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| SubprocessError::Spawn {
                program: program.clone(),
                source,
            })?;

        let missing = |what: &str| SubprocessError::Spawn {
            program: program.clone(),
            source: io::Error::other(format!("{what} unavailable after spawn")),
        };
        let pid = child.id().ok_or_else(|| missing("process id"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        debug!(pid, %command, "launched streaming child");

        Ok(Self {
            child,
            pid,
            stdout: BufReader::new(stdout).lines(),
            stderr,
        })
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Read the next line from either output stream.
    ///
    /// Returns `Ok(None)` once stdout reaches end of file. Cancel safe.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let Some(stderr) = self.stderr.as_mut() else {
                return self.stdout.next_line().await;
            };

            let stderr_line = tokio::select! {
                line = self.stdout.next_line() => return line,
                line = stderr.next_line() => line,
            };

            match stderr_line {
                Ok(Some(line)) => return Ok(Some(line)),
                // stderr closed or broken: keep following stdout alone
                _ => self.stderr = None,
            }
        }
    }

    /// Force-kill the child and wait for it to be reaped.
    pub async fn terminate(mut self) {
        debug!(pid = self.pid, "terminating streaming child");
        reap(&mut self.child).await;
    }
}

impl fmt::Debug for StreamingChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingChild")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}
