//! Running external tools

use crate::error::{Error, Result};
use std::io::{self, Read};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Timeout for commands that only query state
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

fn describe(program: &str, args: &[&str]) -> String {
    format!("{} {}", program, args.join(" "))
}

/// Runs commands, killing them once the timeout expires
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Runner for short queries
    pub fn query() -> Self {
        Self::new(Some(QUERY_TIMEOUT))
    }

    /// Runner without a timeout, for long running operations
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Run a command and return stdout
    pub fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = describe(program, args);
        debug!(command = %command, "running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // drain both pipes so a chatty child can't block on a full buffer
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.wait(&mut child, &command) {
            Ok(status) => status,
            Err(e) => {
                let _ = stdout.join();
                let _ = stderr.join();
                return Err(e);
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if status.success() {
            Ok(String::from_utf8_lossy(&stdout).to_string())
        } else {
            Err(Error::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
            })
        }
    }

    /// Run a command, returning Ok(true) if it succeeds, Ok(false) if it fails
    pub fn check(&self, program: &str, args: &[&str]) -> Result<bool> {
        match self.run(program, args) {
            Ok(_) => Ok(true),
            Err(Error::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn wait(&self, child: &mut Child, command: &str) -> Result<std::process::ExitStatus> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait()?);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                warn!(command, "command timed out, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout(format!("command '{}'", command)));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Map a failed tool invocation to a specific error where possible
pub fn classify_failure(tool: &'static str, subject: &str, err: Error) -> Error {
    match err {
        Error::CommandFailed { stderr, .. } => {
            if stderr.contains("does not exist") || stderr.contains("not found") {
                Error::NotFound(subject.to_string())
            } else if stderr.contains("already exists") {
                Error::AlreadyExists(subject.to_string())
            } else {
                Error::BackendToolFailure {
                    tool,
                    message: format!("{}: {}", subject, stderr),
                }
            }
        }
        other => other,
    }
}

/// A child process whose stdout is read by the caller
///
/// Stderr is collected on a separate thread while the caller streams.
pub struct PipeReader {
    child: Child,
    command: String,
    stderr: thread::JoinHandle<Vec<u8>>,
}

impl PipeReader {
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let command = describe(program, args);
        debug!(command = %command, "spawning reader");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = drain(child.stderr.take());
        Ok(Self {
            child,
            command,
            stderr,
        })
    }

    pub fn stdout(&mut self) -> Result<&mut ChildStdout> {
        self.child
            .stdout
            .as_mut()
            .ok_or_else(|| Error::Other(format!("no stdout for '{}'", self.command)))
    }

    /// Wait for the child and fail if it exited unsuccessfully
    ///
    /// Output the caller did not consume is discarded.
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut stdout) = self.child.stdout.take() {
            io::copy(&mut stdout, &mut io::sink())?;
        }
        finish_child(self.child, self.command, self.stderr)
    }
}

/// A child process whose stdin is fed by the caller
///
/// Stderr is collected on a separate thread while the caller streams.
pub struct PipeWriter {
    child: Child,
    command: String,
    stderr: thread::JoinHandle<Vec<u8>>,
}

impl PipeWriter {
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let command = describe(program, args);
        debug!(command = %command, "spawning writer");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = drain(child.stderr.take());
        Ok(Self {
            child,
            command,
            stderr,
        })
    }

    pub fn stdin(&mut self) -> Result<&mut ChildStdin> {
        self.child
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Other(format!("no stdin for '{}'", self.command)))
    }

    /// Close stdin, wait for the child and fail if it exited unsuccessfully
    pub fn finish(mut self) -> Result<()> {
        drop(self.child.stdin.take());
        finish_child(self.child, self.command, self.stderr)
    }
}

fn finish_child(
    mut child: Child,
    command: String,
    stderr: thread::JoinHandle<Vec<u8>>,
) -> Result<()> {
    let status = child.wait()?;
    let stderr = stderr.join().unwrap_or_default();
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
        })
    }
}
