//! External command execution with a hard timeout.
//!
//! Output is drained on reader threads so a chatty child cannot block on a
//! full pipe while we poll for exit. A child that outlives its timeout is
//! killed and reaped before the error is returned.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::SyncError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs one backend executable with a fixed environment and timeout.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    program: String,
    timeout: Duration,
    envs: Vec<(String, String)>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            envs: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when `<program> --version` runs successfully.
    pub fn is_available(&self) -> bool {
        let cwd = std::env::temp_dir();
        match self.run(&cwd, &["--version"]) {
            Ok(_) => true,
            Err(e) => {
                debug!(program = %self.program, error = %e, "Command not available");
                false
            }
        }
    }

    /// Run with `dir` as working directory and return stdout (lossy UTF-8).
    pub fn run(&self, dir: &Path, args: &[&str]) -> Result<String, SyncError> {
        self.run_with_env(dir, args, &[])
    }

    /// Like [`run`](Self::run) with extra per-call environment variables.
    pub fn run_with_env(&self, dir: &Path, args: &[&str], extra_env: &[(&str, String)]) -> Result<String, SyncError> {
        let shown = self.command_line(args);
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        for (k, v) in extra_env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn()?;
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = match wait_with_timeout(&mut child, self.timeout)? {
            Some(status) => status,
            None => {
                if let Err(e) = child.kill() {
                    warn!(command = %shown, error = %e, "Failed to kill timed-out command");
                }
                // reap so the child does not linger as a zombie; readers are
                // detached since grandchildren may still hold the pipes
                let _ = child.wait();
                drop((stdout, stderr));
                warn!(command = %shown, timeout_secs = self.timeout.as_secs(), "Command timed out");
                return Err(SyncError::CommandTimeout {
                    command: shown,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let out = join_reader(stdout)?;
        let err = join_reader(stderr)?;
        debug!(
            command = %shown,
            elapsed_ms = start.elapsed().as_millis() as u64,
            status = %status,
            "Command finished"
        );

        if !status.success() {
            return Err(SyncError::CommandFailed {
                command: shown,
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&err).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn command_line(&self, args: &[&str]) -> String {
        let mut s = self.program.clone();
        for a in args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<std::io::Result<Vec<u8>>>> {
    source.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn join_reader(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>, SyncError> {
    match handle {
        None => Ok(Vec::new()),
        Some(h) => match h.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::TaskPanicked("command output reader".to_string())),
        },
    }
}

/// `Ok(None)` when the deadline passed before the child exited.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Option<std::process::ExitStatus>, SyncError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}
