//! Report source: supervision of the report multiplexer subprocess
//!
//! Handles:
//! - Spawning `mpxstats -p <port> -f cgi` (or any configured producer)
//! - Turning its stdout into a sequence of [`Report`]s
//! - Graceful stop (SIGTERM, grace period, SIGKILL) and kill-on-drop

use crate::report::{MalformedPolicy, Report, ReportError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Errors raised by the report source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to start report producer {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("report producer has no stdout")]
    NoStdout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Placeholder substituted with the port in producer arguments
const PORT_PLACEHOLDER: &str = "{port}";

/// Supervised report-producing subprocess
#[derive(Debug)]
pub struct ReportSource {
    port: u16,
    program: PathBuf,
    args: Vec<String>,
    policy: MalformedPolicy,
    grace: Duration,
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
    exit_status: Option<ExitStatus>,
    /// Output ended or producer stopped; only an explicit `open` restarts it
    ended: bool,
}

impl ReportSource {
    /// Source reading `mpxstats -p <port> -f cgi`
    pub fn new(port: u16) -> Self {
        Self {
            port,
            program: PathBuf::from("mpxstats"),
            args: vec![
                "-p".to_string(),
                PORT_PLACEHOLDER.to_string(),
                "-f".to_string(),
                "cgi".to_string(),
            ],
            policy: MalformedPolicy::default(),
            grace: Duration::from_secs(5),
            child: None,
            lines: None,
            exit_status: None,
            ended: false,
        }
    }

    /// Use another producer; `{port}` in `args` is replaced by the port
    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Time allowed between SIGTERM and SIGKILL on [`close`](Self::close)
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn policy(&self) -> MalformedPolicy {
        self.policy
    }

    fn command_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port))
            .collect()
    }

    /// Start the producer unless it is already running
    pub fn open(&mut self) -> Result<(), SourceError> {
        if self.child.is_some() {
            return Ok(());
        }

        let args = self.command_args();
        info!("starting report producer: {:?} {}", self.program, args.join(" "));
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or(SourceError::NoStdout)?;

        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        self.exit_status = None;
        self.ended = false;
        Ok(())
    }

    /// Whether the producer is running and its output has not ended
    pub fn is_streaming(&self) -> bool {
        self.child.is_some() && self.lines.is_some()
    }

    /// Exit status of the last producer, once it has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Read and decode the next report
    ///
    /// Opens the producer if it was never started. `Ok(None)` means the
    /// producer closed its output; the child is then reaped and its status
    /// kept in [`exit_status`](Self::exit_status). Later calls keep returning
    /// `Ok(None)` until [`open`](Self::open) is called again.
    pub async fn next_report(&mut self) -> Result<Option<Report>, SourceError> {
        if self.child.is_none() {
            if self.ended {
                return Ok(None);
            }
            self.open()?;
        }

        loop {
            let Some(lines) = self.lines.as_mut() else {
                return Ok(None);
            };
            let Some(line) = lines.next_line().await? else {
                self.lines = None;
                self.ended = true;
                self.reap().await?;
                return Ok(None);
            };

            let report = Report::parse(&line, self.policy)?;
            if report.is_empty() {
                debug!("skipping datagram without fields: {:?}", line);
                continue;
            }
            return Ok(Some(report));
        }
    }

    async fn reap(&mut self) -> Result<(), SourceError> {
        if let Some(mut child) = self.child.take() {
            let status = child.wait().await?;
            if status.success() {
                info!("report producer exited");
            } else {
                warn!("report producer exited with {}", status);
            }
            self.exit_status = Some(status);
        }
        Ok(())
    }

    /// Stop the producer: SIGTERM, wait for the grace period, then SIGKILL
    ///
    /// Safe to call repeatedly or on a source that was never opened.
    pub async fn close(&mut self) -> Result<(), SourceError> {
        self.lines = None;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.ended = true;

        if let Some(status) = child.try_wait()? {
            self.exit_status = Some(status);
            return Ok(());
        }

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("failed to send SIGTERM to report producer {}: {}", pid, e);
            }
        }

        let status = match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("report producer ignored SIGTERM for {:?}, killing", self.grace);
                child.kill().await?;
                child.wait().await?
            }
        };
        debug!("report producer stopped with {}", status);
        self.exit_status = Some(status);
        Ok(())
    }
}
