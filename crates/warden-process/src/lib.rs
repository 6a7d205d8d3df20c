//! Process control for externally-run dedicated server executables.
//!
//! A [`ProcessDriver`] owns exactly one server process: it can start it, stop it, check whether it
//! is alive, write console commands to it and tail its console log. Two variants exist and one is
//! picked per platform by [`platform_driver`]:
//!
//! - [`SignalDriver`] (unix): spawns the executable with a piped stdin, checks liveness with a
//!   zero signal and stops with SIGTERM escalating to SIGKILL.
//! - [`NativeDriver`] (windows): identifies the process by enumerating the process table and
//!   delivers console commands through the Win32 process APIs.
//!
//! Both variants adopt a process left running by a previous supervisor session when they are
//! constructed, so a supervisor restart does not orphan running servers.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;

mod log_tail;
#[cfg(windows)]
mod native;
#[cfg(unix)]
mod signal;

pub use log_tail::{scan_log, tail_lines};
#[cfg(windows)]
pub use native::NativeDriver;
#[cfg(unix)]
pub use signal::SignalDriver;

/// Graceful stop window before a server process is force-killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(unix)]
pub const EXEC_NAME: &str = "bedrock_server";
#[cfg(windows)]
pub const EXEC_NAME: &str = "bedrock_server.exe";

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("server process is already running")]
    AlreadyRunning,
    #[error("server process is not running")]
    NotRunning,
    #[error("server executable not found: {}", .0.display())]
    NotInstalled(PathBuf),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("spawn server process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server process {pid} still alive {timeout:?} after kill")]
    Timeout { pid: u32, timeout: Duration },
    #[error("console input is not available for pid {0}")]
    NoConsole(u32),
    #[error("{0}")]
    Os(String),
}

impl ProcessError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Where a server lives on disk and how its process is named.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub id: String,
    pub root_dir: PathBuf,
    pub log_file: PathBuf,
    pub stop_timeout: Duration,
}

impl DriverConfig {
    pub fn new(id: impl Into<String>, root_dir: impl Into<PathBuf>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root_dir: root_dir.into(),
            log_file: log_file.into(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// The executable shipped in the distribution archive.
    pub fn exec_file(&self) -> PathBuf {
        self.root_dir.join(EXEC_NAME)
    }

    /// Per-server copy of the executable that is actually run.
    ///
    /// Its path is what identifies the server's process in the OS process table.
    pub fn run_file(&self) -> PathBuf {
        #[cfg(windows)]
        {
            self.root_dir.join(format!("bedrock_server_{}.exe", self.id))
        }
        #[cfg(not(windows))]
        {
            self.root_dir.join(format!("bedrock_server_{}", self.id))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub pid: Option<u32>,
    /// Adopted from a previous session rather than spawned by this driver.
    pub attached: bool,
    pub active: bool,
}

#[async_trait]
pub trait ProcessDriver: Send + Sync + std::fmt::Debug {
    /// Whether the server executable is installed.
    fn exists(&self) -> bool;

    /// Positively confirms that the OS process is alive.
    async fn active(&mut self) -> bool;

    /// Starts the process and returns its pid.
    async fn start(&mut self) -> Result<u32, ProcessError>;

    async fn stop(&mut self) -> Result<(), ProcessError>;

    async fn restart(&mut self) -> Result<u32, ProcessError> {
        self.stop().await?;
        self.start().await
    }

    /// Sends one console command line made of `args` joined by spaces.
    async fn exec_cmd(&mut self, args: &[&str]) -> Result<(), ProcessError>;

    async fn status(&mut self) -> ProcessStatus;

    fn log_file(&self) -> &Path;

    async fn scan_log(&self, lines: usize) -> Result<String, ProcessError> {
        scan_log(self.log_file(), lines).await
    }
}

/// Builds the driver for the current platform and adopts an already-running process if one is
/// found for this server.
pub fn platform_driver(cfg: DriverConfig) -> Box<dyn ProcessDriver> {
    #[cfg(unix)]
    {
        Box::new(SignalDriver::discover(cfg))
    }
    #[cfg(windows)]
    {
        Box::new(NativeDriver::discover(cfg))
    }
}
