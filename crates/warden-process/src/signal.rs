use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus as OsProcessStatus, System, UpdateKind};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    process::{Child, Command},
};
use tracing::{debug, info, warn};

use crate::{DriverConfig, ProcessDriver, ProcessError, ProcessStatus};

type ConsoleInput = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Unix driver: stdin pipe for console commands, signals for liveness and shutdown.
pub struct SignalDriver {
    cfg: DriverConfig,
    pid: Option<u32>,
    child: Option<Child>,
    stdin: Option<ConsoleInput>,
    run_file_ready: bool,
}

impl fmt::Debug for SignalDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalDriver")
            .field("id", &self.cfg.id)
            .field("pid", &self.pid)
            .field("attached", &self.attached())
            .field("has_console", &self.stdin.is_some())
            .finish()
    }
}

impl SignalDriver {
    pub fn new(cfg: DriverConfig) -> Self {
        Self {
            cfg,
            pid: None,
            child: None,
            stdin: None,
            run_file_ready: false,
        }
    }

    /// Constructs the driver and adopts a process already running this server's run file.
    pub fn discover(cfg: DriverConfig) -> Self {
        let mut driver = Self::new(cfg);
        driver.adopt();
        driver
    }

    /// Looks for a live process whose command line names this server's run file.
    ///
    /// Console input for an adopted process goes through `/proc/<pid>/fd/0`; when that cannot be
    /// opened the process is still tracked but `exec_cmd` fails with `NoConsole`.
    pub fn adopt(&mut self) -> Option<u32> {
        let run_file = self.cfg.run_file();
        let pid = find_process(&run_file)?;
        self.pid = Some(pid);
        self.child = None;

        let fd0 = format!("/proc/{pid}/fd/0");
        match std::fs::OpenOptions::new().write(true).open(&fd0) {
            Ok(f) => self.stdin = Some(Box::new(tokio::fs::File::from_std(f))),
            Err(e) => {
                warn!(server_id = %self.cfg.id, pid, error = %e, "cannot open console of adopted process");
                self.stdin = None;
            }
        }
        info!(server_id = %self.cfg.id, pid, "adopted running server process");
        Some(pid)
    }

    fn attached(&self) -> bool {
        self.pid.is_some() && self.child.is_none()
    }

    async fn prepare_run_file(&mut self) -> Result<PathBuf, ProcessError> {
        let run_file = self.cfg.run_file();
        if self.run_file_ready && run_file.is_file() {
            return Ok(run_file);
        }
        if !run_file.is_file() {
            tokio::fs::copy(self.cfg.exec_file(), &run_file)
                .await
                .map_err(|e| {
                    ProcessError::io(format!("copy executable to {}", run_file.display()), e)
                })?;
            debug!(server_id = %self.cfg.id, path = %run_file.display(), "created run file");
        }
        self.run_file_ready = true;
        Ok(run_file)
    }

    async fn wait_gone(&self, pid: u32) -> bool {
        let deadline = tokio::time::Instant::now() + self.cfg.stop_timeout;
        loop {
            if !pid_listed(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl ProcessDriver for SignalDriver {
    fn exists(&self) -> bool {
        self.cfg.exec_file().is_file()
    }

    async fn active(&mut self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };

        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(server_id = %self.cfg.id, pid, ?status, "server process has exited");
                    return false;
                }
                Ok(None) => {
                    if signal_alive(pid) {
                        return true;
                    }
                }
                Err(e) => {
                    warn!(server_id = %self.cfg.id, pid, error = %e, "try_wait failed");
                }
            }
        }

        pid_listed(pid)
    }

    async fn start(&mut self) -> Result<u32, ProcessError> {
        if self.active().await {
            return Err(ProcessError::AlreadyRunning);
        }
        let exec_file = self.cfg.exec_file();
        if !exec_file.is_file() {
            return Err(ProcessError::NotInstalled(exec_file));
        }
        let run_file = self.prepare_run_file().await?;

        let log_file = self.cfg.log_file.clone();
        if let Some(parent) = log_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProcessError::io(format!("create {}", parent.display()), e))?;
        }
        let out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(|e| ProcessError::io(format!("open {}", log_file.display()), e))?;
        let err = out
            .try_clone()
            .map_err(|e| ProcessError::io("duplicate log handle", e))?;

        let mut cmd = Command::new(&run_file);
        cmd.current_dir(&self.cfg.root_dir)
            .env("LD_LIBRARY_PATH", &self.cfg.root_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));

        // The server outlives the supervisor and is adopted again on the next run.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
        let Some(pid) = child.id() else {
            return Err(ProcessError::Os("spawned process has no pid".to_string()));
        };
        self.stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as ConsoleInput);
        self.child = Some(child);
        self.pid = Some(pid);

        info!(server_id = %self.cfg.id, pid, "server process started");
        Ok(pid)
    }

    async fn stop(&mut self) -> Result<(), ProcessError> {
        if !self.active().await {
            return Err(ProcessError::NotRunning);
        }
        let Some(pid) = self.pid else {
            return Err(ProcessError::NotRunning);
        };

        // Closing stdin first lets the server see EOF on its console.
        drop(self.stdin.take());

        match self.child.take() {
            Some(mut child) => {
                if let Err(e) = send_signal(-(pid as i32), libc::SIGTERM) {
                    warn!(server_id = %self.cfg.id, pid, error = %e, "SIGTERM failed; killing");
                    child
                        .kill()
                        .await
                        .map_err(|e| ProcessError::io("kill server process", e))?;
                } else {
                    match tokio::time::timeout(self.cfg.stop_timeout, child.wait()).await {
                        Ok(Ok(status)) => {
                            info!(server_id = %self.cfg.id, pid, ?status, "server process exited");
                        }
                        Ok(Err(e)) => {
                            warn!(server_id = %self.cfg.id, pid, error = %e, "wait failed");
                        }
                        Err(_) => {
                            warn!(
                                server_id = %self.cfg.id,
                                pid,
                                timeout = ?self.cfg.stop_timeout,
                                "server did not exit in time; sending SIGKILL"
                            );
                            let _ = send_signal(-(pid as i32), libc::SIGKILL);
                            child
                                .kill()
                                .await
                                .map_err(|e| ProcessError::io("kill server process", e))?;
                        }
                    }
                }
            }
            None => {
                // Not our child: there is nothing to wait on, so go straight to SIGKILL.
                send_signal(pid as i32, libc::SIGKILL)
                    .map_err(|e| ProcessError::io(format!("kill pid {pid}"), e))?;
                if !self.wait_gone(pid).await {
                    return Err(ProcessError::Timeout {
                        pid,
                        timeout: self.cfg.stop_timeout,
                    });
                }
                info!(server_id = %self.cfg.id, pid, "adopted server process killed");
            }
        }

        self.pid = None;
        Ok(())
    }

    async fn exec_cmd(&mut self, args: &[&str]) -> Result<(), ProcessError> {
        if !self.active().await {
            return Err(ProcessError::NotRunning);
        }
        let pid = self.pid.unwrap_or_default();
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ProcessError::NoConsole(pid));
        };

        let mut line = args.join(" ");
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProcessError::io("write console command", e))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProcessError::io("flush console command", e))?;
        debug!(server_id = %self.cfg.id, pid, command = %line.trim_end(), "console command sent");
        Ok(())
    }

    async fn status(&mut self) -> ProcessStatus {
        let active = self.active().await;
        ProcessStatus {
            pid: self.pid.filter(|_| active),
            attached: self.attached(),
            active,
        }
    }

    fn log_file(&self) -> &Path {
        &self.cfg.log_file
    }
}

fn send_signal(target: i32, signal: i32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(target, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn signal_alive(pid: u32) -> bool {
    send_signal(pid as i32, 0).is_ok()
}

/// Whether the process table lists `pid` as something other than a zombie.
fn pid_listed(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .is_some_and(|p| !matches!(p.status(), OsProcessStatus::Zombie))
}

fn find_process(run_file: &Path) -> Option<u32> {
    let needle = run_file.to_string_lossy();
    let me = std::process::id();
    let mut sys = System::new();
    // Command lines are not loaded by a plain refresh; scripts only show up in them.
    sys.refresh_processes_specifics(
        ProcessRefreshKind::new()
            .with_cmd(UpdateKind::Always)
            .with_exe(UpdateKind::OnlyIfNotSet),
    );
    sys.processes()
        .iter()
        .filter(|(pid, p)| pid.as_u32() != me && !matches!(p.status(), OsProcessStatus::Zombie))
        .find(|(_, p)| {
            p.exe().is_some_and(|exe| exe == run_file)
                || p.cmd().iter().any(|arg| arg.as_str() == needle)
        })
        .map(|(pid, _)| pid.as_u32())
}
