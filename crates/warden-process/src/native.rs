use std::{ffi::c_void, os::windows::process::CommandExt, path::Path, process::Stdio};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use windows_sys::Win32::{
    Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE},
    System::{
        Diagnostics::{
            Debug::WriteProcessMemory,
            ToolHelp::{
                CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW,
                TH32CS_SNAPPROCESS,
            },
        },
        LibraryLoader::{GetModuleHandleA, GetProcAddress},
        Memory::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, VirtualAllocEx, VirtualFreeEx},
        Threading::{
            CreateRemoteThread, INFINITE, OpenProcess, PROCESS_ALL_ACCESS, PROCESS_TERMINATE,
            TerminateProcess, WaitForSingleObject,
        },
    },
};

use crate::{DriverConfig, ProcessDriver, ProcessError, ProcessStatus};

const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

/// Windows driver: process identity by executable name, console commands by remote thread.
#[derive(Debug)]
pub struct NativeDriver {
    cfg: DriverConfig,
    pid: Option<u32>,
    spawned: bool,
}

impl NativeDriver {
    pub fn new(cfg: DriverConfig) -> Self {
        Self {
            cfg,
            pid: None,
            spawned: false,
        }
    }

    pub fn discover(cfg: DriverConfig) -> Self {
        let mut driver = Self::new(cfg);
        driver.adopt();
        driver
    }

    pub fn adopt(&mut self) -> Option<u32> {
        let pid = find_process(&self.exe_name())?;
        info!(server_id = %self.cfg.id, pid, "adopted running server process");
        self.pid = Some(pid);
        self.spawned = false;
        Some(pid)
    }

    fn exe_name(&self) -> String {
        self.cfg
            .run_file()
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn refresh(&mut self) -> Option<u32> {
        self.pid = find_process(&self.exe_name());
        self.pid
    }
}

#[async_trait]
impl ProcessDriver for NativeDriver {
    fn exists(&self) -> bool {
        self.cfg.exec_file().is_file()
    }

    async fn active(&mut self) -> bool {
        self.refresh().is_some()
    }

    async fn start(&mut self) -> Result<u32, ProcessError> {
        if self.active().await {
            return Err(ProcessError::AlreadyRunning);
        }
        let exec_file = self.cfg.exec_file();
        if !exec_file.is_file() {
            return Err(ProcessError::NotInstalled(exec_file));
        }
        let run_file = self.cfg.run_file();
        if !run_file.is_file() {
            tokio::fs::copy(&exec_file, &run_file).await.map_err(|e| {
                ProcessError::io(format!("copy executable to {}", run_file.display()), e)
            })?;
        }

        if let Some(parent) = self.cfg.log_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProcessError::io(format!("create {}", parent.display()), e))?;
        }
        let out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cfg.log_file)
            .map_err(|e| ProcessError::io(format!("open {}", self.cfg.log_file.display()), e))?;
        let err = out
            .try_clone()
            .map_err(|e| ProcessError::io("duplicate log handle", e))?;

        // The console must stay attached to the server so commands can be injected into it.
        let child = std::process::Command::new(&run_file)
            .current_dir(&self.cfg.root_dir)
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .creation_flags(CREATE_NEW_CONSOLE)
            .spawn()
            .map_err(ProcessError::Spawn)?;
        let pid = child.id();
        self.pid = Some(pid);
        self.spawned = true;
        info!(server_id = %self.cfg.id, pid, "server process started");
        Ok(pid)
    }

    async fn stop(&mut self) -> Result<(), ProcessError> {
        let Some(pid) = self.refresh() else {
            return Err(ProcessError::NotRunning);
        };
        terminate(pid)?;
        info!(server_id = %self.cfg.id, pid, "server process terminated");
        self.pid = None;
        self.spawned = false;
        Ok(())
    }

    async fn exec_cmd(&mut self, args: &[&str]) -> Result<(), ProcessError> {
        let Some(pid) = self.refresh() else {
            return Err(ProcessError::NotRunning);
        };
        let mut line = args.join(" ");
        line.push('\n');
        let command = line.clone();
        tokio::task::spawn_blocking(move || inject(pid, command.as_bytes()))
            .await
            .map_err(|e| ProcessError::Os(format!("inject task: {e}")))??;
        debug!(server_id = %self.cfg.id, pid, command = %line.trim_end(), "console command sent");
        Ok(())
    }

    async fn status(&mut self) -> ProcessStatus {
        let pid = self.refresh();
        ProcessStatus {
            pid,
            attached: pid.is_some() && !self.spawned,
            active: pid.is_some(),
        }
    }

    fn log_file(&self) -> &Path {
        &self.cfg.log_file
    }
}

struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn last_error(what: &str) -> ProcessError {
    ProcessError::Os(format!("{what}: {}", std::io::Error::last_os_error()))
}

fn find_process(exe_name: &str) -> Option<u32> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        warn!(error = %std::io::Error::last_os_error(), "process snapshot failed");
        return None;
    }
    let snapshot = OwnedHandle(snapshot);

    let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;
    if unsafe { Process32FirstW(snapshot.0, &mut entry) } == 0 {
        return None;
    }
    loop {
        let len = entry
            .szExeFile
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(entry.szExeFile.len());
        let name = String::from_utf16_lossy(&entry.szExeFile[..len]);
        if name.eq_ignore_ascii_case(exe_name) {
            return Some(entry.th32ProcessID);
        }
        if unsafe { Process32NextW(snapshot.0, &mut entry) } == 0 {
            return None;
        }
    }
}

fn terminate(pid: u32) -> Result<(), ProcessError> {
    let handle = unsafe { OpenProcess(PROCESS_TERMINATE, 0, pid) };
    if handle.is_null() {
        return Err(last_error("OpenProcess"));
    }
    let handle = OwnedHandle(handle);
    if unsafe { TerminateProcess(handle.0, 1) } == 0 {
        return Err(last_error("TerminateProcess"));
    }
    Ok(())
}

/// Writes `command` into the target's address space and runs it on a remote thread.
fn inject(pid: u32, command: &[u8]) -> Result<(), ProcessError> {
    let process = unsafe { OpenProcess(PROCESS_ALL_ACCESS, 0, pid) };
    if process.is_null() {
        return Err(last_error("OpenProcess"));
    }
    let process = OwnedHandle(process);

    let mut buf = command.to_vec();
    buf.push(0);

    let remote = unsafe {
        VirtualAllocEx(
            process.0,
            std::ptr::null(),
            buf.len(),
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    if remote.is_null() {
        return Err(last_error("VirtualAllocEx"));
    }

    let result = (|| {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                process.0,
                remote,
                buf.as_ptr() as *const c_void,
                buf.len(),
                &mut written,
            )
        };
        if ok == 0 || written != buf.len() {
            return Err(last_error("WriteProcessMemory"));
        }

        let kernel32 = unsafe { GetModuleHandleA(c"kernel32.dll".as_ptr() as *const u8) };
        if kernel32.is_null() {
            return Err(last_error("GetModuleHandleA"));
        }
        let Some(entry) = (unsafe { GetProcAddress(kernel32, c"LoadLibraryA".as_ptr() as *const u8) })
        else {
            return Err(last_error("GetProcAddress"));
        };
        let start: unsafe extern "system" fn(*mut c_void) -> u32 =
            unsafe { std::mem::transmute(entry) };

        let thread = unsafe {
            CreateRemoteThread(
                process.0,
                std::ptr::null(),
                0,
                Some(start),
                remote,
                0,
                std::ptr::null_mut(),
            )
        };
        if thread.is_null() {
            return Err(last_error("CreateRemoteThread"));
        }
        let thread = OwnedHandle(thread);
        unsafe {
            WaitForSingleObject(thread.0, INFINITE);
        }
        Ok(())
    })();

    unsafe {
        VirtualFreeEx(process.0, remote, 0, MEM_RELEASE);
    }
    result
}
