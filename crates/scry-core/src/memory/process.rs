//! `ReadProcessMemory` based transport for a local process.

use std::ffi::c_void;

use tracing::debug;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, PROCESSENTRY32W,
    Process32FirstW, Process32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ,
    PROCESS_VM_WRITE,
};

use crate::error::{Error, Result};
use crate::memory::transport::Transport;

/// Identity of an attached process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub base_address: u64,
    pub module_size: u32,
}

pub struct ProcessTransport {
    handle: HANDLE,
    pub info: ProcessInfo,
}

// SAFETY: a process handle is a kernel object reference usable from any
// thread; ReadProcessMemory/WriteProcessMemory are thread-safe.
unsafe impl Send for ProcessTransport {}
unsafe impl Sync for ProcessTransport {}

impl ProcessTransport {
    /// Open a process by PID with read/write access.
    pub fn open(pid: u32) -> Result<Self> {
        // SAFETY: OpenProcess has no memory-safety preconditions.
        let handle = unsafe {
            OpenProcess(
                PROCESS_VM_READ | PROCESS_VM_WRITE | PROCESS_VM_OPERATION | PROCESS_QUERY_INFORMATION,
                false,
                pid,
            )
        }
        .map_err(|e| Error::ProcessOpenFailed(format!("pid {}: {}", pid, e)))?;

        let info = match main_module(pid) {
            Ok(info) => info,
            Err(e) => {
                // SAFETY: handle was returned by OpenProcess above.
                let _ = unsafe { CloseHandle(handle) };
                return Err(e);
            }
        };
        debug!(
            "Opened process {} ({}) base={:#x}",
            info.name, info.pid, info.base_address
        );

        Ok(Self { handle, info })
    }

    /// Find a process by executable name and open it.
    pub fn find_and_open(name: &str) -> Result<Self> {
        let pid = find_process_id(name)?;
        Self::open(pid)
    }

    pub fn base_address(&self) -> u64 {
        self.info.base_address
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        // SAFETY: handle is owned by this value and closed exactly once.
        let _ = unsafe { CloseHandle(self.handle) };
    }
}

impl Transport for ProcessTransport {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        if address == 0 {
            return Err(Error::InvalidAddress(address));
        }
        let mut read = 0usize;
        // SAFETY: buf is a valid writable slice of buf.len() bytes.
        unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                Some(&mut read),
            )
        }
        .map_err(|e| Error::read_failed(address, e.to_string()))?;

        if read != buf.len() {
            return Err(Error::read_failed(
                address,
                format!("partial read: {} of {} bytes", read, buf.len()),
            ));
        }
        Ok(())
    }

    fn write_buffer(&self, address: u64, data: &[u8]) -> Result<()> {
        if address == 0 {
            return Err(Error::InvalidAddress(address));
        }
        let mut written = 0usize;
        // SAFETY: data is a valid readable slice of data.len() bytes.
        unsafe {
            WriteProcessMemory(
                self.handle,
                address as *const c_void,
                data.as_ptr().cast(),
                data.len(),
                Some(&mut written),
            )
        }
        .map_err(|e| Error::write_failed(address, e.to_string()))?;

        if written != data.len() {
            return Err(Error::write_failed(
                address,
                format!("partial write: {} of {} bytes", written, data.len()),
            ));
        }
        Ok(())
    }
}

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

fn find_process_id(name: &str) -> Result<u32> {
    // SAFETY: snapshot handle is closed before returning.
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
            .map_err(|e| Error::ProcessNotFound(e.to_string()))?;

        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        let mut found = None;
        if Process32FirstW(snapshot, &mut entry).is_ok() {
            loop {
                if wide_to_string(&entry.szExeFile).eq_ignore_ascii_case(name) {
                    found = Some(entry.th32ProcessID);
                    break;
                }
                if Process32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }
        let _ = CloseHandle(snapshot);

        found.ok_or_else(|| Error::ProcessNotFound(name.to_string()))
    }
}

fn main_module(pid: u32) -> Result<ProcessInfo> {
    // SAFETY: snapshot handle is closed before returning.
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid)
            .map_err(|e| Error::ProcessOpenFailed(format!("module snapshot: {}", e)))?;

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };

        // The first module in the snapshot is the executable itself.
        let result = if Module32FirstW(snapshot, &mut entry).is_ok() {
            Ok(ProcessInfo {
                pid,
                name: wide_to_string(&entry.szModule),
                base_address: entry.modBaseAddr as u64,
                module_size: entry.modBaseSize,
            })
        } else {
            Err(Error::ProcessOpenFailed(format!("pid {}: no modules", pid)))
        };
        let _ = CloseHandle(snapshot);
        result
    }
}
