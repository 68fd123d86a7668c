//! Windows process start: create suspended, have a remote thread call
//! `LoadLibraryW` on the agent path, resume.

use super::{ExitReport, InjectError, TargetCommand};
use crate::snapshot::{MemoryCounters, ProcessTimes};
use chrono::{DateTime, TimeDelta, Utc};
use std::ffi::{c_void, OsStr, OsString};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::time::Duration;

use windows::core::{s, w, PCWSTR, PWSTR};
use windows::Win32::Foundation::{FALSE, FILETIME, HANDLE, WAIT_TIMEOUT};
use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows::Win32::System::ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use windows::Win32::System::Threading::{
    CreateProcessW, CreateRemoteThread, GetExitCodeProcess, GetProcessTimes, ResumeThread,
    TerminateProcess, WaitForSingleObject, CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, INFINITE,
    LPTHREAD_START_ROUTINE, NORMAL_PRIORITY_CLASS, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION,
    STARTUPINFOW,
};

/// 100 ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

#[derive(Debug)]
pub(super) struct Process {
    process: OwnedHandle,
    pid: u32,
}

struct Created {
    process: OwnedHandle,
    thread: OwnedHandle,
    pid: u32,
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle())
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Sorted `KEY=VALUE\0...\0\0` block: the inherited environment plus `extra`.
fn environment_block(extra: &[(String, String)]) -> Vec<u16> {
    let mut vars: Vec<(OsString, OsString)> = std::env::vars_os()
        .filter(|(k, _)| !extra.iter().any(|(e, _)| OsStr::new(e).eq_ignore_ascii_case(k)))
        .collect();
    vars.extend(extra.iter().map(|(k, v)| (k.into(), v.into())));
    vars.sort_by_key(|(k, _)| k.to_ascii_uppercase());

    let mut block = Vec::new();
    for (key, value) in vars {
        block.extend(key.encode_wide());
        block.push(u16::from(b'='));
        block.extend(value.encode_wide());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

fn create(target: &TargetCommand, flags: PROCESS_CREATION_FLAGS) -> Result<Created, InjectError> {
    let application = wide(target.program.as_os_str());
    let mut command_line = wide(OsStr::new(&target.command_line));
    let environment = environment_block(&target.env);
    let startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    let mut info = PROCESS_INFORMATION::default();

    // SAFETY: every buffer is NUL-terminated and outlives the call.
    unsafe {
        CreateProcessW(
            PCWSTR(application.as_ptr()),
            PWSTR(command_line.as_mut_ptr()),
            None,
            None,
            FALSE,
            flags | CREATE_UNICODE_ENVIRONMENT,
            Some(environment.as_ptr() as *const c_void),
            PCWSTR::null(),
            &startup,
            &mut info,
        )
    }
    .map_err(|e| InjectError::ProcessCreateFailed {
        path: target.program.clone(),
        source: e.into(),
    })?;

    // SAFETY: both handles were just returned to us and are owned by nobody else.
    let (process, thread) = unsafe {
        (
            OwnedHandle::from_raw_handle(info.hProcess.0),
            OwnedHandle::from_raw_handle(info.hThread.0),
        )
    };
    Ok(Created {
        process,
        thread,
        pid: info.dwProcessId,
    })
}

/// Terminates a suspended target unless disarmed.
struct KillOnError<'a> {
    process: &'a OwnedHandle,
    armed: bool,
}

impl Drop for KillOnError<'_> {
    fn drop(&mut self) {
        if self.armed {
            // SAFETY: the handle is valid for the guard's lifetime.
            if let Err(e) = unsafe { TerminateProcess(raw(self.process), 1) } {
                tracing::error!(error = %e, "could not terminate suspended target");
            }
        }
    }
}

pub(super) fn inject(
    target: &TargetCommand,
    agent: &Path,
    remote_load_timeout: Duration,
) -> Result<Process, InjectError> {
    let created = create(target, NORMAL_PRIORITY_CLASS | CREATE_SUSPENDED)?;
    let mut guard = KillOnError {
        process: &created.process,
        armed: true,
    };
    let process = raw(&created.process);

    // kernel32 is mapped at the same address in every process of a session.
    // SAFETY: plain lookups with static, NUL-terminated names.
    let load_library = unsafe {
        let kernel32 =
            GetModuleHandleW(w!("kernel32.dll")).map_err(|e| InjectError::LoaderNotFound {
                source: e.into(),
            })?;
        GetProcAddress(kernel32, s!("LoadLibraryW")).ok_or_else(|| {
            InjectError::LoaderNotFound {
                source: std::io::Error::last_os_error(),
            }
        })?
    };

    let path = wide(agent.as_os_str());
    let size = path.len() * std::mem::size_of::<u16>();
    // SAFETY: `process` is a live handle with full access.
    let remote = unsafe { VirtualAllocEx(process, None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
    if remote.is_null() {
        return Err(InjectError::RemoteAllocFailed {
            source: std::io::Error::last_os_error(),
        });
    }

    let loaded = load_in_target(process, remote, &path, size, load_library, remote_load_timeout);

    // SAFETY: `remote` was allocated above in the same process.
    if let Err(e) = unsafe { VirtualFreeEx(process, remote, 0, MEM_RELEASE) } {
        tracing::warn!(error = %e, "could not free agent path in target");
    }
    loaded?;

    // SAFETY: the primary thread handle is valid.
    if unsafe { ResumeThread(raw(&created.thread)) } == u32::MAX {
        return Err(InjectError::ResumeFailed {
            source: std::io::Error::last_os_error(),
        });
    }
    guard.armed = false;
    drop(guard);

    Ok(Process {
        process: created.process,
        pid: created.pid,
    })
}

fn load_in_target(
    process: HANDLE,
    remote: *mut c_void,
    path: &[u16],
    size: usize,
    load_library: unsafe extern "system" fn() -> isize,
    timeout: Duration,
) -> Result<(), InjectError> {
    // SAFETY: `remote` holds at least `size` bytes; `path` is `size` bytes long.
    unsafe { WriteProcessMemory(process, remote, path.as_ptr() as *const c_void, size, None) }
        .map_err(|e| InjectError::RemoteWriteFailed { source: e.into() })?;

    // SAFETY: LoadLibraryW takes one pointer argument and returns a handle,
    // matching the thread start routine ABI.
    let start: LPTHREAD_START_ROUTINE = unsafe {
        Some(std::mem::transmute::<
            unsafe extern "system" fn() -> isize,
            unsafe extern "system" fn(*mut c_void) -> u32,
        >(load_library))
    };
    // SAFETY: `start` lives at the same address in the target.
    let thread = unsafe { CreateRemoteThread(process, None, 0, start, Some(remote), 0, None) }
        .map_err(|e| InjectError::RemoteThreadFailed { source: e.into() })?;
    // SAFETY: returned to us, owned by nobody else.
    let thread = unsafe { OwnedHandle::from_raw_handle(thread.0) };

    let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
    // SAFETY: valid thread handle.
    if unsafe { WaitForSingleObject(raw(&thread), millis) } == WAIT_TIMEOUT {
        // Resume anyway; whether the agent loaded shows on the channel.
        tracing::warn!(timeout_ms = millis, "agent load did not finish in time");
    }
    Ok(())
}

pub(super) fn spawn_plain(target: &TargetCommand) -> Result<Process, InjectError> {
    let created = create(target, NORMAL_PRIORITY_CLASS)?;
    Ok(Process {
        process: created.process,
        pid: created.pid,
    })
}

fn filetime_ticks(ft: FILETIME) -> u64 {
    (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
}

fn filetime_span(ft: FILETIME) -> Duration {
    Duration::from_nanos(filetime_ticks(ft).saturating_mul(100))
}

fn filetime_instant(ft: FILETIME) -> DateTime<Utc> {
    let since_epoch = filetime_ticks(ft).saturating_sub(FILETIME_UNIX_EPOCH);
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::microseconds((since_epoch / 10) as i64)
}

impl Process {
    pub(super) fn id(&self) -> u32 {
        self.pid
    }

    pub(super) fn wait(self) -> ExitReport {
        let handle = raw(&self.process);
        // SAFETY: valid process handle for all calls below.
        unsafe {
            WaitForSingleObject(handle, INFINITE);
        }

        let mut code = 1u32;
        if let Err(e) = unsafe { GetExitCodeProcess(handle, &mut code) } {
            tracing::error!(pid = self.pid, error = %e, "could not get exit code of target");
            code = 1;
        }

        let (mut creation, mut exit, mut kernel, mut user) =
            (FILETIME::default(), FILETIME::default(), FILETIME::default(), FILETIME::default());
        let times = match unsafe { GetProcessTimes(handle, &mut creation, &mut exit, &mut kernel, &mut user) } {
            Ok(()) => {
                let created = filetime_instant(creation);
                let exited = filetime_instant(exit);
                ProcessTimes {
                    created,
                    exited,
                    user: filetime_span(user),
                    kernel: filetime_span(kernel),
                    wall: (exited - created).to_std().unwrap_or(Duration::ZERO),
                }
            }
            Err(e) => {
                tracing::error!(pid = self.pid, error = %e, "could not get process times");
                let now = Utc::now();
                ProcessTimes {
                    created: now,
                    exited: now,
                    user: Duration::ZERO,
                    kernel: Duration::ZERO,
                    wall: Duration::ZERO,
                }
            }
        };

        let mut pmc = PROCESS_MEMORY_COUNTERS {
            cb: std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
            ..Default::default()
        };
        let os_memory = match unsafe { GetProcessMemoryInfo(handle, &mut pmc, pmc.cb) } {
            Ok(()) => Some(MemoryCounters {
                page_faults: u64::from(pmc.PageFaultCount),
                peak_working_set: pmc.PeakWorkingSetSize as u64,
                peak_paged_pool: pmc.QuotaPeakPagedPoolUsage as u64,
                peak_non_paged_pool: pmc.QuotaPeakNonPagedPoolUsage as u64,
                peak_pagefile: pmc.PeakPagefileUsage as u64,
            }),
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "could not read process memory counters");
                None
            }
        };

        ExitReport {
            exit_code: code as i32,
            times,
            os_memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filetime_epoch_conversion() {
        let ticks = FILETIME_UNIX_EPOCH + 15_000_000;
        let ft = FILETIME {
            dwLowDateTime: ticks as u32,
            dwHighDateTime: (ticks >> 32) as u32,
        };
        assert_eq!(filetime_instant(ft).timestamp_millis(), 1_500);
    }

    #[test]
    fn test_environment_block_sorted_and_terminated() {
        let block = environment_block(&[("WINTIME_PIPE".to_string(), "x".to_string())]);
        assert_eq!(&block[block.len() - 2..], &[0, 0]);
        let text = String::from_utf16_lossy(&block);
        assert!(text.contains("WINTIME_PIPE=x\0"));
    }
}
