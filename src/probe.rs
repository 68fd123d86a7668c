/// Peak memory counters of the calling process, read from the inside.
///
/// Used by the agent at teardown and by the example target's self report.
use crate::snapshot::MemoryCounters;

/// Counters of the current process, or `None` if the OS would not tell.
#[cfg(target_os = "linux")]
pub fn own_counters() -> Option<MemoryCounters> {
    let me = match procfs::process::Process::myself() {
        Ok(me) => me,
        Err(e) => {
            tracing::debug!(error = %e, "cannot open own procfs entry");
            return None;
        }
    };
    let status = me.status().ok()?;
    let stat = me.stat().ok()?;
    Some(MemoryCounters {
        page_faults: stat.minflt.saturating_add(stat.majflt),
        peak_working_set: status.vmhwm.unwrap_or(0).saturating_mul(1024),
        peak_paged_pool: 0,
        peak_non_paged_pool: 0,
        peak_pagefile: status.vmpeak.unwrap_or(0).saturating_mul(1024),
    })
}

/// Counters of the current process, or `None` if the OS would not tell.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn own_counters() -> Option<MemoryCounters> {
    // SAFETY: rusage is plain old data; zeroed is a valid value.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: valid out pointer.
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        return None;
    }
    let scale = if cfg!(target_os = "macos") { 1 } else { 1024 };
    Some(MemoryCounters {
        page_faults: (usage.ru_minflt as u64).saturating_add(usage.ru_majflt as u64),
        peak_working_set: (usage.ru_maxrss as u64).saturating_mul(scale),
        ..Default::default()
    })
}

/// Counters of the current process, or `None` if the OS would not tell.
#[cfg(windows)]
pub fn own_counters() -> Option<MemoryCounters> {
    use windows::Win32::System::ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
    use windows::Win32::System::Threading::GetCurrentProcess;

    let mut pmc = PROCESS_MEMORY_COUNTERS {
        cb: std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32,
        ..Default::default()
    };
    // SAFETY: the pseudo handle is always valid; `pmc` is a valid out pointer.
    unsafe { GetProcessMemoryInfo(GetCurrentProcess(), &mut pmc, pmc.cb) }.ok()?;
    Some(MemoryCounters {
        page_faults: u64::from(pmc.PageFaultCount),
        peak_working_set: pmc.PeakWorkingSetSize as u64,
        peak_paged_pool: pmc.QuotaPeakPagedPoolUsage as u64,
        peak_non_paged_pool: pmc.QuotaPeakNonPagedPoolUsage as u64,
        peak_pagefile: pmc.PeakPagefileUsage as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_counters_grow_with_allocation() {
        let before = own_counters().unwrap();
        let block = vec![1u8; 8 * 1024 * 1024];
        std::hint::black_box(&block);
        let after = own_counters().unwrap();

        assert!(after.peak_working_set >= 8 * 1024 * 1024);
        assert!(after.peak_working_set >= before.peak_working_set);
        assert!(after.page_faults >= before.page_faults);
    }
}
