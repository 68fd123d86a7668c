//! Unix process start: the dynamic loader maps the agent through the preload
//! variable before the target's own code runs. Exit status, CPU times and
//! OS-side memory counters come from `wait4`.

use super::{ExitReport, InjectError, TargetCommand};
use crate::snapshot::{MemoryCounters, ProcessTimes};
use chrono::{DateTime, TimeDelta, Utc};
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

#[cfg(target_os = "macos")]
const PRELOAD_VAR: &str = "DYLD_INSERT_LIBRARIES";
#[cfg(not(target_os = "macos"))]
const PRELOAD_VAR: &str = "LD_PRELOAD";

/// ru_maxrss unit.
#[cfg(target_os = "macos")]
const MAXRSS_SCALE: u64 = 1;
#[cfg(not(target_os = "macos"))]
const MAXRSS_SCALE: u64 = 1024;

#[derive(Debug)]
pub(super) struct Process {
    child: Child,
    created: DateTime<Utc>,
    started: Instant,
}

pub(super) fn inject(
    target: &TargetCommand,
    agent: &Path,
    _remote_load_timeout: Duration,
) -> Result<Process, InjectError> {
    let agent_str = agent
        .to_str()
        .ok_or_else(|| InjectError::AgentPathUnsupported {
            path: agent.to_path_buf(),
            reason: "is not valid UTF-8",
        })?;
    // The preload list is split on both.
    if agent_str.contains([' ', ':']) {
        return Err(InjectError::AgentPathUnsupported {
            path: agent.to_path_buf(),
            reason: "contains a space or colon",
        });
    }

    let preload = match std::env::var(PRELOAD_VAR) {
        Ok(existing) if !existing.is_empty() => format!("{agent_str}:{existing}"),
        _ => agent_str.to_string(),
    };
    tracing::debug!(var = PRELOAD_VAR, value = %preload, "preloading agent");

    let mut command = base_command(target);
    command.env(PRELOAD_VAR, preload);
    start(target, command)
}

pub(super) fn spawn_plain(target: &TargetCommand) -> Result<Process, InjectError> {
    start(target, base_command(target))
}

fn base_command(target: &TargetCommand) -> Command {
    let mut command = Command::new(&target.program);
    command.args(&target.args);
    command.envs(target.env.iter().map(|(k, v)| (k, v)));
    command
}

fn start(target: &TargetCommand, mut command: Command) -> Result<Process, InjectError> {
    let created = Utc::now();
    let started = Instant::now();
    let child = command
        .spawn()
        .map_err(|source| InjectError::ProcessCreateFailed {
            path: target.program.clone(),
            source,
        })?;
    Ok(Process {
        child,
        created,
        started,
    })
}

impl Process {
    pub(super) fn id(&self) -> u32 {
        self.child.id()
    }

    pub(super) fn wait(self) -> ExitReport {
        let pid = self.child.id() as libc::pid_t;
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain old data; zeroed is a valid value.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

        let reaped = loop {
            // SAFETY: pointers are valid for the duration of the call.
            let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
            if rc == pid {
                break true;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(pid, error = %err, "wait4 failed");
            break false;
        };
        let wall = self.started.elapsed();

        let exit_code = if !reaped {
            1
        } else if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            1
        };

        let times = ProcessTimes {
            created: self.created,
            exited: self.created + TimeDelta::from_std(wall).unwrap_or_else(|_| TimeDelta::zero()),
            user: timeval(usage.ru_utime),
            kernel: timeval(usage.ru_stime),
            wall,
        };
        let os_memory = reaped.then(|| MemoryCounters {
            page_faults: (usage.ru_minflt as u64).saturating_add(usage.ru_majflt as u64),
            peak_working_set: (usage.ru_maxrss as u64).saturating_mul(MAXRSS_SCALE),
            ..Default::default()
        });
        ExitReport {
            exit_code,
            times,
            os_memory,
        }
    }
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}
