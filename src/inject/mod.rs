//! Target process creation, with or without the measurement agent.
//!
//! [`Injector::inject`] starts the target so that no target code runs before
//! the agent module is loaded into it. [`spawn_plain`] is the agent-free
//! sibling used when memory counters are read from the OS after exit.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as sys;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as sys;

use crate::snapshot::{MemoryCounters, ProcessTimes};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bound on the wait for the remote loader call.
pub const REMOTE_LOAD_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug)]
pub enum InjectError {
    AgentMissing {
        path: PathBuf,
    },
    /// The agent path cannot be expressed to the loader.
    AgentPathUnsupported {
        path: PathBuf,
        reason: &'static str,
    },
    ProcessCreateFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    LoaderNotFound {
        source: std::io::Error,
    },
    RemoteAllocFailed {
        source: std::io::Error,
    },
    RemoteWriteFailed {
        source: std::io::Error,
    },
    RemoteThreadFailed {
        source: std::io::Error,
    },
    ResumeFailed {
        source: std::io::Error,
    },
}

impl std::fmt::Display for InjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InjectError::AgentMissing { path } => {
                write!(f, "agent module {} not found", path.display())
            }
            InjectError::AgentPathUnsupported { path, reason } => {
                write!(f, "agent module path {} {}", path.display(), reason)
            }
            InjectError::ProcessCreateFailed { path, source } => {
                write!(f, "failed to create process {}: {}", path.display(), source)
            }
            InjectError::LoaderNotFound { source } => {
                write!(f, "could not locate the module loader: {}", source)
            }
            InjectError::RemoteAllocFailed { source } => {
                write!(f, "could not allocate memory in target: {}", source)
            }
            InjectError::RemoteWriteFailed { source } => {
                write!(f, "could not write agent path into target: {}", source)
            }
            InjectError::RemoteThreadFailed { source } => {
                write!(f, "could not start loader thread in target: {}", source)
            }
            InjectError::ResumeFailed { source } => {
                write!(f, "could not resume target: {}", source)
            }
        }
    }
}

impl std::error::Error for InjectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InjectError::AgentMissing { .. } | InjectError::AgentPathUnsupported { .. } => None,
            InjectError::ProcessCreateFailed { source, .. }
            | InjectError::LoaderNotFound { source }
            | InjectError::RemoteAllocFailed { source }
            | InjectError::RemoteWriteFailed { source }
            | InjectError::RemoteThreadFailed { source }
            | InjectError::ResumeFailed { source } => Some(source),
        }
    }
}

/// What to start.
#[derive(Debug, Clone)]
pub struct TargetCommand {
    pub program: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Quoted command line, argv[0] included; what Windows hands the target.
    pub command_line: String,
    /// Extra environment entries on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

/// What the OS reports about a target once it has exited.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitReport {
    pub exit_code: i32,
    pub times: ProcessTimes,
    /// Counters the watcher itself could read from outside; not the agent's.
    pub os_memory: Option<MemoryCounters>,
}

/// A started target. Dropping it without [`wait`](Self::wait) leaves the
/// process running.
#[derive(Debug)]
pub struct TargetProcess {
    inner: sys::Process,
}

impl TargetProcess {
    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    /// Block until the target terminates. No timeout.
    pub fn wait(self) -> ExitReport {
        self.inner.wait()
    }
}

/// Loads the agent module into new processes.
#[derive(Debug, Clone)]
pub struct Injector {
    agent: PathBuf,
    remote_load_timeout: Duration,
}

impl Injector {
    /// Fails with [`InjectError::AgentMissing`] if `agent` is not a file.
    pub fn new(agent: impl Into<PathBuf>) -> Result<Self, InjectError> {
        let agent = agent.into();
        if !agent.is_file() {
            return Err(InjectError::AgentMissing { path: agent });
        }
        let agent = std::path::absolute(&agent).unwrap_or(agent);
        Ok(Self {
            agent,
            remote_load_timeout: REMOTE_LOAD_TIMEOUT,
        })
    }

    pub fn with_remote_load_timeout(mut self, timeout: Duration) -> Self {
        self.remote_load_timeout = timeout;
        self
    }

    pub fn agent(&self) -> &Path {
        &self.agent
    }

    /// Start `target` with the agent in place before any target code runs.
    ///
    /// Success means the start sequence completed, not that the agent loaded;
    /// only the channel tells that.
    pub fn inject(&self, target: &TargetCommand) -> Result<TargetProcess, InjectError> {
        let inner = sys::inject(target, &self.agent, self.remote_load_timeout)?;
        tracing::debug!(pid = inner.id(), agent = %self.agent.display(), "target started with agent");
        Ok(TargetProcess { inner })
    }
}

/// Start `target` normally, without the agent.
pub fn spawn_plain(target: &TargetCommand) -> Result<TargetProcess, InjectError> {
    let inner = sys::spawn_plain(target)?;
    tracing::debug!(pid = inner.id(), "target started");
    Ok(TargetProcess { inner })
}

/// Conventional file name of the agent module on this platform.
pub fn agent_file_name() -> String {
    format!(
        "{}wintime_agent{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    )
}
