//! One-shot channel carrying the agent's memory record back to the watcher.
//!
//! The watcher creates a [`ChannelServer`] before the target exists and
//! publishes its name through [`ENV_VAR`]. The agent inside the target opens a
//! [`ChannelClient`] from that variable at teardown and writes exactly one
//! record. Unread bytes stay buffered in the OS until the server reads them or
//! is dropped, so reading after the target has exited is the normal case.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as sys;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as sys;

use crate::snapshot::{MemoryCounters, RecordError, RECORD_LEN};

/// Environment variable through which the target learns the channel name.
pub const ENV_VAR: &str = "WINTIME_PIPE";

#[derive(Debug)]
pub enum ChannelError {
    /// The server endpoint could not be created (name taken, no resources).
    Unavailable { name: String, source: std::io::Error },
    /// No channel name in the environment.
    NotConfigured,
    /// No server is listening under this name.
    Connect { name: String, source: std::io::Error },
    /// Another writer already claimed the channel.
    Busy { name: String },
    Io { source: std::io::Error },
    Record(RecordError),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Unavailable { name, source } => {
                write!(f, "could not create channel {name}: {source}")
            }
            ChannelError::NotConfigured => {
                write!(f, "environment variable {ENV_VAR} not set")
            }
            ChannelError::Connect { name, source } => {
                write!(f, "could not connect to channel {name}: {source}")
            }
            ChannelError::Busy { name } => {
                write!(f, "channel {name} already has a writer")
            }
            ChannelError::Io { source } => write!(f, "channel I/O failed: {source}"),
            ChannelError::Record(e) => write!(f, "malformed channel record: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Unavailable { source, .. }
            | ChannelError::Connect { source, .. }
            | ChannelError::Io { source } => Some(source),
            ChannelError::Record(e) => Some(e),
            ChannelError::NotConfigured | ChannelError::Busy { .. } => None,
        }
    }
}

impl From<RecordError> for ChannelError {
    fn from(e: RecordError) -> Self {
        ChannelError::Record(e)
    }
}

/// Full, platform-specific channel name for `tag`.
pub fn channel_name(tag: &str) -> String {
    sys::channel_name(tag)
}

/// Receive-only, single-instance endpoint owned by the watcher.
pub struct ChannelServer {
    name: String,
    endpoint: sys::ServerEndpoint,
}

impl ChannelServer {
    /// Create the endpoint named after `tag`.
    pub fn create(tag: &str) -> Result<Self, ChannelError> {
        let name = channel_name(tag);
        let endpoint = sys::ServerEndpoint::create(&name).map_err(|source| {
            ChannelError::Unavailable {
                name: name.clone(),
                source,
            }
        })?;
        tracing::debug!(name = %name, "channel created");
        Ok(Self { name, endpoint })
    }

    /// Create the endpoint named after the current process id.
    pub fn for_current_process() -> Result<Self, ChannelError> {
        Self::create(&std::process::id().to_string())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The environment entry that must reach the target.
    pub fn env_entry(&self) -> (String, String) {
        (ENV_VAR.to_string(), self.name.clone())
    }

    /// Blocking read of up to `buf.len()` bytes. Returns 0 when no writer ever
    /// sent anything and none can anymore.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.endpoint.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(ChannelError::Io { source }),
            }
        }
        Ok(filled)
    }

    /// Read the one memory record. `None` if the agent never wrote.
    pub fn receive(&mut self) -> Result<Option<MemoryCounters>, ChannelError> {
        let mut buf = [0u8; RECORD_LEN];
        let n = self.read(&mut buf)?;
        if n == 0 {
            tracing::debug!(name = %self.name, "channel closed without data");
            return Ok(None);
        }
        Ok(Some(MemoryCounters::decode(&buf[..n])?))
    }
}

impl std::fmt::Debug for ChannelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelServer").field("name", &self.name).finish()
    }
}

/// Sending side, used by the agent inside the target.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    name: String,
}

impl ChannelClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Resolve the channel from [`ENV_VAR`].
    pub fn from_env() -> Result<Self, ChannelError> {
        match std::env::var(ENV_VAR) {
            Ok(name) if !name.is_empty() => Ok(Self::new(name)),
            _ => Err(ChannelError::NotConfigured),
        }
    }

    /// Connect as the sole writer, send one record, disconnect. No retry and no
    /// acknowledgement.
    pub fn send(&self, counters: &MemoryCounters) -> Result<(), ChannelError> {
        sys::send(&self.name, &counters.encode())
    }

    /// [`send`](Self::send) for callers that must never fail: problems are
    /// logged and swallowed.
    pub fn send_or_log(&self, counters: &MemoryCounters) -> bool {
        match self.send(counters) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "memory record not sent");
                false
            }
        }
    }
}
