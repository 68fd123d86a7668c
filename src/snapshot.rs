/// Resource snapshots: the memory record sent by the agent, the process times
/// captured by the watcher, and the per-invocation record built from both.
use crate::format;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::time::Duration;

/// Size of an encoded [`MemoryCounters`] record on the channel.
pub const RECORD_LEN: usize = 5 * std::mem::size_of::<u64>();

/// Cell text used for every memory column when the agent never reported.
pub const UNAVAILABLE: &str = "n/a";

/// Peak memory counters of a process, captured inside that process at teardown.
///
/// Only peaks and cumulative counts are kept; instantaneous values depend on the
/// moment of measurement and say nothing useful after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryCounters {
    pub page_faults: u64,
    pub peak_working_set: u64,
    pub peak_paged_pool: u64,
    pub peak_non_paged_pool: u64,
    pub peak_pagefile: u64,
}

/// The channel payload did not have the fixed record size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    Size { expected: usize, actual: usize },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Size { expected, actual } => write!(
                f,
                "memory record has {actual} bytes, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for RecordError {}

impl MemoryCounters {
    fn fields(&self) -> [u64; 5] {
        [
            self.page_faults,
            self.peak_working_set,
            self.peak_paged_pool,
            self.peak_non_paged_pool,
            self.peak_pagefile,
        ]
    }

    /// Fixed-width native-endian layout; both ends share the architecture.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        for (chunk, value) in out.chunks_exact_mut(8).zip(self.fields()) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() != RECORD_LEN {
            return Err(RecordError::Size {
                expected: RECORD_LEN,
                actual: bytes.len(),
            });
        }
        let mut values = [0u64; 5];
        for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *value = u64::from_ne_bytes(word);
        }
        Ok(Self {
            page_faults: values[0],
            peak_working_set: values[1],
            peak_paged_pool: values[2],
            peak_non_paged_pool: values[3],
            peak_pagefile: values[4],
        })
    }
}

/// Process timing as reported by the OS once the target has exited.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessTimes {
    pub created: DateTime<Utc>,
    pub exited: DateTime<Utc>,
    pub user: Duration,
    pub kernel: Duration,
    /// Elapsed between creation and exit.
    pub wall: Duration,
}

/// One fully composed result of a single watcher run; written as one log row.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRecord {
    pub command_line: String,
    pub times: ProcessTimes,
    /// `None` when no memory data reached the watcher.
    pub memory: Option<MemoryCounters>,
    pub exit_code: i32,
}

const HEADER: [&str; 13] = [
    "cmd",
    "creation_time",
    "exit_time",
    "wall_time",
    "user_time",
    "kernel_time",
    "page_faults",
    "peak_working_set_bytes",
    "peak_working_set",
    "peak_paged_pool",
    "peak_non_paged_pool",
    "peak_pagefile",
    "exit_code",
];

/// Number of fields in every header and data row.
pub const FIELD_COUNT: usize = HEADER.len();

impl InvocationRecord {
    /// Header row (without line terminator).
    pub fn header(separator: char) -> String {
        HEADER.join(&separator.to_string())
    }

    /// Data row (without line terminator). The command line is sanitized so it
    /// can never contribute extra fields or lines.
    pub fn row(&self, separator: char) -> String {
        let command: String = self
            .command_line
            .chars()
            .map(|c| if c == separator || c == '\n' || c == '\r' { ' ' } else { c })
            .collect();

        let mut cells = vec![
            command,
            format::timestamp(&self.times.created),
            format::timestamp(&self.times.exited),
            format::duration(self.times.wall),
            format::duration(self.times.user),
            format::duration(self.times.kernel),
        ];
        match &self.memory {
            Some(m) => cells.extend([
                m.page_faults.to_string(),
                m.peak_working_set.to_string(),
                format::bytes(m.peak_working_set),
                format::bytes(m.peak_paged_pool),
                format::bytes(m.peak_non_paged_pool),
                format::bytes(m.peak_pagefile),
            ]),
            None => cells.extend(std::iter::repeat(UNAVAILABLE.to_string()).take(6)),
        }
        cells.push(self.exit_code.to_string());
        cells.join(&separator.to_string())
    }

    /// Console report block.
    pub fn print_report(&self, out: &mut dyn Write) -> std::io::Result<()> {
        match &self.memory {
            Some(m) => {
                writeln!(out, "PageFaultCount: {}", m.page_faults)?;
                writeln!(out, "PeakWorkingSetSize: {}", format::bytes(m.peak_working_set))?;
                writeln!(out, "QuotaPeakPagedPoolUsage: {}", format::bytes(m.peak_paged_pool))?;
                writeln!(
                    out,
                    "QuotaPeakNonPagedPoolUsage: {}",
                    format::bytes(m.peak_non_paged_pool)
                )?;
                writeln!(out, "PeakPagefileUsage: {}", format::bytes(m.peak_pagefile))?;
            }
            None => writeln!(out, "Memory data unavailable (agent did not report)")?,
        }
        let t = &self.times;
        writeln!(out, "Creation time {}", format::timestamp(&t.created))?;
        writeln!(out, "    Exit time {}", format::timestamp(&t.exited))?;
        writeln!(out, "    Wall time: {}", format::duration(t.wall))?;
        writeln!(out, "    User time: {}", format::duration(t.user))?;
        writeln!(out, "  Kernel time: {}", format::duration(t.kernel))?;
        Ok(())
    }
}
