//! Named-pipe rendition of the channel.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::windows::io::{FromRawHandle, OwnedHandle};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{ERROR_PIPE_BUSY, ERROR_PIPE_LISTENING};
use windows::Win32::Storage::FileSystem::{FILE_FLAG_FIRST_PIPE_INSTANCE, PIPE_ACCESS_INBOUND};
use windows::Win32::System::Pipes::{
    CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_WAIT,
};

use super::ChannelError;

const BUFFER_SIZE: u32 = 16 * 1024;

pub(super) fn channel_name(tag: &str) -> String {
    format!(r"\\.\pipe\wintime-{tag}")
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

pub(super) struct ServerEndpoint {
    pipe: File,
}

impl ServerEndpoint {
    pub(super) fn create(name: &str) -> io::Result<Self> {
        let name = wide(name);
        // SAFETY: `name` is NUL-terminated and outlives the call.
        let handle = unsafe {
            CreateNamedPipeW(
                PCWSTR(name.as_ptr()),
                PIPE_ACCESS_INBOUND | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                1,
                BUFFER_SIZE,
                BUFFER_SIZE,
                0,
                None,
            )
        };
        if handle.is_invalid() {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: freshly created, valid, and owned by nobody else.
        let owned = unsafe { OwnedHandle::from_raw_handle(handle.0) };
        Ok(Self {
            pipe: File::from(owned),
        })
    }

    /// A broken pipe (writer gone) reads as EOF; so does a pipe nobody ever
    /// connected to.
    pub(super) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.pipe.read(buf) {
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_LISTENING.0 as i32) => Ok(0),
            other => other,
        }
    }
}

pub(super) fn send(name: &str, record: &[u8]) -> Result<(), ChannelError> {
    // GENERIC_WRITE + OPEN_EXISTING on the pipe name.
    let mut pipe = match OpenOptions::new().write(true).open(name) {
        Ok(pipe) => pipe,
        Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY.0 as i32) => {
            return Err(ChannelError::Busy {
                name: name.to_string(),
            })
        }
        Err(source) => {
            return Err(ChannelError::Connect {
                name: name.to_string(),
                source,
            })
        }
    };
    pipe.write_all(record)
        .map_err(|source| ChannelError::Io { source })
}
