//! FIFO rendition of the channel.
//!
//! The server keeps the read end open from creation on, so whatever a writer
//! puts into the FIFO survives the writer's exit. A writer claims the channel
//! by unlinking the FIFO path right after opening it; later writers find no
//! path to open.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::ChannelError;

pub(super) fn channel_name(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("wintime-{tag}.pipe"))
        .to_string_lossy()
        .into_owned()
}

pub(super) struct ServerEndpoint {
    path: PathBuf,
    reader: File,
}

impl ServerEndpoint {
    pub(super) fn create(name: &str) -> io::Result<Self> {
        let path = PathBuf::from(name);
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)?;

        // A non-blocking open does not wait for a writer to appear.
        let reader = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
        {
            Ok(reader) => reader,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };
        if let Err(e) = fcntl(reader.as_raw_fd(), FcntlArg::F_SETFL(OFlag::empty())) {
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }
        Ok(Self { path, reader })
    }

    /// Blocks while a writer holds the FIFO open; EOF once every writer is gone
    /// (or none ever came).
    pub(super) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        remove_path(&self.path);
    }
}

fn remove_path(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove channel");
        }
    }
}

pub(super) fn send(name: &str, record: &[u8]) -> Result<(), ChannelError> {
    let mut writer = match OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(name)
    {
        Ok(writer) => writer,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
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

    // Whoever unlinks the path owns the channel.
    match std::fs::remove_file(name) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ChannelError::Busy {
                name: name.to_string(),
            })
        }
        Err(source) => return Err(ChannelError::Io { source }),
    }

    // The record is far below PIPE_BUF, so this lands in one atomic write.
    writer
        .write_all(record)
        .map_err(|source| ChannelError::Io { source })
}
