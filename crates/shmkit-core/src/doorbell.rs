//! Named FIFO doorbell for cross-process wakeup.
//!
//! One byte written means "ring"; one byte read consumes a ring. The byte's
//! value carries no meaning. Every process opens the FIFO read-write, so
//! opening never blocks and the channel survives any one side closing.
//!
//! The descriptor is non-blocking. Blocking waits are built on `poll`, which
//! also lets an external event loop multiplex on [`Doorbell::as_fd`].

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, warn};

pub struct Doorbell {
    file: File,
    path: PathBuf,
}

impl Doorbell {
    /// Create the FIFO at `path` and open it. Fails if `path` exists.
    pub fn create(path: &Path) -> io::Result<Self> {
        mkfifo(path, Mode::from_bits_truncate(0o666)).map_err(io::Error::from)?;
        match Self::open(path) {
            Ok(db) => {
                debug!(path = %path.display(), "created doorbell");
                Ok(db)
            }
            Err(e) => {
                let _ = std::fs::remove_file(path);
                Err(e)
            }
        }
    }

    /// Open an existing FIFO.
    pub fn open(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        if !meta.file_type().is_fifo() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not a FIFO", path.display()),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Unlink the FIFO. Open handles keep working.
    pub fn remove(path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one signal byte.
    pub fn ring(&self) -> io::Result<()> {
        loop {
            match (&self.file).write(&[1u8]) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(io::Error::new(ErrorKind::WriteZero, "doorbell write")),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "doorbell ring failed");
                    return Err(e);
                }
            }
        }
    }

    /// Consume one pending signal if there is one.
    pub fn try_consume(&self) -> io::Result<bool> {
        let mut buf = [0u8; 1];
        loop {
            match (&self.file).read(&mut buf) {
                Ok(n) => return Ok(n == 1),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether a signal is pending, without consuming it.
    pub fn is_pending(&self) -> io::Result<bool> {
        self.wait_readable(Some(Duration::ZERO))
    }

    /// Wait until a signal is pending without consuming it. `None` waits
    /// forever. Returns `false` on timeout or interruption.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => {
                let ms = d.as_nanos().div_ceil(1_000_000);
                PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
            }
        };
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsFd for Doorbell {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for Doorbell {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
