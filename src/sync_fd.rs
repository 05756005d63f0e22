//! Sync-fd bridge: export and import of the semaphore signal channel.
//!
//! A sync fd is an OS-level handle whose "signaled" state a process can
//! observe independently of the semaphore object that produced it. The
//! bridge materializes the channel as a non-blocking Unix pipe:
//!
//! - export keeps the write end registered on the semaphore and hands the
//!   read end to the caller as a [`SyncFd`];
//! - a signal writes one token byte into every registered write end;
//! - "signaled" means the read end has a token available (`poll(POLLIN)`);
//! - a consuming wait reads exactly one token, exhausting the channel.
//!
//! Pipes rather than eventfds keep the bridge portable across Unix
//! platforms, and a pipe's buffered token survives the writer closing, so
//! the exported handle's lifetime is independent of the exporting
//! semaphore.
//!
//! All fds are held as [`OwnedFd`] so release is guaranteed on every exit
//! path.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::SemError;

/// Natural byte size of an exported handle (one `RawFd`).
pub const SYNC_FD_HANDLE_SIZE: usize = std::mem::size_of::<RawFd>();

/// One token byte per signal.
const TOKEN: [u8; 1] = [1];

/// Exported signal handle: the read end of the bridge pipe.
///
/// Lifetime is independent of the semaphore it was exported from; dropping
/// the `SyncFd` closes the handle.
#[derive(Debug)]
pub struct SyncFd {
    fd: OwnedFd,
}

impl SyncFd {
    pub(crate) fn from_owned(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Adopts a raw fd word from an import property list.
    ///
    /// The caller transfers ownership of the descriptor; it is closed when
    /// the adopting semaphore releases it.
    pub(crate) fn adopt_raw(word: u64) -> Result<Self, SemError> {
        let raw = i32::try_from(word).map_err(|_| {
            SemError::invalid_property(format!("import handle {word:#x} is not a valid fd"))
        })?;
        if raw < 0 {
            return Err(SemError::invalid_property("negative import handle"));
        }
        // Ownership of `raw` transfers here; double-adoption of the same fd
        // word is caller error, as with any raw-handle API.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Raw descriptor value. Always non-negative.
    #[inline]
    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Consumes the wrapper, returning the underlying descriptor.
    #[inline]
    pub fn into_owned(self) -> OwnedFd {
        self.fd
    }

    /// True when a token is available: the most recent exported signal has
    /// fired and no wait has consumed it yet.
    #[inline]
    pub fn is_signaled(&self) -> bool {
        poll_readable(self.fd.as_raw_fd())
    }
}

/// Creates the bridge pipe as `(read_end, write_end)`, both non-blocking.
pub(crate) fn pipe_pair() -> Result<(OwnedFd, OwnedFd), SemError> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(SemError::handle_io("pipe", io::Error::last_os_error()));
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    set_nonblocking(&read)?;
    set_nonblocking(&write)?;
    Ok((read, write))
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), SemError> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(SemError::handle_io("fcntl", io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(SemError::handle_io("fcntl", io::Error::last_os_error()));
    }
    Ok(())
}

/// Non-blocking readability poll: does the channel hold a token?
pub(crate) fn poll_readable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    rc > 0 && (pfd.revents & libc::POLLIN) != 0
}

/// Writes one signal token into a registered write end.
///
/// A full pipe buffer means the channel already holds far more tokens than
/// any consumer can observe as distinct signals, so `EAGAIN` is success.
pub(crate) fn write_token(fd: RawFd) -> Result<(), SemError> {
    let n = unsafe { libc::write(fd, TOKEN.as_ptr().cast(), 1) };
    if n == 1 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(());
    }
    Err(SemError::handle_io("write", err))
}

/// Consumes one signal token from an imported read end.
///
/// The engine only calls this after observing readability under its lock;
/// an empty read here means the channel was torn down underneath us.
pub(crate) fn read_token(fd: RawFd) -> Result<(), SemError> {
    let mut buf = [0u8; 1];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 1) };
    if n == 1 {
        return Ok(());
    }
    if n == 0 {
        return Err(SemError::invalid_operation(
            "sync fd channel closed before its signal was consumed",
        ));
    }
    Err(SemError::handle_io("read", io::Error::last_os_error()))
}
