use nix::{libc, sys::stat::Mode, unistd};
use std::{
    fs::OpenOptions,
    io,
    os::{
        fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::fs::{FileTypeExt, OpenOptionsExt},
    },
    path::Path,
};

/// The native handle type of a pipe end.
pub type RawHandle = RawFd;

/// The value reported for the ends of a closed pipe.
pub const INVALID_HANDLE: RawHandle = -1;

/// Creates an anonymous pipe and returns its `(source, sink)` ends.
///
/// Both descriptors are close-on-exec.
pub(crate) fn anonymous() -> io::Result<(OwnedFd, OwnedFd)> {
    let (reader, writer) = io::pipe()?;
    Ok((reader.into(), writer.into()))
}

/// Creates a FIFO at `path`.
///
/// Fails with `AlreadyExists` if anything already lives at `path`.
pub(crate) fn create_fifo(path: &Path, mode: u32) -> io::Result<()> {
    let mode = Mode::from_bits_truncate(mode as libc::mode_t);
    unistd::mkfifo(path, mode).map_err(io::Error::from)
}

/// Opens the FIFO at `path` for reading and writing, returning `(source, sink)`.
///
/// Opening read-write never blocks waiting for a peer. The sink is a duplicate of the source and
/// shares its open file description.
pub(crate) fn open_fifo(path: &Path, nonblocking: bool) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    if nonblocking {
        options.custom_flags(libc::O_NONBLOCK);
    }
    let file = options.open(path)?;
    if !file.metadata()?.file_type().is_fifo() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a named pipe"));
    }
    let source = OwnedFd::from(file);
    let sink = source.try_clone()?;
    Ok((source, sink))
}

/// Duplicates `fd` onto the lowest free descriptor that is `>= floor`.
///
/// The duplicate is close-on-exec.
pub(crate) fn duplicate_above(fd: BorrowedFd<'_>, floor: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: `fd` is a valid borrowed descriptor for the duration of the call.
    let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if raw == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `F_DUPFD_CLOEXEC` returned a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Installs each `(target, source)` pair into the current process with `dup2`.
///
/// Runs between `fork` and `exec`, so it must stay async-signal-safe: no allocation, no locks.
/// Every source must be greater than every target, which guarantees `dup2` never clobbers a
/// source that is still to be installed and always clears close-on-exec on the target.
pub(crate) fn install_descriptors(bindings: &[(RawFd, RawFd)]) -> io::Result<()> {
    for &(target, source) in bindings {
        // SAFETY: both descriptors are plain integers; `dup2` is async-signal-safe.
        if unsafe { libc::dup2(source, target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Whether the open file description behind `fd` is in non-blocking mode.
pub(crate) fn is_nonblocking(fd: BorrowedFd<'_>) -> io::Result<bool> {
    // SAFETY: `fd` is a valid borrowed descriptor for the duration of the call.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Opens a fresh, blocking file description for the pipe end `fd`.
///
/// Unlike a `dup`, the result does not share file status flags with `fd`. Opening the read end
/// only returns once the pipe has a writer, and the write end once it has a reader.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn reopen(fd: BorrowedFd<'_>, write: bool) -> io::Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(!write)
        .write(write)
        .open(format!("/proc/self/fd/{}", fd.as_raw_fd()))?;
    Ok(file.into())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn reopen(_fd: BorrowedFd<'_>, _write: bool) -> io::Result<OwnedFd> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "cannot reopen pipe ends on this platform"))
}

/// Blocks until `fd` is readable, or writable if `write` is set.
pub(crate) fn wait_ready(fd: RawFd, write: bool) -> io::Result<()> {
    let events = if write { libc::POLLOUT } else { libc::POLLIN };
    let mut pollfd = libc::pollfd { fd, events, revents: 0 };
    loop {
        // SAFETY: `pollfd` is a single, initialized entry.
        if unsafe { libc::poll(&mut pollfd, 1, -1) } != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
