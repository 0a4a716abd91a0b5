use crate::{
    PipeError,
    sys::{self, INVALID_HANDLE, RawHandle},
};
use std::{
    io::{self, PipeReader, PipeWriter, Read, Write},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
};

/// A plain, blocking pipe.
///
/// A pipe is open iff it holds both ends. Dropping it closes both.
#[derive(Debug, Default)]
pub struct Pipe {
    ends: Option<(PipeReader, PipeWriter)>,
    name: Option<PathBuf>,
}

impl Pipe {
    /// Creates an anonymous pipe.
    pub fn new() -> Result<Self, PipeError> {
        let (source, sink) = sys::anonymous().map_err(|err| PipeError::creation(None, err))?;
        Ok(Self::from_fds(source, sink, None))
    }

    /// Creates the named pipe `name` and opens it.
    ///
    /// The filesystem entry outlives the pipe; removing it is up to the caller.
    pub fn named(name: impl AsRef<Path>) -> Result<Self, PipeError> {
        Self::named_with_mode(name, crate::PipeConfig::DEFAULT_FIFO_MODE)
    }

    /// Same as [`named`](Self::named), creating the FIFO with the permission bits `mode`.
    pub fn named_with_mode(name: impl AsRef<Path>, mode: u32) -> Result<Self, PipeError> {
        let name = name.as_ref();
        sys::create_fifo(name, mode).map_err(|err| PipeError::creation(Some(name), err))?;
        match sys::open_fifo(name, false) {
            Ok((source, sink)) => {
                debug!(name = %name.display(), "created named pipe");
                Ok(Self::from_fds(source, sink, Some(name.to_path_buf())))
            }
            Err(err) => {
                remove_after_failure(name);
                Err(PipeError::creation(Some(name), err))
            }
        }
    }

    /// Opens the existing named pipe `name`.
    pub fn open_existing(name: impl AsRef<Path>) -> Result<Self, PipeError> {
        let name = name.as_ref();
        let (source, sink) = sys::open_fifo(name, false).map_err(|err| PipeError::open(name, err))?;
        debug!(name = %name.display(), "opened named pipe");
        Ok(Self::from_fds(source, sink, Some(name.to_path_buf())))
    }

    pub(crate) fn from_fds(source: OwnedFd, sink: OwnedFd, name: Option<PathBuf>) -> Self {
        Self { ends: Some((source.into(), sink.into())), name }
    }

    pub(crate) fn into_fds(self) -> Option<(OwnedFd, OwnedFd)> {
        self.ends.map(|(source, sink)| (source.into(), sink.into()))
    }

    /// Whether both ends are open.
    pub fn is_open(&self) -> bool {
        self.ends.is_some()
    }

    /// Closes both ends. Closing a closed pipe does nothing.
    pub fn close(&mut self) {
        if let Some((source, sink)) = self.ends.take() {
            trace!(source = source.as_raw_fd(), sink = sink.as_raw_fd(), "closing pipe");
        }
    }

    /// The native handle of the read end, or [`INVALID_HANDLE`] if closed.
    pub fn native_source(&self) -> RawHandle {
        self.ends.as_ref().map_or(INVALID_HANDLE, |(source, _)| source.as_raw_fd())
    }

    /// The native handle of the write end, or [`INVALID_HANDLE`] if closed.
    pub fn native_sink(&self) -> RawHandle {
        self.ends.as_ref().map_or(INVALID_HANDLE, |(_, sink)| sink.as_raw_fd())
    }

    /// The read end, if open.
    pub fn source(&self) -> Option<&PipeReader> {
        self.ends.as_ref().map(|(source, _)| source)
    }

    /// The write end, if open.
    pub fn sink(&self) -> Option<&PipeWriter> {
        self.ends.as_ref().map(|(_, sink)| sink)
    }

    /// The name of the pipe, if it is a named pipe.
    pub fn name(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    /// Creates an independent owner of duplicates of both ends.
    ///
    /// Cloning a closed pipe yields a closed pipe.
    pub fn try_clone(&self) -> Result<Self, PipeError> {
        let Some((source, sink)) = &self.ends else {
            return Ok(Self { ends: None, name: self.name.clone() });
        };
        let duplicate = || Ok::<_, io::Error>((source.try_clone()?, sink.try_clone()?));
        let ends = duplicate().map_err(|err| PipeError::creation(self.name(), err))?;
        Ok(Self { ends: Some(ends), name: self.name.clone() })
    }

    /// Splits the pipe into its ends, or `None` if it is closed.
    pub fn into_parts(self) -> Option<(PipeReader, PipeWriter)> {
        self.ends
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some((source, _)) = &mut self.ends else { return Err(closed()) };
        let fd = source.as_raw_fd();
        blocking(fd, false, || source.read(buf))
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some((_, sink)) = &mut self.ends else { return Err(closed()) };
        let fd = sink.as_raw_fd();
        blocking(fd, true, || sink.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.ends {
            Some((_, sink)) => sink.flush(),
            None => Err(closed()),
        }
    }
}

/// Runs `op` to completion even if the end shares a non-blocking file description.
fn blocking<T>(fd: RawFd, write: bool, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => sys::wait_ready(fd, write)?,
            res => return res,
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe is closed")
}

/// Removes a FIFO this process just created but failed to open.
pub(crate) fn remove_after_failure(name: &Path) {
    if let Err(err) = std::fs::remove_file(name) {
        warn!(name = %name.display(), %err, "failed to remove named pipe after open failure");
    }
}
