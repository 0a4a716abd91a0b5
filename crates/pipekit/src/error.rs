//! Errors reported by pipes and child processes.

use std::{
    io,
    path::{Path, PathBuf},
};

/// Errors produced by [`Pipe`](crate::Pipe) and [`AsyncPipe`](crate::AsyncPipe).
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The OS could not allocate the pipe, or the named pipe could not be created.
    #[error("failed to create {}", describe(.name.as_deref()))]
    Creation {
        /// The name of the pipe, `None` for anonymous pipes.
        name: Option<PathBuf>,
        #[source]
        source: io::Error,
    },
    /// The named pipe does not exist, is not accessible or is not a pipe.
    #[error("failed to open named pipe {}", .name.display())]
    Open {
        /// The name that was looked up.
        name: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A read or write failed, including end-of-file.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The operation was issued on a closed pipe.
    #[error("pipe is closed")]
    Closed,
    /// The pipe was closed while the operation was pending.
    #[error("operation aborted because the pipe was closed")]
    Aborted,
}

impl PipeError {
    pub(crate) fn creation(name: Option<&Path>, source: io::Error) -> Self {
        Self::Creation { name: name.map(Path::to_path_buf), source }
    }

    pub(crate) fn open(name: &Path, source: io::Error) -> Self {
        Self::Open { name: name.to_path_buf(), source }
    }

    pub(crate) fn eof() -> Self {
        Self::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "end of file"))
    }

    /// Whether the peer closed the pipe before the operation could finish.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// Whether the operation was cancelled by closing the pipe.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// The OS error number behind this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Creation { source, .. } | Self::Open { source, .. } | Self::Io(source) => {
                source.raw_os_error()
            }
            Self::Closed | Self::Aborted => None,
        }
    }
}

fn describe(name: Option<&Path>) -> String {
    match name {
        Some(name) => format!("named pipe {}", name.display()),
        None => "anonymous pipe".to_string(),
    }
}

/// A child process failed to start.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn `{program}`")]
pub struct SpawnError {
    program: String,
    #[source]
    source: io::Error,
}

impl SpawnError {
    pub(crate) fn new(program: impl Into<String>, source: io::Error) -> Self {
        Self { program: program.into(), source }
    }

    /// The program that was being spawned.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// The OS error number, e.g. `ENOENT` when the executable does not exist.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.raw_os_error()
    }

    /// The kind of the underlying I/O error.
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}
