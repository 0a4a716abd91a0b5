//! Spawning child processes with pipe ends bound to their descriptors.
//!
//! Every descriptor this crate creates is close-on-exec, so a child only inherits what was bound
//! explicitly through [`Command`]. This keeps concurrent spawns from different threads from
//! leaking each other's pipe ends.

use crate::{Pipe, SpawnError, sys};
use std::{
    ffi::OsStr,
    fmt, io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
        unix::process::CommandExt,
    },
    process::ExitStatus,
};

/// A by-value builder for child processes.
///
/// Mirrors the subset of [`std::process::Command`] needed to wire pipes into a child. Builder
/// errors, such as binding a closed pipe, are reported by [`spawn`](Self::spawn).
pub struct Command {
    inner: std::process::Command,
    program: String,
    bindings: Vec<(RawFd, OwnedFd)>,
    error: Option<io::Error>,
}

impl Command {
    /// Creates a command for `program`, looked up in `PATH` if it has no slash.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        let program = program.as_ref();
        Self {
            inner: std::process::Command::new(program),
            program: program.to_string_lossy().into_owned(),
            bindings: Vec::new(),
            error: None,
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.inner.arg(arg);
        self
    }

    /// Appends arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.inner.args(args);
        self
    }

    /// Makes the read end of `pipe` the child's standard input.
    pub fn stdin(self, pipe: &Pipe) -> Self {
        match pipe.source() {
            Some(source) => self.bind_stream(0, source.as_fd()),
            None => self.fail(closed_pipe("stdin")),
        }
    }

    /// Makes the write end of `pipe` the child's standard output.
    pub fn stdout(self, pipe: &Pipe) -> Self {
        match pipe.sink() {
            Some(sink) => self.bind_stream(1, sink.as_fd()),
            None => self.fail(closed_pipe("stdout")),
        }
    }

    /// Makes the write end of `pipe` the child's standard error.
    pub fn stderr(self, pipe: &Pipe) -> Self {
        match pipe.sink() {
            Some(sink) => self.bind_stream(2, sink.as_fd()),
            None => self.fail(closed_pipe("stderr")),
        }
    }

    /// Binds a standard stream. Children expect blocking stdio, so a non-blocking end is opened
    /// afresh, and refused if that is not possible.
    fn bind_stream(self, target: RawFd, fd: BorrowedFd<'_>) -> Self {
        match sys::is_nonblocking(fd) {
            Ok(false) => self.bind_fd(target, fd),
            Ok(true) => match sys::reopen(fd, target != 0) {
                Ok(reopened) => {
                    trace!(target, fd = fd.as_raw_fd(), "reopened non-blocking pipe end");
                    self.bind_fd(target, reopened)
                }
                Err(err) => {
                    let fd = fd.as_raw_fd();
                    let msg = format!("cannot bind non-blocking descriptor {fd} to {target}: {err}");
                    self.fail(io::Error::new(err.kind(), msg))
                }
            },
            Err(err) => self.fail(err),
        }
    }

    /// Makes `fd` available to the child as descriptor `target`.
    ///
    /// The descriptor is duplicated right away, so the caller may close its own copy before
    /// spawning. Binding the same target twice keeps the last binding.
    pub fn bind_fd(mut self, target: RawFd, fd: impl AsFd) -> Self {
        if target < 0 || target.checked_add(1).is_none() {
            return self.fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid target descriptor {target}"),
            ));
        }
        match fd.as_fd().try_clone_to_owned() {
            Ok(fd) => {
                self.bindings.retain(|(bound, _)| *bound != target);
                self.bindings.push((target, fd));
            }
            Err(err) => return self.fail(err),
        }
        self
    }

    fn fail(mut self, err: io::Error) -> Self {
        self.error.get_or_insert(err);
        self
    }

    /// Spawns the child.
    ///
    /// Bound descriptors are installed in the child right before `exec`; nothing else this crate
    /// created is inherited.
    pub fn spawn(mut self) -> Result<Child, SpawnError> {
        let program = std::mem::take(&mut self.program);
        if let Some(err) = self.error.take() {
            return Err(SpawnError::new(program, err));
        }

        // Move every source above the highest target, so that installing one binding can never
        // overwrite the source of another.
        let floor = self
            .bindings
            .iter()
            .map(|(target, _)| target.checked_add(1))
            .try_fold(0, |floor, above| above.map(|above| floor.max(above)))
            .ok_or_else(|| {
                let err = io::Error::new(io::ErrorKind::InvalidInput, "target descriptor too large");
                SpawnError::new(program.clone(), err)
            })?;
        let staged = self
            .bindings
            .iter()
            .map(|(target, fd)| Ok((*target, sys::duplicate_above(fd.as_fd(), floor)?)))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|err| SpawnError::new(program.clone(), err))?;
        let pairs: Vec<(RawFd, RawFd)> =
            staged.iter().map(|(target, fd)| (*target, fd.as_raw_fd())).collect();

        if !pairs.is_empty() {
            // SAFETY: `install_descriptors` only calls `dup2` over a slice allocated before the
            // fork, which is async-signal-safe.
            unsafe {
                self.inner.pre_exec(move || sys::install_descriptors(&pairs));
            }
        }

        let child = self.inner.spawn().map_err(|err| {
            debug!(%program, %err, "failed to spawn child");
            SpawnError::new(program.clone(), err)
        })?;
        debug!(%program, pid = child.id(), bindings = staged.len(), "spawned child");
        Ok(Child { inner: child, program })
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("inner", &self.inner)
            .field("bindings", &self.bindings.iter().map(|(target, _)| target).collect::<Vec<_>>())
            .finish()
    }
}

fn closed_pipe(stream: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("cannot bind a closed pipe to {stream}"))
}

/// A spawned child process.
#[derive(Debug)]
pub struct Child {
    inner: std::process::Child,
    program: String,
}

impl Child {
    /// The OS process id.
    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    /// The program the child was spawned from.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Blocks until the child exits.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.inner.wait()?;
        trace!(program = %self.program, pid = self.id(), %status, "child exited");
        Ok(status)
    }

    /// Returns the exit status if the child has exited.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.inner.try_wait()
    }

    /// Sends `SIGKILL` to the child.
    pub fn kill(&mut self) -> io::Result<()> {
        self.inner.kill()
    }
}
