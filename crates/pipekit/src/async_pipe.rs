//! Reactor-bound duplex pipes.

use crate::{
    IoContext, Pipe, PipeError, StreamBuf,
    pipe::remove_after_failure,
    sys::{self, INVALID_HANDLE, RawHandle},
};
use bytes::{BufMut, Bytes};
use std::{
    cell::RefCell,
    fmt,
    future::poll_fn,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    rc::Rc,
    task::Poll,
};
use tokio::net::unix::pipe::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

/// A pipe whose reads and writes are driven by an [`IoContext`].
///
/// The pipe is open iff it holds both its source (read end) and its sink (write end); there is no
/// way to observe one without the other. Operations scheduled with
/// [`async_write`](Self::async_write) and [`async_read_until`](Self::async_read_until) do nothing
/// until the context is [run](IoContext::run), and each completion runs exactly once.
///
/// Closing or dropping the pipe releases both descriptors right away. Operations still pending
/// complete with [`PipeError::Aborted`] the next time the context runs.
pub struct AsyncPipe {
    // Deregistered before the context handle goes away.
    ends: Option<Ends>,
    name: Option<PathBuf>,
    context: IoContext,
}

/// A registered end, shared with the operations pending on it. Emptied when the pipe closes.
type Shared<T> = Rc<RefCell<Option<T>>>;

struct Ends {
    source: Shared<Receiver>,
    sink: Shared<Sender>,
    closed: CancellationToken,
}

impl Drop for Ends {
    fn drop(&mut self) {
        drop(self.source.take());
        drop(self.sink.take());
        self.closed.cancel();
    }
}

fn raw_handle<T: AsRawFd>(end: &RefCell<Option<T>>) -> RawHandle {
    end.borrow().as_ref().map_or(INVALID_HANDLE, AsRawFd::as_raw_fd)
}

impl AsyncPipe {
    /// Creates an anonymous pipe registered with `context`.
    pub fn new(context: &IoContext) -> Result<Self, PipeError> {
        let (source, sink) = sys::anonymous().map_err(|err| PipeError::creation(None, err))?;
        let pipe = Self::from_fds(context, source, sink, None)
            .map_err(|err| PipeError::creation(None, err))?;
        trace!(source = pipe.native_source(), sink = pipe.native_sink(), "created anonymous pipe");
        Ok(pipe)
    }

    /// Creates the named pipe `name` and opens it.
    ///
    /// Fails with [`PipeError::Creation`] if `name` already exists or cannot be created. The
    /// filesystem entry outlives the pipe; removing it is up to the caller.
    #[instrument(skip_all, fields(name = %name.as_ref().display()))]
    pub fn named(context: &IoContext, name: impl AsRef<Path>) -> Result<Self, PipeError> {
        let name = name.as_ref();
        sys::create_fifo(name, context.config().fifo_mode)
            .map_err(|err| PipeError::creation(Some(name), err))?;

        let opened = sys::open_fifo(name, true)
            .and_then(|(source, sink)| Self::from_fds(context, source, sink, Some(name.into())));
        match opened {
            Ok(pipe) => {
                debug!(source = pipe.native_source(), sink = pipe.native_sink(), "created named pipe");
                Ok(pipe)
            }
            Err(err) => {
                remove_after_failure(name);
                Err(PipeError::creation(Some(name), err))
            }
        }
    }

    /// Opens the existing named pipe `name` without creating it.
    ///
    /// Fails with [`PipeError::Open`] if `name` does not exist, is not accessible or is not a
    /// named pipe. Any number of pipes may open the same name.
    #[instrument(skip_all, fields(name = %name.as_ref().display()))]
    pub fn open_existing(context: &IoContext, name: impl AsRef<Path>) -> Result<Self, PipeError> {
        let name = name.as_ref();
        let pipe = sys::open_fifo(name, true)
            .and_then(|(source, sink)| Self::from_fds(context, source, sink, Some(name.into())))
            .map_err(|err| PipeError::open(name, err))?;
        debug!(source = pipe.native_source(), sink = pipe.native_sink(), "opened named pipe");
        Ok(pipe)
    }

    /// Registers the ends of `pipe` with `context`, taking ownership of them.
    ///
    /// Both ends are switched to non-blocking mode. A closed `pipe` yields a closed `AsyncPipe`.
    pub fn from_pipe(context: &IoContext, pipe: Pipe) -> Result<Self, PipeError> {
        let name = pipe.name().map(Path::to_path_buf);
        match pipe.into_fds() {
            Some((source, sink)) => Ok(Self::from_fds(context, source, sink, name)?),
            None => Ok(Self::closed(context, name)),
        }
    }

    /// Registers both descriptors. On error neither stays open.
    fn from_fds(
        context: &IoContext,
        source: OwnedFd,
        sink: OwnedFd,
        name: Option<PathBuf>,
    ) -> io::Result<Self> {
        let ends = {
            let _guard = context.enter();
            Ends {
                source: Rc::new(RefCell::new(Some(Receiver::from_owned_fd(source)?))),
                sink: Rc::new(RefCell::new(Some(Sender::from_owned_fd(sink)?))),
                closed: CancellationToken::new(),
            }
        };
        Ok(Self { context: context.clone(), ends: Some(ends), name })
    }

    fn closed(context: &IoContext, name: Option<PathBuf>) -> Self {
        Self { context: context.clone(), ends: None, name }
    }

    /// Whether both ends are open.
    pub fn is_open(&self) -> bool {
        self.ends.is_some()
    }

    /// Closes both ends and aborts pending operations. Closing a closed pipe does nothing.
    pub fn close(&mut self) {
        if let Some(ends) = self.ends.take() {
            trace!(
                source = raw_handle(&ends.source),
                sink = raw_handle(&ends.sink),
                "closing pipe"
            );
        }
    }

    /// Moves the ends out into a new pipe, leaving this one closed.
    ///
    /// Taking from a closed pipe yields another closed pipe.
    pub fn take(&mut self) -> Self {
        Self { context: self.context.clone(), ends: self.ends.take(), name: self.name.take() }
    }

    /// Creates an independent owner of duplicates of both ends, registered with the same
    /// context.
    ///
    /// Cloning a closed pipe yields a closed pipe and never touches the OS.
    pub fn try_clone(&self) -> Result<Self, PipeError> {
        let Some((source, sink)) = self.duplicate_fds(|fd, _| fd.try_clone_to_owned())? else {
            return Ok(Self::closed(&self.context, self.name.clone()));
        };
        Self::from_fds(&self.context, source, sink, self.name.clone())
            .map_err(|err| PipeError::creation(self.name(), err))
    }

    /// Converts into a plain, blocking pipe over the same OS pipe.
    ///
    /// The result has the same open state as `self`, which is not affected, and stays open when
    /// `self` is closed. Each end is opened afresh so that it blocks and can be handed to a child
    /// process. Where that is not possible the ends are duplicates that share this pipe's
    /// non-blocking mode; [`Pipe`]'s reads and writes still block on them.
    pub fn to_pipe(&self) -> Result<Pipe, PipeError> {
        Ok(match self.duplicate_fds(reopen_blocking)? {
            Some((source, sink)) => Pipe::from_fds(source, sink, self.name.clone()),
            None => Pipe::default(),
        })
    }

    /// Runs `duplicate` on the source, then on the sink (with `true`).
    fn duplicate_fds(
        &self,
        duplicate: impl Fn(BorrowedFd<'_>, bool) -> io::Result<OwnedFd>,
    ) -> Result<Option<(OwnedFd, OwnedFd)>, PipeError> {
        let Some(ends) = &self.ends else { return Ok(None) };
        let (source_slot, sink_slot) = (ends.source.borrow(), ends.sink.borrow());
        let (Some(source), Some(sink)) = (source_slot.as_ref(), sink_slot.as_ref()) else {
            return Ok(None);
        };
        let pair = || {
            Ok::<_, io::Error>((duplicate(source.as_fd(), false)?, duplicate(sink.as_fd(), true)?))
        };
        pair().map(Some).map_err(|err| PipeError::creation(self.name(), err))
    }

    /// The native handle of the read end, or [`INVALID_HANDLE`] if closed.
    pub fn native_source(&self) -> RawHandle {
        self.ends.as_ref().map_or(INVALID_HANDLE, |ends| raw_handle(&ends.source))
    }

    /// The native handle of the write end, or [`INVALID_HANDLE`] if closed.
    pub fn native_sink(&self) -> RawHandle {
        self.ends.as_ref().map_or(INVALID_HANDLE, |ends| raw_handle(&ends.sink))
    }

    /// The name of the pipe, if it is a named pipe.
    pub fn name(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    /// The context this pipe is registered with.
    pub fn context(&self) -> &IoContext {
        &self.context
    }

    /// Schedules writing all of `data` to the sink.
    ///
    /// `on_complete` runs inside [`IoContext::run`] with the number of bytes written.
    pub fn async_write<F>(&self, data: impl Into<Bytes>, on_complete: F)
    where
        F: FnOnce(Result<usize, PipeError>) + 'static,
    {
        let op = write_op(self.writer(), data.into());
        self.context.spawn(async move { on_complete(op.await) });
    }

    /// Schedules reading into `buf` until it contains `delim`.
    ///
    /// `on_complete` runs inside [`IoContext::run`] with the number of bytes up to and including
    /// the first `delim` in `buf`. The buffer keeps everything that was read, the delimiter
    /// included, and may hold bytes past it. If `buf` already contains `delim` the operation
    /// completes without reading.
    pub fn async_read_until<F>(&self, buf: &StreamBuf, delim: u8, on_complete: F)
    where
        F: FnOnce(Result<usize, PipeError>) + 'static,
    {
        let op = read_until_op(self.reader(), buf.clone(), delim, self.chunk_size());
        self.context.spawn(async move { on_complete(op.await) });
    }

    /// Writes all of `data` to the sink. Must be awaited from a task driven by the context, see
    /// [`IoContext::spawn`].
    pub async fn write_all(&self, data: impl Into<Bytes>) -> Result<usize, PipeError> {
        write_op(self.writer(), data.into()).await
    }

    /// Reads into `buf` until it contains `delim`, see
    /// [`async_read_until`](Self::async_read_until).
    pub async fn read_until(&self, buf: &StreamBuf, delim: u8) -> Result<usize, PipeError> {
        read_until_op(self.reader(), buf.clone(), delim, self.chunk_size()).await
    }

    fn writer(&self) -> Option<(Shared<Sender>, CancellationToken)> {
        self.ends.as_ref().map(|ends| (Rc::clone(&ends.sink), ends.closed.clone()))
    }

    fn reader(&self) -> Option<(Shared<Receiver>, CancellationToken)> {
        self.ends.as_ref().map(|ends| (Rc::clone(&ends.source), ends.closed.clone()))
    }

    fn chunk_size(&self) -> usize {
        self.context.config().read_chunk_size
    }
}

/// A blocking description for `fd`, falling back to a duplicate where reopening fails.
fn reopen_blocking(fd: BorrowedFd<'_>, write: bool) -> io::Result<OwnedFd> {
    sys::reopen(fd, write).or_else(|err| {
        debug!(fd = fd.as_raw_fd(), %err, "cannot reopen pipe end, duplicating it");
        fd.try_clone_to_owned()
    })
}

impl TryFrom<&AsyncPipe> for Pipe {
    type Error = PipeError;

    fn try_from(pipe: &AsyncPipe) -> Result<Self, Self::Error> {
        pipe.to_pipe()
    }
}

impl fmt::Debug for AsyncPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPipe")
            .field("source", &self.native_source())
            .field("sink", &self.native_sink())
            .field("name", &self.name)
            .finish()
    }
}

async fn write_op(
    writer: Option<(Shared<Sender>, CancellationToken)>,
    data: Bytes,
) -> Result<usize, PipeError> {
    let (sink, closed) = writer.ok_or(PipeError::Closed)?;
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(PipeError::Aborted),
        res = write_to(&sink, &data) => res,
    }
}

async fn write_to(sink: &RefCell<Option<Sender>>, data: &[u8]) -> Result<usize, PipeError> {
    let mut written = 0;
    while written < data.len() {
        poll_fn(|cx| match &*sink.borrow() {
            Some(sink) => sink.poll_write_ready(cx).map_err(PipeError::from),
            None => Poll::Ready(Err(PipeError::Aborted)),
        })
        .await?;
        let res = match &*sink.borrow() {
            Some(sink) => sink.try_write(&data[written..]),
            None => return Err(PipeError::Aborted),
        };
        match res {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(written)
}

async fn read_until_op(
    reader: Option<(Shared<Receiver>, CancellationToken)>,
    buf: StreamBuf,
    delim: u8,
    chunk_size: usize,
) -> Result<usize, PipeError> {
    let (source, closed) = reader.ok_or(PipeError::Closed)?;
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(PipeError::Aborted),
        res = read_into(&source, &buf, delim, chunk_size) => res,
    }
}

async fn read_into(
    source: &RefCell<Option<Receiver>>,
    buf: &StreamBuf,
    delim: u8,
    chunk_size: usize,
) -> Result<usize, PipeError> {
    let mut searched = 0;
    loop {
        if let Some(pos) = buf.find(delim, searched) {
            return Ok(pos + 1);
        }
        searched = buf.len();

        poll_fn(|cx| match &*source.borrow() {
            Some(source) => source.poll_read_ready(cx).map_err(PipeError::from),
            None => Poll::Ready(Err(PipeError::Aborted)),
        })
        .await?;
        let res = match &*source.borrow() {
            Some(source) => buf.with_mut(|data| {
                data.reserve(chunk_size);
                source.try_read_buf(&mut BufMut::limit(data, chunk_size))
            }),
            None => return Err(PipeError::Aborted),
        };
        match res {
            Ok(0) => return Err(PipeError::eof()),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }
}
