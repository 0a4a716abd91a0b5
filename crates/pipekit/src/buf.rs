use bytes::{Buf, Bytes, BytesMut};
use std::{cell::RefCell, fmt, rc::Rc};

/// A growable byte buffer that asynchronous reads append into.
///
/// Clones share the same storage, so a buffer handed to
/// [`AsyncPipe::async_read_until`](crate::AsyncPipe::async_read_until) can be inspected from the
/// completion and after [`IoContext::run`](crate::IoContext::run) returns.
#[derive(Clone, Default)]
pub struct StreamBuf {
    data: Rc<RefCell<BytesMut>>,
}

impl StreamBuf {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: Rc::new(RefCell::new(BytesMut::with_capacity(capacity))) }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }

    /// Copies out the buffered bytes without consuming them.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.borrow().to_vec()
    }

    /// Discards up to `n` bytes from the front.
    pub fn consume(&self, n: usize) {
        let mut data = self.data.borrow_mut();
        let n = n.min(data.len());
        data.advance(n);
    }

    /// Discards everything.
    pub fn clear(&self) {
        self.data.borrow_mut().clear();
    }

    /// Appends `bytes` to the back.
    pub fn extend_from_slice(&self, bytes: &[u8]) {
        self.data.borrow_mut().extend_from_slice(bytes);
    }

    /// Removes and returns the bytes up to and including the first `delim`.
    ///
    /// Returns `None`, leaving the buffer untouched, if `delim` is not buffered.
    pub fn read_until(&self, delim: u8) -> Option<Bytes> {
        let pos = self.find(delim, 0)?;
        Some(self.data.borrow_mut().split_to(pos + 1).freeze())
    }

    /// Removes and returns the next line without its trailing `\n`.
    ///
    /// A final line without a newline is returned as is. Returns `None` once the buffer is empty.
    /// Invalid UTF-8 is replaced.
    pub fn read_line(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let line = match self.read_until(b'\n') {
            Some(line) => line.slice(..line.len() - 1),
            None => self.data.borrow_mut().split().freeze(),
        };
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Position of the first `delim` at or after `from`.
    pub(crate) fn find(&self, delim: u8, from: usize) -> Option<usize> {
        let data = self.data.borrow();
        let from = from.min(data.len());
        memchr::memchr(delim, &data[from..]).map(|pos| from + pos)
    }

    /// Runs `f` with mutable access to the storage.
    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        f(&mut self.data.borrow_mut())
    }
}

impl fmt::Debug for StreamBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamBuf").field(&self.data.borrow()).finish()
    }
}
