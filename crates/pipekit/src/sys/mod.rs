//! Platform primitives behind [`Pipe`](crate::Pipe) and [`AsyncPipe`](crate::AsyncPipe).

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{INVALID_HANDLE, RawHandle};
#[cfg(unix)]
pub(crate) use unix::*;
