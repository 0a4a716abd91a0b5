//! # pipekit
//!
//! Duplex pipes whose reads and writes are driven by a single-threaded reactor.
//!
//! An [`AsyncPipe`] owns both ends of an anonymous or named pipe and is bound to an
//! [`IoContext`]. Writes and delimiter-terminated reads are scheduled with a completion callback
//! and make progress only while the context [runs](IoContext::run). A [`Pipe`] is the plain,
//! blocking counterpart, suitable for handing to a child process through [`process::Command`].
//!
//! ```no_run
//! use pipekit::{AsyncPipe, IoContext, StreamBuf};
//!
//! let ctx = IoContext::new()?;
//! let pipe = AsyncPipe::new(&ctx)?;
//! let buf = StreamBuf::new();
//!
//! pipe.async_write("hello\n", |res| assert_eq!(res.unwrap(), 6));
//! pipe.async_read_until(&buf, b'\n', |res| assert_eq!(res.unwrap(), 6));
//! ctx.run();
//!
//! assert_eq!(buf.read_line().as_deref(), Some("hello"));
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[cfg(not(unix))]
compile_error!("pipekit only supports unix targets");

#[macro_use]
extern crate tracing;

// Used by the `echo-named-pipe` binary.
use clap as _;
use eyre as _;
use tracing_subscriber as _;

mod async_pipe;
pub use async_pipe::AsyncPipe;

mod buf;
pub use buf::StreamBuf;

pub mod config;
pub use config::PipeConfig;

mod error;
pub use error::{PipeError, SpawnError};

mod pipe;
pub use pipe::Pipe;

pub mod process;

mod reactor;
pub use reactor::IoContext;

mod sys;
pub use sys::{INVALID_HANDLE, RawHandle};
