#![warn(unused_crate_dependencies, unreachable_pub)]

#[macro_use]
extern crate tracing;

// Macros useful for testing.
mod macros;

use std::{
    io,
    path::{Path, PathBuf},
};

/// Initializes tracing for tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Returns a path in the temp dir that nothing lives at yet.
pub fn unique_pipe_path() -> PathBuf {
    std::env::temp_dir().join(format!("pipekit-{}", uuid::Uuid::new_v4()))
}

/// Removes the named pipe at `path`.
///
/// A missing entry is not an error.
pub fn remove_pipe(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => {
            trace!(path = %path.display(), "removed named pipe");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// A unique named-pipe path that is removed when dropped.
#[derive(Debug)]
pub struct PipePath {
    path: PathBuf,
}

impl PipePath {
    /// Reserves a fresh path, see [`unique_pipe_path`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for PipePath {
    fn default() -> Self {
        Self { path: unique_pipe_path() }
    }
}

impl AsRef<Path> for PipePath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Drop for PipePath {
    fn drop(&mut self) {
        if let Err(err) = remove_pipe(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove named pipe");
        }
    }
}
