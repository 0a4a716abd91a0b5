//! The single-threaded reactor that drives pipe I/O.

use crate::PipeConfig;
use std::{
    cell::Cell,
    fmt,
    future::Future,
    io,
    rc::{Rc, Weak},
};
use tokio::{
    runtime::{Builder, EnterGuard, Runtime},
    sync::Notify,
    task::LocalSet,
};

/// An event loop that owns a dedicated OS poller and runs pipe operations to completion.
///
/// Operations scheduled on pipes bound to a context are dormant until [`run`](Self::run) is
/// called on the thread that owns the context. Completions run one at a time, in the order their
/// readiness is observed.
///
/// Cloning an `IoContext` yields another handle to the same reactor. The type is `!Send`: every
/// thread that wants to drive pipes needs its own context, and contexts share no state.
#[derive(Clone)]
pub struct IoContext {
    inner: Rc<Inner>,
}

struct Inner {
    // Dropped before the runtime so that pending operations deregister from a live driver.
    tasks: LocalSet,
    runtime: Runtime,
    pending: Cell<usize>,
    completed: Cell<usize>,
    stopped: Cell<bool>,
    wake: Notify,
    config: PipeConfig,
}

impl IoContext {
    /// Creates a reactor with the default [`PipeConfig`].
    pub fn new() -> io::Result<Self> {
        Self::with_config(PipeConfig::default())
    }

    /// Creates a reactor with the given config.
    pub fn with_config(config: PipeConfig) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_io().build()?;
        trace!(?config, "created io context");
        Ok(Self {
            inner: Rc::new(Inner {
                tasks: LocalSet::new(),
                runtime,
                pending: Cell::new(0),
                completed: Cell::new(0),
                stopped: Cell::new(false),
                wake: Notify::new(),
                config,
            }),
        })
    }

    /// The config pipes bound to this context use.
    pub fn config(&self) -> &PipeConfig {
        &self.inner.config
    }

    /// Drives the reactor until no operation is pending or the context is stopped.
    ///
    /// Returns the number of completions that ran. Returns `0` immediately if the context is
    /// stopped.
    ///
    /// # Panics
    ///
    /// If called from inside a completion or from within another async runtime.
    pub fn run(&self) -> usize {
        let inner = &*self.inner;
        if inner.stopped.get() {
            return 0;
        }
        let before = inner.completed.get();
        trace!(pending = inner.pending.get(), "running io context");
        inner.runtime.block_on(inner.tasks.run_until(async {
            while inner.pending.get() > 0 && !inner.stopped.get() {
                inner.wake.notified().await;
            }
        }));
        let ran = inner.completed.get() - before;
        trace!(ran, pending = inner.pending.get(), "io context idle");
        ran
    }

    /// Makes [`run`](Self::run) return as soon as possible, and subsequent calls return
    /// immediately until [`restart`](Self::restart) is called.
    ///
    /// Pending operations stay scheduled.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
        self.inner.wake.notify_one();
    }

    /// Whether the context has been stopped.
    pub fn stopped(&self) -> bool {
        self.inner.stopped.get()
    }

    /// Clears the stopped state.
    pub fn restart(&self) {
        self.inner.stopped.set(false);
    }

    /// Number of scheduled operations whose completion has not run yet.
    pub fn pending(&self) -> usize {
        self.inner.pending.get()
    }

    /// Schedules `task` to run the next time the context is driven.
    ///
    /// `run` waits for spawned tasks the same way it waits for pipe operations.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let inner = &self.inner;
        inner.pending.set(inner.pending.get() + 1);
        let guard = PendingGuard(Rc::downgrade(inner));
        inner.tasks.spawn_local(async move {
            task.await;
            guard.complete();
        });
    }

    /// Enters the runtime so that new handles register with this context's poller.
    pub(crate) fn enter(&self) -> EnterGuard<'_> {
        self.inner.runtime.enter()
    }

    /// Whether both handles refer to the same reactor.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("pending", &self.inner.pending.get())
            .field("stopped", &self.inner.stopped.get())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Keeps a scheduled task counted as pending until it finishes or is dropped.
struct PendingGuard(Weak<Inner>);

impl PendingGuard {
    fn complete(self) {
        if let Some(inner) = self.0.upgrade() {
            inner.completed.set(inner.completed.get() + 1);
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let Some(inner) = self.0.upgrade() else { return };
        let pending = inner.pending.get() - 1;
        inner.pending.set(pending);
        if pending == 0 {
            inner.wake.notify_one();
        }
    }
}
