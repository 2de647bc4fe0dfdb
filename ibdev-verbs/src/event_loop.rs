//! tokio reactor adapter for [`ibdev::EventLoop`].

use ibdev::verbs::{EventLoop, ReadyHandler};
use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::Poll;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A descriptor owned elsewhere. Dropping it does not close the fd.
struct WatchedFd(RawFd);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Reactor registration shared by a reader's task and the loop. Emptied
/// by whoever stops watching first.
type Registration = Arc<Mutex<Option<AsyncFd<WatchedFd>>>>;

struct Reader {
    registration: Registration,
    task: JoinHandle<()>,
}

impl Reader {
    /// Deregister from the reactor before returning, so a descriptor number
    /// reused afterwards is not affected by this reader.
    fn stop(self) {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.task.abort();
    }
}

/// Wait for `registration` to turn readable and clear the readiness.
/// `Ok(false)` once the reader has been removed.
async fn next_ready(registration: &Registration) -> io::Result<bool> {
    poll_fn(|cx| {
        let guard = registration.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(async_fd) = guard.as_ref() else {
            return Poll::Ready(Ok(false));
        };
        match async_fd.poll_read_ready(cx) {
            Poll::Ready(Ok(mut ready)) => {
                // The handler drains after this, so no edge is lost.
                ready.clear_ready();
                Poll::Ready(Ok(true))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Runs each reader's handler on a tokio task whenever its descriptor turns
/// readable. Handlers are expected to drain the descriptor.
pub struct TokioEventLoop {
    handle: Handle,
    readers: Mutex<HashMap<RawFd, Reader>>,
}

impl TokioEventLoop {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Bind to the runtime of the calling task.
    pub fn current() -> io::Result<Self> {
        let handle = Handle::try_current().map_err(io::Error::other)?;
        Ok(Self::new(handle))
    }

    pub fn is_watching(&self, fd: RawFd) -> bool {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&fd)
    }
}

impl EventLoop for TokioEventLoop {
    fn add_reader(&self, fd: RawFd, handler: ReadyHandler) -> io::Result<()> {
        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        if readers.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {fd} is already watched"),
            ));
        }

        // Registration with the reactor needs the runtime context.
        let async_fd = {
            let _guard = self.handle.enter();
            AsyncFd::with_interest(WatchedFd(fd), Interest::READABLE)?
        };
        let registration: Registration = Arc::new(Mutex::new(Some(async_fd)));
        let task = self.handle.spawn({
            let registration = Arc::clone(&registration);
            async move {
                loop {
                    match next_ready(&registration).await {
                        Ok(true) => handler(),
                        Ok(false) => return,
                        Err(e) => {
                            tracing::warn!(fd, error = %e, "event loop reader failed");
                            return;
                        }
                    }
                }
            }
        });
        readers.insert(fd, Reader { registration, task });
        tracing::trace!(fd, "added reader");
        Ok(())
    }

    fn remove_reader(&self, fd: RawFd) {
        let reader = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);
        if let Some(reader) = reader {
            reader.stop();
            tracing::trace!(fd, "removed reader");
        }
    }
}

impl Drop for TokioEventLoop {
    fn drop(&mut self) {
        let readers = self.readers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, reader) in readers.drain() {
            reader.stop();
        }
    }
}
