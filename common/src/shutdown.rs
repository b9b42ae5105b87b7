use std::sync::Arc;

use tokio::sync::Semaphore;

/// A synchronization utility for sending / receiving shutdown signals.
///
/// - Multi-producer, multi-consumer: clone to get another handle.
/// - Every clone observes the shutdown signal at most once, but clones made
///   after the signal was sent can still observe it.
/// - Sending more than once is harmless.
///
/// Internally, calling [`acquire`] on a [`Semaphore`] with zero permits only
/// returns once the semaphore has been closed; closing it is our "send".
///
/// [`acquire`]: Semaphore::acquire
#[derive(Debug)]
pub struct ShutdownChannel {
    inner: Arc<Semaphore>,
    have_recved: bool,
}

impl ShutdownChannel {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
            have_recved: false,
        }
    }

    /// Send a shutdown signal, waking all handles blocked in [`recv`].
    ///
    /// [`recv`]: ShutdownChannel::recv
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for a shutdown signal.
    ///
    /// If this handle has already observed a shutdown, this future never
    /// resolves; this makes `recv` safe to use inside `tokio::select!` loops
    /// which would otherwise spin.
    pub async fn recv(&mut self) {
        if self.have_recved {
            std::future::pending().await
        } else {
            self.inner
                .acquire()
                .await
                .map(|_| ())
                .expect_err("Zero-permit semaphore cannot be acquired");
            self.have_recved = true;
        }
    }

    /// Immediately returns whether a shutdown signal has been sent.
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Clone for ShutdownChannel {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            // Every clone gets its own chance to observe the shutdown.
            have_recved: false,
        }
    }
}
