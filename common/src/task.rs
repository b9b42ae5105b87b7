use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

/// A thin wrapper around [`tokio::task::JoinHandle`] which carries the
/// task's name and adds the `#[must_use]` lint so spawned tasks are either
/// joined or explicitly annotated that no joining is required.
#[must_use]
pub struct LxTask<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> LxTask<T> {
    pub fn spawn_named<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> LxTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        LxTask {
            handle: tokio::spawn(future),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abort(&self) {
        self.handle.abort()
    }

    /// Await the task, logging its outcome. Returns the task's name.
    pub async fn logged(self) -> Cow<'static, str> {
        let name = self.name.clone();
        match self.await {
            Ok(_) => info!("Task finished: {name}"),
            Err(join_err) if join_err.is_cancelled() =>
                info!("Task cancelled: {name}"),
            Err(join_err) => warn!("Task panicked: {name}: {join_err:#}"),
        }
        name
    }
}

impl<T> Future for LxTask<T> {
    type Output = Result<T, JoinError>;
    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_returns_output() {
        let task = LxTask::spawn_named("the answer", async { 42 });
        assert_eq!(task.name(), "the answer");
        assert_eq!(task.await.unwrap(), 42);
    }
}
