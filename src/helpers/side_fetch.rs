use std::{future::Future, sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::AbortHandle;

/// Result of an auxiliary lookup running next to the main download.
///
/// Cloning is cheap and every clone observes the same value. When the last
/// clone is dropped before the task finishes, the task is aborted.
#[derive(Clone)]
pub struct SideFetch<T: Clone> {
    value: Shared<BoxFuture<'static, Option<T>>>,
    task: Option<Arc<AbortOnDrop>>,
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> SideFetch<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Option<T>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let abort = handle.abort_handle();

        Self {
            value: async move { handle.await.ok().flatten() }.boxed().shared(),
            task: Some(Arc::new(AbortOnDrop(abort))),
        }
    }

    /// An already resolved fetch. Waiting on it never blocks.
    pub fn ready(value: Option<T>) -> Self {
        Self {
            value: futures::future::ready(value).boxed().shared(),
            task: None,
        }
    }

    pub fn empty() -> Self {
        Self::ready(None)
    }

    pub async fn wait(&self) -> Option<T> {
        self.value.clone().await
    }

    /// Like [`Self::wait`] but gives up after `limit`.
    pub async fn wait_for(&self, limit: Duration) -> Option<T> {
        tokio::time::timeout(limit, self.wait()).await.ok().flatten()
    }
}

impl<T: Clone> std::fmt::Debug for SideFetch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideFetch")
            .field("spawned", &self.task.is_some())
            .finish_non_exhaustive()
    }
}
