//! Composite release scope
//!
//! Collects release actions for every resource opened during one agent
//! invocation and runs them as a unit: last registered, first released.

use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// LIFO set of pending release actions
#[derive(Default)]
pub struct ReleaseScope {
    entries: Vec<(String, ReleaseFn)>,
    released: bool,
}

impl ReleaseScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action under `label` (used in logs)
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        if self.released {
            tracing::warn!("Release scope already closed, '{}' registered late", label);
        }
        self.entries.push((label, Box::new(move || release().boxed())));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Run every pending action in reverse registration order
    ///
    /// Failures are logged and do not stop the remaining actions. Returns how
    /// many actions ran; a second call runs nothing.
    pub async fn release_all(&mut self) -> usize {
        self.released = true;
        let mut count = 0;
        while let Some((label, release)) = self.entries.pop() {
            count += 1;
            if let Err(e) = release().await {
                tracing::warn!("Failed to release '{}': {:#}", label, e);
            } else {
                tracing::debug!("Released '{}'", label);
            }
        }
        count
    }
}

impl Drop for ReleaseScope {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(
                "Release scope dropped with {} pending action(s); relying on resource drop guards",
                self.entries.len()
            );
        }
    }
}
