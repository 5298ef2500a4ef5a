//! The stream-wide completion signal.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Unlike a per-channel [`crate::oneshot::Resolver`], disposal of the whole
//! [`crate::MultiplexingStream`] may need to be observed from several
//! places at once (application code awaiting `completion()`, plus internal
//! bookkeeping). `tokio::sync::watch` is built exactly for that: a single
//! writer, many cheaply-cloned readers, each able to ask "has this resolved
//! yet" without consuming the value.

use crate::error::Error;
use std::sync::Arc;
use tokio::sync::watch;

/// The producer half, held by the stream's internal state. Resolving twice
/// is a no-op; the first resolution wins.
#[derive(Debug)]
pub(crate) struct CompletionSource {
    tx: watch::Sender<Option<Arc<Error>>>,
}

/// The consumer half, cheaply cloned and handed out to any number of callers.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<Arc<Error>>>,
}

/// Create a fresh, unresolved completion signal.
pub(crate) fn completion_pair() -> (CompletionSource, Completion) {
    let (tx, rx) = watch::channel(None);
    (CompletionSource { tx }, Completion { rx })
}

impl CompletionSource {
    /// Resolve the signal. `cause` is `None` for a clean, locally-requested
    /// disposal, or `Some` for disposal triggered by a fatal error. Returns
    /// `false` if the signal had already resolved.
    pub fn resolve(&self, cause: Option<Arc<Error>>) -> bool {
        let mut resolved = false;
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(cause.unwrap_or_else(|| Arc::new(Error::AlreadyDisposed)));
                resolved = true;
                true
            }
        });
        resolved
    }

    /// Whether the signal has already resolved.
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Completion {
    /// Wait for the stream to be disposed. Resolves immediately if disposal
    /// already happened before this call.
    pub async fn completed(&mut self) {
        let _ = self
            .rx
            .wait_for(Option::is_some)
            .await;
    }

    /// Non-blocking check of whether the stream has been disposed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_once() {
        let (source, mut completion) = completion_pair();
        assert!(!completion.is_completed());
        assert!(source.resolve(None));
        assert!(!source.resolve(None), "second resolve must lose");
        completion.completed().await;
        assert!(completion.is_completed());
    }

    #[tokio::test]
    async fn multiple_waiters_all_observe_resolution() {
        let (source, completion) = completion_pair();
        let mut a = completion.clone();
        let mut b = completion.clone();
        source.resolve(Some(Arc::new(Error::IdSpaceExhausted)));
        a.completed().await;
        b.completed().await;
    }
}
