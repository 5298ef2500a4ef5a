//! A lightweight, single-use cancellation signal for async accept/offer calls.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `tokio-util`'s `CancellationToken` isn't part of the dependency stack this
//! crate carries, and a full broadcast token would be overkill: spec.md's
//! cancellable calls (`offerChannelAsync`, `acceptChannelByNameAsync`) each
//! have exactly one caller and one cancellation source. A plain
//! [`tokio::sync::oneshot`] pair, in the same spirit as [`crate::oneshot`],
//! covers it.

use tokio::sync::oneshot;

/// The caller-held half: signals cancellation once, then is consumed.
#[derive(Debug)]
pub struct CancellationHandle(oneshot::Sender<()>);

impl CancellationHandle {
    /// Signal cancellation. A no-op if the paired [`Cancellation`] was
    /// already dropped or already observed as cancelled.
    pub fn cancel(self) {
        let _ = self.0.send(());
    }
}

/// The callee-held half, passed into a cancellable operation.
#[derive(Debug)]
pub struct Cancellation(oneshot::Receiver<()>);

impl Cancellation {
    /// Resolves when [`CancellationHandle::cancel`] is called. If the
    /// handle is dropped without cancelling, this never resolves, so it is
    /// meant to be raced against the operation's own completion, never
    /// awaited alone.
    pub(crate) async fn cancelled(&mut self) {
        match (&mut self.0).await {
            Ok(()) => {}
            Err(_) => std::future::pending::<()>().await,
        }
    }
}

/// Create a fresh cancellation pair.
#[must_use]
pub fn cancellation_pair() -> (CancellationHandle, Cancellation) {
    let (tx, rx) = oneshot::channel();
    (CancellationHandle(tx), Cancellation(rx))
}

impl Default for Cancellation {
    /// A `Cancellation` that never fires, for callers that don't need one.
    fn default() -> Self {
        let (_handle, cancellation) = cancellation_pair();
        cancellation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_the_waiter() {
        let (handle, mut cancellation) = cancellation_pair();
        handle.cancel();
        cancellation.cancelled().await;
    }

    #[tokio::test]
    async fn default_never_resolves() {
        let mut cancellation = Cancellation::default();
        tokio::select! {
            _ = cancellation.cancelled() => panic!("default cancellation must never fire"),
            () = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
        }
    }
}
