//! Single-producer, one-shot completion with attached state.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Modeled on [`penguin_mux::inner::FlowSlot`]: a `tokio::sync::oneshot`
//! that additionally carries a piece of immutable state created alongside
//! the sender (there, the stream's eventual handle; here, either a waiting
//! accepter's [`ChannelOptions`](crate::options::ChannelOptions) or nothing).
//! `resolve`/`reject` report whether *this* call won the race to complete
//! the one-shot, the same contract as `FlowSlot::establish` returning
//! `Option<oneshot::Sender<..>>`.

use tokio::sync::oneshot;

/// The producer half of a [`Deferred`]. Exactly one of `resolve`/`reject`
/// may successfully complete it; later calls are no-ops and return `false`.
pub struct Resolver<T, E, S = ()> {
    sender: Option<oneshot::Sender<Result<T, E>>>,
    state: Option<S>,
}

/// The consumer half of a [`Deferred`].
pub type Awaiter<T, E> = oneshot::Receiver<Result<T, E>>;

/// Create a one-shot completion carrying an optional attached state `S`.
pub fn deferred<T, E, S>(state: Option<S>) -> (Resolver<T, E, S>, Awaiter<T, E>) {
    let (tx, rx) = oneshot::channel();
    (
        Resolver {
            sender: Some(tx),
            state,
        },
        rx,
    )
}

impl<T, E, S> Resolver<T, E, S> {
    /// The state attached at construction, if any.
    #[must_use]
    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// Complete the one-shot successfully. Returns `true` if this call won
    /// the race (the one-shot had not already been resolved or rejected).
    pub fn resolve(&mut self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete the one-shot with a failure. Returns `true` if this call won
    /// the race.
    pub fn reject(&mut self, err: E) -> bool {
        self.complete(Err(err))
    }

    /// Whether this resolver has already been consumed (by either a
    /// successful `resolve`/`reject`, or by the receiver being dropped).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.sender.is_some()
    }

    fn complete(&mut self, result: Result<T, E>) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_wins_once() {
        let (mut resolver, awaiter) = deferred::<u32, &str, ()>(None);
        assert!(resolver.resolve(7));
        assert!(!resolver.resolve(8), "second resolve must not win");
        assert_eq!(awaiter.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn reject_reports_the_error() {
        let (mut resolver, awaiter) = deferred::<u32, &str, ()>(None);
        assert!(resolver.reject("nope"));
        assert_eq!(awaiter.await.unwrap(), Err("nope"));
    }

    #[test]
    fn carries_attached_state() {
        let (resolver, _awaiter) = deferred::<u32, &str, &'static str>(Some("accepter-options"));
        assert_eq!(resolver.state(), Some(&"accepter-options"));
    }

    #[tokio::test]
    async fn dropping_the_awaiter_makes_resolve_lose() {
        let (mut resolver, awaiter) = deferred::<u32, &str, ()>(None);
        drop(awaiter);
        assert!(!resolver.resolve(1));
    }
}
