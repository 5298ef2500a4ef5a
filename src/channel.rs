//! Per-channel state machine, inbound queue, and writer half.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Grounded on `penguin_mux::stream::MuxStream` / `EstablishedStreamData` in
//! `mux/inner.rs`: an `mpsc::Sender<Bytes>` feeding the application's read
//! side, an `AtomicBool`-guarded "no more writes" flag, and a queue the
//! reader task owns the producer half of. Generalized here to the
//! offer/accept/reject/terminate state machine of spec.md §4.3, which the
//! teacher's single-round-trip `Connect`/`Acknowledge` handshake doesn't need.
//!
//! A `Channel` holds only a cheap [`OutboundFrame`] sender and a channel-id
//! notifier back to the stream's bookkeeping task — never a strong reference
//! to the owning [`crate::MultiplexingStream`] — so the stream and its
//! channels never form a reference cycle (spec.md §9).

use crate::config::MAX_PAYLOAD_LEN_USIZE;
use crate::dupe::Dupe;
use crate::error::Error;
use crate::frame::{ControlCode, OutboundFrame};
use crate::oneshot::{self, Awaiter, Resolver};
use crate::options::ChannelOptions;
use bytes::Bytes;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Lifecycle states of a channel (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Offered by one party, not yet accepted, rejected, or terminated.
    Offered,
    /// Accepted by the receiving party; content may flow in both directions.
    Accepted,
    /// Rejected locally or cancelled before acceptance.
    RejectedOrCanceled,
    /// Torn down, either locally or by the remote party.
    Terminated,
}

/// Why a channel's completion signal resolved.
#[derive(Debug, Clone)]
pub enum TerminationReason {
    /// The channel ran its course: accepted, used, and closed normally.
    Completed,
    /// The offer was rejected or cancelled before it was ever accepted.
    Rejected,
    /// The remote party sent `ChannelTerminated`.
    RemoteTerminated,
    /// The whole stream was disposed out from under this channel.
    StreamClosed(Arc<Error>),
}

type AcceptanceResolver = Resolver<ChannelOptions, Error>;
type CompletionResolver = Resolver<TerminationReason, Infallible>;

/// The one-shot a caller awaits to learn whether an offer was accepted, and
/// with what final [`ChannelOptions`].
pub type AcceptanceAwaiter = Awaiter<ChannelOptions, Error>;
/// The one-shot a caller awaits to learn why a channel ended.
pub type CompletionAwaiter = Awaiter<TerminationReason, Infallible>;

struct Mutable {
    state: ChannelState,
    options: ChannelOptions,
    acceptance: Option<AcceptanceResolver>,
    completion: Option<CompletionResolver>,
    pending_writes: Vec<Bytes>,
    write_half_closed: bool,
}

struct Shared {
    id: u32,
    name: String,
    frame_tx: mpsc::UnboundedSender<OutboundFrame>,
    dropped_tx: mpsc::UnboundedSender<u32>,
    inbound_tx: mpsc::Sender<Option<Bytes>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Option<Bytes>>>,
    mutable: Mutex<Mutable>,
}

/// A handle to one multiplexed channel. Cheap to duplicate via [`Dupe`]; all
/// clones observe the same underlying state.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Dupe for Channel {
    fn dupe(&self) -> Self {
        Self {
            shared: self.shared.dupe(),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.mutable.lock().state;
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &state)
            .finish()
    }
}

impl Channel {
    /// Construct a freshly offered channel (local or remote origin) in state
    /// `Offered`, returning the handle alongside the one-shot acceptance and
    /// completion awaiters. Exactly one caller owns each awaiter: the
    /// offering side for acceptance (or nobody, if it's dropped), and
    /// whichever code path first wants to observe termination.
    pub(crate) fn new_offered(
        id: u32,
        name: String,
        options: ChannelOptions,
        frame_tx: mpsc::UnboundedSender<OutboundFrame>,
        dropped_tx: mpsc::UnboundedSender<u32>,
    ) -> (Self, AcceptanceAwaiter, CompletionAwaiter) {
        // The inbound queue buffers whole `Content` frames, not raw bytes, so
        // a byte budget is converted to slots at the wire's maximum frame
        // size (rounding up, since a single frame under that size still
        // occupies a whole slot). mpsc also requires a finite bound; cap even
        // "unbounded" requests at a generous but finite size so a
        // misbehaving peer cannot exhaust memory via one channel's inbound
        // queue (spec.md §9).
        let requested_bytes = options.input_pipe_capacity.unwrap_or(usize::MAX);
        let requested_slots = requested_bytes.div_ceil(MAX_PAYLOAD_LEN_USIZE).max(1);
        let bounded_capacity = requested_slots.clamp(1, 4096);
        let (inbound_tx, inbound_rx) = mpsc::channel(bounded_capacity);
        let (acceptance, acceptance_awaiter) = oneshot::deferred::<ChannelOptions, Error, ()>(None);
        let (completion, completion_awaiter) = oneshot::deferred::<TerminationReason, Infallible, ()>(None);
        let channel = Self {
            shared: Arc::new(Shared {
                id,
                name,
                frame_tx,
                dropped_tx,
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                mutable: Mutex::new(Mutable {
                    state: ChannelState::Offered,
                    options,
                    acceptance: Some(acceptance),
                    completion: Some(completion),
                    pending_writes: Vec::new(),
                    write_half_closed: false,
                }),
            }),
        };
        (channel, acceptance_awaiter, completion_awaiter)
    }

    /// This channel's id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// This channel's name. Empty for anonymous channels.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The channel's current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.shared.mutable.lock().state
    }

    /// Attempt the `Offered -> Accepted` transition (spec.md §4.3). On
    /// success, flushes any writes buffered before acceptance as `Content`
    /// frames and resolves the acceptance signal. Returns `false` if the
    /// channel was not in `Offered` state.
    pub(crate) fn try_accept_offer(&self, options: ChannelOptions) -> bool {
        let (flushed, resolver) = {
            let mut mutable = self.shared.mutable.lock();
            if mutable.state != ChannelState::Offered {
                return false;
            }
            mutable.state = ChannelState::Accepted;
            mutable.options = options.clone();
            let flushed = std::mem::take(&mut mutable.pending_writes);
            (flushed, mutable.acceptance.take())
        };
        for chunk in flushed {
            self.send_content_chunks(&chunk);
        }
        if let Some(mut resolver) = resolver {
            resolver.resolve(options);
        }
        debug!(channel_id = self.shared.id, "channel accepted");
        true
    }

    /// Attempt the `Offered -> RejectedOrCanceled` transition. Used by local
    /// `rejectChannel` and by cancellation of an outstanding
    /// `offerChannelAsync`. Returns `false` if the channel was not offered.
    pub(crate) fn try_cancel_offer(&self, err: Error) -> bool {
        let resolvers = {
            let mut mutable = self.shared.mutable.lock();
            if mutable.state != ChannelState::Offered {
                return false;
            }
            mutable.state = ChannelState::RejectedOrCanceled;
            (mutable.acceptance.take(), mutable.completion.take())
        };
        if let Some(mut acceptance) = resolvers.0 {
            acceptance.reject(err);
        }
        if let Some(mut completion) = resolvers.1 {
            completion.resolve(TerminationReason::Rejected);
        }
        debug!(channel_id = self.shared.id, "offer cancelled locally");
        true
    }

    /// Called by the reader loop when an `OfferAccepted` frame arrives for a
    /// channel we offered. Returns `false` if we had already cancelled the
    /// offer locally (cross-in-flight race, spec.md §4.5): the caller should
    /// silently ignore a `false` return.
    pub(crate) fn on_accepted(&self) -> bool {
        let (flushed, resolved) = {
            let mut mutable = self.shared.mutable.lock();
            if mutable.state != ChannelState::Offered {
                (Vec::new(), None)
            } else {
                mutable.state = ChannelState::Accepted;
                let flushed = std::mem::take(&mut mutable.pending_writes);
                let options = mutable.options.clone();
                (flushed, mutable.acceptance.take().map(|r| (r, options)))
            }
        };
        let accepted = resolved.is_some();
        for chunk in &flushed {
            self.send_content_chunks(chunk);
        }
        if let Some((mut resolver, options)) = resolved {
            resolver.resolve(options);
        }
        if accepted {
            debug!(channel_id = self.shared.id, "remote accepted our offer");
        }
        accepted
    }

    /// Called by the reader loop when `ChannelTerminated` arrives, or by
    /// stream-wide disposal. Transitions out of any live state, resolving
    /// acceptance (if still `Offered`) and completion signals appropriately.
    /// A no-op if the channel is already `Terminated`. Returns whether this
    /// call actually performed the transition.
    pub(crate) fn on_remote_terminated(&self, reason: TerminationReason) -> bool {
        let transitioned = {
            let mut mutable = self.shared.mutable.lock();
            if mutable.state == ChannelState::Terminated {
                None
            } else {
                let was_offered = mutable.state == ChannelState::Offered;
                mutable.state = ChannelState::Terminated;
                Some((was_offered, mutable.acceptance.take(), mutable.completion.take()))
            }
        };
        let Some((was_offered, acceptance, completion)) = transitioned else {
            return false;
        };
        if was_offered {
            if let Some(mut acceptance) = acceptance {
                acceptance.reject(Error::OfferRejected(self.shared.id));
            }
        }
        if let Some(mut completion) = completion {
            completion.resolve(reason);
        }
        debug!(channel_id = self.shared.id, "channel terminated");
        true
    }

    /// Terminate this channel from the local side: send `ChannelTerminated`
    /// (unless it's already terminated, in which case the remote already
    /// knows), transition to `Terminated`, and notify the stream's
    /// bookkeeping task so it can drop this id from the registry.
    pub(crate) fn terminate_locally(&self, reason: TerminationReason) {
        if self.on_remote_terminated(reason) {
            self.send_frame(OutboundFrame::control(ControlCode::ChannelTerminated, self.shared.id));
        }
        let _ = self.shared.dropped_tx.send(self.shared.id);
    }

    /// Dispose of this channel handle: terminate it from the local side if
    /// it is still live. A no-op if it has already ended.
    pub fn dispose(&self) {
        self.terminate_locally(TerminationReason::Completed);
    }

    /// Write `data` to the channel. Buffered locally (unbounded) until the
    /// channel is `Accepted`, after which it is split into `Content` frames
    /// each at most `MAX_PAYLOAD_LEN` bytes (spec.md §4.3).
    pub fn write(&self, data: Bytes) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        let mut mutable = self.shared.mutable.lock();
        match mutable.state {
            ChannelState::Terminated | ChannelState::RejectedOrCanceled => {
                return Err(Error::AlreadyDisposed);
            }
            ChannelState::Offered => {
                mutable.pending_writes.push(data);
                return Ok(());
            }
            ChannelState::Accepted => {}
        }
        if mutable.write_half_closed {
            return Err(Error::AlreadyDisposed);
        }
        drop(mutable);
        self.send_content_chunks(&data);
        Ok(())
    }

    /// Declare that no more writes will occur. Sends `ContentWritingCompleted`
    /// exactly once (spec.md §4.3).
    pub fn shutdown_write(&self) -> Result<(), Error> {
        let should_send = {
            let mut mutable = self.shared.mutable.lock();
            if mutable.state == ChannelState::Terminated || mutable.state == ChannelState::RejectedOrCanceled {
                return Err(Error::AlreadyDisposed);
            }
            let already = mutable.write_half_closed;
            mutable.write_half_closed = true;
            !already
        };
        if should_send {
            self.send_frame(OutboundFrame::control(ControlCode::ContentWritingCompleted, self.shared.id));
        }
        Ok(())
    }

    /// Read the next chunk of payload, or `None` at end-of-stream. The
    /// inbound queue is logically single-consumer (spec.md §3); concurrent
    /// callers are merely serialized, not fanned out.
    pub async fn read(&self) -> Option<Bytes> {
        let mut rx = self.shared.inbound_rx.lock().await;
        rx.recv().await.flatten()
    }

    /// Deliver an inbound `Content` payload (reader-loop only).
    pub(crate) async fn deliver_content(&self, payload: Bytes) {
        if self.shared.inbound_tx.send(Some(payload)).await.is_err() {
            trace!(channel_id = self.shared.id, "dropped content, reader gone");
        }
    }

    /// Deliver the end-of-stream sentinel (reader-loop only).
    pub(crate) async fn deliver_eof(&self) {
        let _ = self.shared.inbound_tx.send(None).await;
    }

    fn send_content_chunks(&self, data: &Bytes) {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_PAYLOAD_LEN_USIZE).min(data.len());
            let chunk = data.slice(offset..end);
            if let Ok(frame) = OutboundFrame::new(ControlCode::Content, self.shared.id, chunk) {
                self.send_frame(frame);
            }
            offset = end;
        }
    }

    fn send_frame(&self, frame: OutboundFrame) {
        let _ = self.shared.frame_tx.send(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offered_channel(id: u32) -> (Channel, mpsc::UnboundedReceiver<OutboundFrame>, mpsc::UnboundedReceiver<u32>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let (channel, _acceptance, _completion) =
            Channel::new_offered(id, String::new(), ChannelOptions::default(), frame_tx, dropped_tx);
        (channel, frame_rx, dropped_rx)
    }

    #[test]
    fn input_pipe_capacity_is_sized_in_whole_frames() {
        let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
        let (dropped_tx, _dropped_rx) = mpsc::unbounded_channel();
        let options = ChannelOptions {
            input_pipe_capacity: Some(3 * MAX_PAYLOAD_LEN_USIZE),
        };
        let (channel, _a, _c) = Channel::new_offered(1, String::new(), options, frame_tx, dropped_tx);
        assert_eq!(channel.shared.inbound_rx.try_lock().unwrap().max_capacity(), 3);
    }

    #[test]
    fn a_capacity_smaller_than_one_frame_still_reserves_a_whole_slot() {
        let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
        let (dropped_tx, _dropped_rx) = mpsc::unbounded_channel();
        let options = ChannelOptions {
            input_pipe_capacity: Some(1),
        };
        let (channel, _a, _c) = Channel::new_offered(1, String::new(), options, frame_tx, dropped_tx);
        assert_eq!(channel.shared.inbound_rx.try_lock().unwrap().max_capacity(), 1);
    }

    #[test]
    fn writes_before_acceptance_are_buffered_then_flushed() {
        let (channel, mut frame_rx, _dropped_rx) = offered_channel(1);
        channel.write(Bytes::from_static(b"queued")).unwrap();
        assert!(frame_rx.try_recv().is_err(), "nothing should be sent before acceptance");

        assert!(channel.try_accept_offer(ChannelOptions::default()));
        let frame = frame_rx.try_recv().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"queued"));
    }

    #[tokio::test]
    async fn cancelling_an_offer_already_accepted_by_the_remote_still_terminates() {
        // Mirrors the race `MultiplexingStream::offer_channel_async` resolves
        // when the remote's `OfferAccepted` crosses a local cancellation in
        // flight: `try_cancel_offer` loses because the channel is no longer
        // `Offered`, so the caller falls back to `terminate_locally`.
        let (channel, mut frame_rx, mut dropped_rx) = offered_channel(7);
        assert!(channel.on_accepted());

        assert!(!channel.try_cancel_offer(Error::Cancelled));
        assert_eq!(channel.state(), ChannelState::Accepted);

        channel.terminate_locally(TerminationReason::Rejected);

        assert_eq!(channel.state(), ChannelState::Terminated);
        let frame = frame_rx.try_recv().unwrap();
        assert_eq!(frame.header[0], ControlCode::ChannelTerminated as u8);
        assert_eq!(dropped_rx.recv().await.unwrap(), 7);
    }

    #[test]
    fn on_accepted_is_a_no_op_once_already_cancelled() {
        let (channel, _frame_rx, _dropped_rx) = offered_channel(2);
        assert!(channel.try_cancel_offer(Error::Cancelled));
        assert!(!channel.on_accepted(), "a cancelled offer cannot still be accepted");
        assert_eq!(channel.state(), ChannelState::RejectedOrCanceled);
    }

    #[test]
    fn write_after_termination_is_rejected() {
        let (channel, _frame_rx, _dropped_rx) = offered_channel(3);
        channel.terminate_locally(TerminationReason::Completed);
        assert!(matches!(channel.write(Bytes::from_static(b"too late")), Err(Error::AlreadyDisposed)));
    }

    #[test]
    fn shutdown_write_sends_the_frame_only_once() {
        let (channel, mut frame_rx, _dropped_rx) = offered_channel(4);
        channel.try_accept_offer(ChannelOptions::default());
        channel.shutdown_write().unwrap();
        channel.shutdown_write().unwrap();
        let mut count = 0;
        while frame_rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
