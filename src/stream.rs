//! The public `MultiplexingStream` surface: handshake, task wiring, and the
//! offer/accept/reject operations.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Grounded on `penguin_mux::Multiplexor`/`MultiplexorInner` in
//! `mux/inner.rs`: a cheap, `Dupe`-able handle in front of an `Arc<Inner>`
//! that owns the registry and the channels to the reader/writer tasks.
//! Construction spawns exactly those two tasks plus a small bookkeeping
//! task draining `dropped_tx`, in place of the teacher's single
//! `poll_fn`-unified task — this engine's reader and writer are already
//! independent enough (no shared keepalive timer to coordinate) that three
//! plain `tokio::spawn`s are the more idiomatic shape here.

use crate::cancellation::Cancellation;
use crate::channel::{Channel, ChannelState, TerminationReason};
use crate::completion::{completion_pair, Completion, CompletionSource};
use crate::config::MAX_PAYLOAD_LEN_USIZE;
use crate::dupe::Dupe;
use crate::error::{Error, Result};
use crate::events::ChannelOffered;
use crate::frame::{ControlCode, OutboundFrame};
use crate::handshake::perform_handshake;
use crate::oneshot;
use crate::options::{ChannelOptions, MultiplexingStreamOptions};
use crate::registry::{Accepter, Registry, SharedRegistry};
use crate::reader::{self, ReaderContext};
use crate::writer;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
use tracing::{debug, instrument, trace};

struct Inner {
    frame_tx: mpsc::UnboundedSender<OutboundFrame>,
    dropped_tx: mpsc::UnboundedSender<u32>,
    registry: SharedRegistry,
    next_id: AtomicU32,
    completion_source: CompletionSource,
    completion: Completion,
    channel_offered_rx: TokioMutex<mpsc::Receiver<ChannelOffered>>,
    disposal: Arc<Notify>,
}

/// A multiplexed stream over one underlying byte transport. Cheap to
/// duplicate; every clone shares the same registry and background tasks.
#[derive(Clone)]
pub struct MultiplexingStream {
    inner: Arc<Inner>,
}

impl Dupe for MultiplexingStream {
    fn dupe(&self) -> Self {
        Self { inner: self.inner.dupe() }
    }
}

impl std::fmt::Debug for MultiplexingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexingStream")
            .field("channel_count", &self.inner.registry.lock().len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl MultiplexingStream {
    /// Perform the handshake on `transport`, then spawn the reader, writer,
    /// and dropped-channel bookkeeping tasks.
    #[instrument(skip_all)]
    pub async fn create<T>(mut transport: T, _options: MultiplexingStreamOptions) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let role = perform_handshake(&mut transport).await?;
        debug!(?role, "handshake complete");
        let (read_half, write_half) = tokio::io::split(transport);

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let (channel_offered_tx, channel_offered_rx) = mpsc::channel(32);
        let registry: SharedRegistry = Arc::new(SyncMutex::new(Registry::new()));
        let (completion_source, completion) = completion_pair();
        let disposal = Arc::new(Notify::new());

        let inner = Arc::new(Inner {
            frame_tx: frame_tx.clone(),
            dropped_tx: dropped_tx.clone(),
            registry: registry.clone(),
            next_id: AtomicU32::new(role.first_id()),
            completion_source,
            completion,
            channel_offered_rx: TokioMutex::new(channel_offered_rx),
            disposal: disposal.clone(),
        });

        tokio::spawn(writer::run(write_half, frame_rx, disposal.clone()));

        let reader_ctx = ReaderContext {
            registry: registry.clone(),
            frame_tx: frame_tx.clone(),
            dropped_tx: dropped_tx.clone(),
            channel_offered_tx,
            default_channel_options: ChannelOptions::default(),
            disposal,
        };
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let result = reader::run(read_half, reader_ctx).await;
            reader_inner.on_reader_exit(result);
        });

        let dropped_inner = inner.clone();
        tokio::spawn(async move {
            dropped_inner.run_dropped_ports_task(dropped_rx).await;
        });

        Ok(Self { inner })
    }

    /// Allocate a fresh anonymous channel, already in state `Offered`.
    /// Returns immediately; writes are buffered until the remote accepts it.
    #[instrument(skip(self, options))]
    pub fn create_channel(&self, options: ChannelOptions) -> Result<Channel> {
        self.inner.require_live()?;
        let id = self.inner.allocate_id()?;
        let (channel, _acceptance, _completion) = Channel::new_offered(
            id,
            String::new(),
            options,
            self.inner.frame_tx.clone(),
            self.inner.dropped_tx.clone(),
        );
        self.inner.registry.lock().insert(channel.clone());
        self.inner.send_frame(OutboundFrame::control(ControlCode::Offer, id));
        debug!(channel_id = id, "offered anonymous channel");
        Ok(channel)
    }

    /// Offer a named channel and await the remote's acceptance.
    #[instrument(skip(self, options, cancellation), fields(name = %name))]
    pub async fn offer_channel_async(
        &self,
        name: String,
        options: ChannelOptions,
        mut cancellation: Cancellation,
    ) -> Result<Channel> {
        self.inner.require_live()?;
        if name.len() > MAX_PAYLOAD_LEN_USIZE {
            return Err(Error::NameTooLong(name.len(), MAX_PAYLOAD_LEN_USIZE));
        }
        let id = self.inner.allocate_id()?;
        let (channel, acceptance_awaiter, _completion) = Channel::new_offered(
            id,
            name.clone(),
            options,
            self.inner.frame_tx.clone(),
            self.inner.dropped_tx.clone(),
        );
        self.inner.registry.lock().insert(channel.clone());
        self.inner
            .send_frame(OutboundFrame::new(ControlCode::Offer, id, Bytes::from(name.into_bytes()))?);
        trace!(channel_id = id, "sent named offer, awaiting acceptance");

        tokio::select! {
            () = cancellation.cancelled() => {
                if channel.try_cancel_offer(Error::Cancelled) {
                    self.inner.send_frame(OutboundFrame::control(ControlCode::ChannelTerminated, id));
                    // Leave the channel registered rather than evicting it here: a
                    // remote `OfferAccepted` may already be in flight and must still
                    // find this id to silently absorb it (spec.md §8 scenario 6).
                    // The reader evicts it once that crossing is resolved, or it is
                    // evicted along with everything else on stream disposal.
                    debug!(channel_id = id, "offer cancelled before acceptance");
                } else if channel.state() == ChannelState::Accepted {
                    // Crossed in flight with the remote's `OfferAccepted`: still
                    // terminate the now-accepted channel and report `Cancelled`.
                    debug!(channel_id = id, "cancellation crossed with remote acceptance");
                    channel.terminate_locally(TerminationReason::Rejected);
                }
                Err(Error::Cancelled)
            }
            result = acceptance_awaiter => match result {
                Ok(Ok(_options)) => {
                    debug!(channel_id = id, "offer accepted");
                    Ok(channel)
                }
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::StreamClosed(Arc::new(Error::AlreadyDisposed))),
            },
        }
    }

    /// Accept a previously offered channel by id.
    #[instrument(skip(self, options))]
    pub fn accept_channel(&self, id: u32, options: ChannelOptions) -> Result<Channel> {
        self.inner.require_live()?;
        let channel = self.inner.registry.lock().get(id).ok_or(Error::UnknownChannel(id))?;
        self.inner.registry.lock().remove_from_unmatched_offers(channel.name(), id);
        let channel = self.inner.finish_accept(channel, options)?;
        debug!(channel_id = id, "accepted channel by id");
        Ok(channel)
    }

    /// Accept the oldest unmatched remote offer with the given name, or
    /// register as a pending accepter and await one if none is available yet.
    #[instrument(skip(self, options, cancellation))]
    pub async fn accept_channel_by_name(
        &self,
        name: String,
        options: ChannelOptions,
        mut cancellation: Cancellation,
    ) -> Result<Channel> {
        self.inner.require_live()?;
        let immediate = {
            let mut registry = self.inner.registry.lock();
            loop {
                match registry.pop_unmatched_offer(&name) {
                    Some(channel) if channel.state() == ChannelState::Offered => break Some(channel),
                    Some(_stale) => continue,
                    None => break None,
                }
            }
        };
        if let Some(channel) = immediate {
            return self.inner.finish_accept(channel, options);
        }

        let (resolver, mut awaiter) = oneshot::deferred::<Channel, Error, ChannelOptions>(Some(options));
        let accepter: Accepter = Arc::new(SyncMutex::new(resolver));
        self.inner.registry.lock().push_accepter(name.clone(), accepter.clone());

        tokio::select! {
            () = cancellation.cancelled() => {
                // Hold the registry lock across both the removal check and the
                // reject so the reader's `pop_live_accepter` can't interleave
                // between them (src/reader.rs's `handle_offer`).
                let removed = {
                    let mut registry = self.inner.registry.lock();
                    let removed = registry.remove_accepter(&name, &accepter);
                    if removed {
                        accepter.lock().reject(Error::Cancelled);
                    }
                    removed
                };
                if removed {
                    debug!(name = %name, "pending accepter cancelled");
                    Err(Error::Cancelled)
                } else {
                    // The reader already matched this accepter to an incoming
                    // offer before the cancellation took effect: honor the
                    // match instead of silently dropping it (spec.md §5).
                    debug!(name = %name, "cancellation crossed with a matching offer");
                    match (&mut awaiter).await {
                        Ok(Ok(channel)) => Ok(channel),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(Error::StreamClosed(Arc::new(Error::AlreadyDisposed))),
                    }
                }
            }
            result = &mut awaiter => match result {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::StreamClosed(Arc::new(Error::AlreadyDisposed))),
            },
        }
    }

    /// Reject a channel the remote offered but that the application doesn't
    /// want. Sends `ChannelTerminated` and fails the remote's
    /// `offerChannelAsync` with `OfferRejected`.
    #[instrument(skip(self))]
    pub fn reject_channel(&self, id: u32) -> Result<()> {
        self.inner.require_live()?;
        let channel = self.inner.registry.lock().get(id).ok_or(Error::UnknownChannel(id))?;
        self.inner.registry.lock().remove_from_unmatched_offers(channel.name(), id);
        channel.terminate_locally(TerminationReason::Rejected);
        debug!(channel_id = id, "rejected offered channel");
        Ok(())
    }

    /// Await the next remotely offered channel notification.
    #[instrument(skip(self))]
    pub async fn next_channel_offered(&self) -> Option<ChannelOffered> {
        self.inner.channel_offered_rx.lock().await.recv().await
    }

    /// A cheaply-cloned handle to the stream-wide completion signal.
    #[must_use]
    pub fn completion(&self) -> Completion {
        self.inner.completion.clone()
    }

    /// Whether the stream has been disposed, locally or due to a fatal error.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.completion_source.is_resolved()
    }

    /// Dispose the stream: resolve the completion signal, terminate every
    /// live channel with [`TerminationReason::Completed`] (no per-channel
    /// `ChannelTerminated` frames — the transport teardown implies it), and
    /// shut down the write half. A no-op if already disposed.
    #[instrument(skip(self))]
    pub fn dispose(&self) {
        self.inner.dispose_with_cause(None);
    }
}

impl Inner {
    fn require_live(&self) -> Result<()> {
        if self.completion_source.is_resolved() {
            return Err(Error::AlreadyDisposed);
        }
        Ok(())
    }

    /// Allocate the next id for our role, permanently refusing once none
    /// remain instead of wrapping back into already-issued ids. A plain
    /// `fetch_add` would perform the wrapping addition unconditionally and
    /// only check the stale pre-increment value afterward, so a second call
    /// past exhaustion would silently hand out a reused small id (spec.md
    /// §3: ids are never reused).
    fn allocate_id(&self) -> Result<u32> {
        self.next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                if id > u32::MAX - 2 {
                    None
                } else {
                    Some(id + 2)
                }
            })
            .map_err(|_| Error::IdSpaceExhausted)
    }

    fn send_frame(&self, frame: OutboundFrame) {
        let _ = self.frame_tx.send(frame);
    }

    fn finish_accept(&self, channel: Channel, options: ChannelOptions) -> Result<Channel> {
        let id = channel.id();
        if channel.try_accept_offer(options) {
            self.send_frame(OutboundFrame::control(ControlCode::OfferAccepted, id));
            return Ok(channel);
        }
        Err(match channel.state() {
            ChannelState::Accepted => Error::AlreadyAccepted(id),
            ChannelState::RejectedOrCanceled => Error::NoLongerAvailable(id),
            ChannelState::Terminated => Error::NotAcceptable(id),
            ChannelState::Offered => unreachable!("try_accept_offer only fails when not Offered"),
        })
    }

    #[instrument(skip_all, level = "trace")]
    async fn run_dropped_ports_task(&self, mut dropped_rx: mpsc::UnboundedReceiver<u32>) {
        while let Some(id) = dropped_rx.recv().await {
            trace!(channel_id = id, "dropping channel from registry");
            self.registry.lock().remove(id);
        }
    }

    fn on_reader_exit(&self, result: Result<()>) {
        let cause = result.err().map(Arc::new);
        self.dispose_with_cause(cause);
    }

    #[instrument(skip(self))]
    fn dispose_with_cause(&self, cause: Option<Arc<Error>>) {
        if !self.completion_source.resolve(cause.clone()) {
            return;
        }
        debug!(fatal = cause.is_some(), "stream disposed");
        self.disposal.notify_one();
        let reason = match &cause {
            Some(err) => TerminationReason::StreamClosed(err.clone()),
            None => TerminationReason::Completed,
        };
        let channels = self.registry.lock().drain();
        for channel in channels {
            channel.on_remote_terminated(reason.clone());
        }
    }
}
