//! The single reader task: frame decoding and dispatch.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Grounded on `penguin_mux::inner::MultiplexorInner::{process_ws_next,
//! process_message, process_frame}` in `mux/inner.rs`: one task owns the
//! read half exclusively, decodes each incoming unit, and mutates the
//! shared flow table. Here the flow table is [`crate::registry::Registry`]
//! behind a `parking_lot::Mutex`, so every dispatch below is a short,
//! synchronous critical section rather than the teacher's `RwLock` reads.

use crate::channel::{Channel, ChannelState, TerminationReason};
use crate::config::FRAME_HEADER_LEN;
use crate::error::Error;
use crate::events::ChannelOffered;
use crate::frame::{decode_header, ControlCode, OutboundFrame};
use crate::options::ChannelOptions;
use crate::registry::SharedRegistry;
use crate::util::read_exact_or_eof;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

/// Everything the reader task needs to dispatch frames without reaching
/// back into [`crate::stream::MultiplexingStream`].
pub(crate) struct ReaderContext {
    pub registry: SharedRegistry,
    pub frame_tx: mpsc::UnboundedSender<OutboundFrame>,
    pub dropped_tx: mpsc::UnboundedSender<u32>,
    pub channel_offered_tx: mpsc::Sender<ChannelOffered>,
    pub default_channel_options: ChannelOptions,
    pub disposal: Arc<Notify>,
}

/// Run the reader loop until the peer closes the transport cleanly
/// (`Ok(())`), a fatal protocol violation occurs (`Err`, per
/// [`Error::is_fatal`]), or local disposal is signalled (`Ok(())`).
#[tracing::instrument(skip_all, level = "trace")]
pub(crate) async fn run<R>(mut read_half: R, ctx: ReaderContext) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    loop {
        let header_read = tokio::select! {
            biased;
            () = ctx.disposal.notified() => {
                debug!("reader task stopping: stream disposed locally");
                return Ok(());
            }
            result = read_exact_or_eof(&mut read_half, &mut header_buf) => result?,
        };
        if !header_read {
            debug!("peer closed the transport cleanly");
            return Ok(());
        }
        let header = decode_header(&header_buf)?;
        let payload = if header.payload_length > 0 {
            let mut buf = vec![0u8; header.payload_length as usize];
            read_half.read_exact(&mut buf).await?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };
        let Some(code) = header.code else {
            trace!(code = header_buf[0], "ignoring unrecognized control code");
            continue;
        };
        match code {
            ControlCode::Offer => handle_offer(&ctx, header.channel_id, payload).await,
            ControlCode::OfferAccepted => handle_offer_accepted(&ctx, header.channel_id)?,
            ControlCode::Content => handle_content(&ctx, header.channel_id, payload).await,
            ControlCode::ContentWritingCompleted => handle_content_writing_completed(&ctx, header.channel_id).await,
            ControlCode::ChannelTerminated => handle_channel_terminated(&ctx, header.channel_id),
        }
    }
}

async fn handle_offer(ctx: &ReaderContext, id: u32, payload: Bytes) {
    let name = match String::from_utf8(payload.to_vec()) {
        Ok(name) => name,
        Err(_) => {
            warn!(channel_id = id, "ignoring offer with non-UTF-8 name");
            return;
        }
    };
    let (channel, _acceptance_awaiter, _completion_awaiter) = Channel::new_offered(
        id,
        name.clone(),
        ctx.default_channel_options.clone(),
        ctx.frame_tx.clone(),
        ctx.dropped_tx.clone(),
    );

    let matched_accepter = {
        let mut registry = ctx.registry.lock();
        registry.insert(channel.clone());
        if name.is_empty() {
            None
        } else {
            registry.pop_live_accepter(&name)
        }
    };

    let was_auto_accepted = match matched_accepter {
        Some(accepter) => {
            let options = accepter.lock().state().cloned().unwrap_or_default();
            if channel.try_accept_offer(options) {
                let _ = ctx.frame_tx.send(OutboundFrame::control(ControlCode::OfferAccepted, id));
                accepter.lock().resolve(channel.clone());
                true
            } else {
                // Lost a race it cannot actually lose (nobody else holds
                // this brand-new channel yet); fall back to queuing the
                // offer so it isn't silently dropped.
                ctx.registry.lock().push_unmatched_offer(name.clone(), channel.clone());
                false
            }
        }
        None => {
            if !name.is_empty() {
                ctx.registry.lock().push_unmatched_offer(name.clone(), channel.clone());
            }
            false
        }
    };

    let _ = ctx
        .channel_offered_tx
        .send(ChannelOffered {
            id,
            name,
            was_auto_accepted,
        })
        .await;
}

fn handle_offer_accepted(ctx: &ReaderContext, id: u32) -> Result<(), Error> {
    let channel = ctx.registry.lock().get(id);
    match channel {
        Some(channel) => {
            if !channel.on_accepted() {
                // Crossed with a local cancellation that got there first: this id
                // will never be referenced again, so reclaim it now instead of
                // waiting for stream disposal.
                debug!(channel_id = id, "ignoring acceptance of an already-cancelled offer");
                ctx.registry.lock().remove(id);
            }
            Ok(())
        }
        None => Err(Error::UnexpectedChannel(id)),
    }
}

async fn handle_content(ctx: &ReaderContext, id: u32, payload: Bytes) {
    let channel = ctx.registry.lock().get(id);
    match channel {
        Some(channel) if channel.state() == ChannelState::Accepted => {
            channel.deliver_content(payload).await;
        }
        _ => {
            trace!(channel_id = id, "discarding content for unknown or non-accepted channel");
        }
    }
}

async fn handle_content_writing_completed(ctx: &ReaderContext, id: u32) {
    let channel = ctx.registry.lock().get(id);
    match channel {
        Some(channel) => channel.deliver_eof().await,
        None => trace!(channel_id = id, "discarding EOF for unknown channel"),
    }
}

fn handle_channel_terminated(ctx: &ReaderContext, id: u32) {
    if let Some(channel) = ctx.registry.lock().remove(id) {
        channel.on_remote_terminated(TerminationReason::RemoteTerminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_header;
    use crate::registry::Registry;
    use parking_lot::Mutex as SyncMutex;
    use tokio::io::AsyncWriteExt;

    fn test_ctx() -> (ReaderContext, mpsc::UnboundedReceiver<OutboundFrame>, mpsc::Receiver<ChannelOffered>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (dropped_tx, _dropped_rx) = mpsc::unbounded_channel();
        let (channel_offered_tx, channel_offered_rx) = mpsc::channel(8);
        (
            ReaderContext {
                registry: Arc::new(SyncMutex::new(Registry::new())),
                frame_tx,
                dropped_tx,
                channel_offered_tx,
                default_channel_options: ChannelOptions::default(),
                disposal: Arc::new(Notify::new()),
            },
            frame_rx,
            channel_offered_rx,
        )
    }

    #[tokio::test]
    async fn disposal_signal_stops_the_reader() {
        let (a, b) = tokio::io::duplex(64);
        let (ctx, _frame_rx, _events) = test_ctx();
        ctx.disposal.notify_one();
        assert!(run(b, ctx).await.is_ok());
        drop(a);
    }

    #[tokio::test]
    async fn named_offer_without_accepter_queues_as_unmatched() {
        let (ctx, _frame_rx, mut events) = test_ctx();
        handle_offer(&ctx, 2, Bytes::from_static(b"greeter")).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.id, 2);
        assert_eq!(event.name, "greeter");
        assert!(!event.was_auto_accepted);
        assert!(ctx.registry.lock().get(2).is_some());
    }

    #[tokio::test]
    async fn offer_accepted_for_unknown_channel_is_fatal() {
        let (ctx, _frame_rx, _events) = test_ctx();
        let err = handle_offer_accepted(&ctx, 99).unwrap_err();
        assert!(matches!(err, Error::UnexpectedChannel(99)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn clean_eof_returns_ok() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let (ctx, _frame_rx, _events) = test_ctx();
        assert!(run(b, ctx).await.is_ok());
    }

    #[tokio::test]
    async fn malformed_header_is_fatal() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut bad = encode_header(ControlCode::ChannelTerminated, 1, 0);
        bad[5..9].copy_from_slice(&1u32.to_be_bytes());
        tokio::spawn(async move {
            a.write_all(&bad).await.unwrap();
        });
        let (ctx, _frame_rx, _events) = test_ctx();
        let err = run(b, ctx).await.unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }
}
