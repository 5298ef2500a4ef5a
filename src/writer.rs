//! The serialized outbound-frame writer task.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Grounded on `penguin_mux::inner::MultiplexorInner::process_frame_recv_task`
//! in `mux/inner.rs`: one task owns the write half exclusively and drains an
//! `mpsc` of outbound frames, so no `Mutex` is needed around the transport
//! itself (spec.md §4.6's "single-writer" requirement is satisfied by
//! construction rather than by locking).

use crate::frame::OutboundFrame;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{trace, warn};

/// Drain `frame_rx`, writing each frame's header and payload to
/// `write_half` as two `write_all` calls followed by a flush. Returns when
/// `frame_rx` is closed (every sender dropped), a write fails, or `shutdown`
/// is signalled by local disposal — in the last case the write half is
/// shut down, which is this engine's sense of "ending the transport".
#[tracing::instrument(skip_all, level = "trace")]
pub(crate) async fn run<W>(mut write_half: W, mut frame_rx: mpsc::UnboundedReceiver<OutboundFrame>, shutdown: Arc<Notify>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            () = shutdown.notified() => {
                trace!("writer task stopping: stream disposed locally");
                let _ = write_half.shutdown().await;
                break;
            }
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(err) = write_frame(&mut write_half, &frame).await {
                            warn!(%err, "writer task stopping: transport write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    trace!("writer task exiting");
}

async fn write_frame<W: AsyncWrite + Unpin>(write_half: &mut W, frame: &OutboundFrame) -> std::io::Result<()> {
    write_half.write_all(&frame.header).await?;
    if !frame.payload.is_empty() {
        write_half.write_all(&frame.payload).await?;
    }
    write_half.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ControlCode;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn writes_header_then_payload_and_flushes() {
        let (write_half, mut read_half) = tokio::io::duplex(256);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(write_half, rx, Arc::new(Notify::new())));

        tx.send(OutboundFrame::new(ControlCode::Content, 7, Bytes::from_static(b"hi")).unwrap())
            .unwrap();
        drop(tx);

        let mut buf = [0u8; 11];
        read_half.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], ControlCode::Content as u8);
        assert_eq!(&buf[1..5], &7u32.to_be_bytes());
        assert_eq!(&buf[5..9], &2u32.to_be_bytes());
        assert_eq!(&buf[9..11], b"hi");

        task.await.unwrap();
    }

    #[tokio::test]
    async fn exits_cleanly_when_all_senders_drop() {
        let (write_half, _read_half) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
        drop(tx);
        run(write_half, rx, Arc::new(Notify::new())).await;
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_task() {
        let (write_half, _read_half) = tokio::io::duplex(64);
        let (_tx, rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();
        run(write_half, rx, shutdown).await;
    }
}
