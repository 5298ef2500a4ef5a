//! The `channelOffered` event surface.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Delivered over an `mpsc` channel rather than a callback list, the same
//! idiom `penguin_mux` uses to hand a freshly accepted `MuxStream` to the
//! application (`con_recv_stream_tx: mpsc::Sender<MuxStream>` in
//! `mux/inner.rs`). A plain `mpsc` is preferred over `tokio::sync::broadcast`
//! because spec.md's event has exactly one logical subscriber in the common
//! case, and `mpsc` has no lagging-receiver failure mode to document.

/// Raised whenever the reader loop processes a remote `Offer` frame.
#[derive(Debug, Clone)]
pub struct ChannelOffered {
    /// The id the remote party allocated for the new channel.
    pub id: u32,
    /// The offered channel's name (empty for an anonymous offer).
    pub name: String,
    /// `true` if the offer was immediately auto-matched to a pending local
    /// `acceptChannelAsync` call for the same name.
    pub was_auto_accepted: bool,
}
