//! Error types.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while running or driving a [`MultiplexingStream`](crate::MultiplexingStream).
#[derive(Debug, Error)]
pub enum Error {
    /// The peer's handshake magic number did not match ours.
    #[error("handshake magic number mismatch")]
    ProtocolMismatch,
    /// Both peers produced identical random handshake bytes, so neither can
    /// be determined to be "odd". Safe to retry the handshake.
    #[error("handshake collision: both peers produced identical random bytes")]
    HandshakeCollision,
    /// A frame header or payload violated the wire format.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    /// Received `OfferAccepted` for a channel id we have no record of.
    #[error("received OfferAccepted for unknown channel {0}")]
    UnexpectedChannel(u32),
    /// A channel name's UTF-8 encoding exceeded the maximum payload size.
    #[error("channel name too long: {0} bytes encoded, maximum is {1}")]
    NameTooLong(usize, usize),
    /// No channel with the given id is present in the registry.
    #[error("unknown channel {0}")]
    UnknownChannel(u32),
    /// `acceptChannel` raced with another local acceptance and lost.
    #[error("channel {0} was already accepted")]
    AlreadyAccepted(u32),
    /// `acceptChannel` raced with a remote cancellation and lost.
    #[error("channel {0} is no longer available")]
    NoLongerAvailable(u32),
    /// `acceptChannel` was called on a channel that is not in the `Offered` state.
    #[error("channel {0} is not acceptable")]
    NotAcceptable(u32),
    /// The remote terminated the channel before accepting our offer.
    #[error("offer for channel {0} was rejected by the remote party")]
    OfferRejected(u32),
    /// The operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// The stream has already been disposed.
    #[error("multiplexing stream is already disposed")]
    AlreadyDisposed,
    /// The 32-bit channel id space for this party has been exhausted.
    #[error("channel id space exhausted")]
    IdSpaceExhausted,
    /// An I/O error occurred on the underlying transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The stream was disposed because of a fatal error; carried to every
    /// live channel's acceptance/completion signal.
    #[error("multiplexing stream closed: {0}")]
    StreamClosed(std::sync::Arc<Error>),
}

impl Error {
    /// True if this error represents a fatal, stream-wide failure (as
    /// opposed to a local, per-call validation error).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolMismatch
                | Self::HandshakeCollision
                | Self::MalformedFrame(_)
                | Self::UnexpectedChannel(_)
                | Self::IdSpaceExhausted
                | Self::Io(_)
        )
    }
}
