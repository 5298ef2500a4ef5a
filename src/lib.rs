//! A protocol engine for multiplexing many independent, bidirectional,
//! ordered byte channels over one full-duplex byte transport.
//!
//! Two peers run a short handshake to agree on which of them allocates odd
//! channel ids and which allocates even ones, after which either side may
//! offer, accept, reject, write to, half-close, and terminate channels
//! concurrently. Offered channels may be named, for rendezvous by name, or
//! anonymous, for rendezvous by an id communicated out of band (typically
//! over an already-established channel).
//!
//! ```no_run
//! use chanmux::{ChannelOptions, MultiplexingStream, MultiplexingStreamOptions};
//!
//! # async fn run(transport: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static) -> chanmux::Result<()> {
//! let stream = MultiplexingStream::create(transport, MultiplexingStreamOptions::default()).await?;
//! let channel = stream.create_channel(ChannelOptions::default())?;
//! channel.write(bytes::Bytes::from_static(b"hello"))?;
//! # Ok(())
//! # }
//! ```
//!
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![warn(missing_docs, missing_debug_implementations)]
#![forbid(unsafe_code)]

mod cancellation;
mod channel;
mod completion;
mod config;
mod dupe;
mod error;
mod events;
mod frame;
mod handshake;
mod oneshot;
mod options;
mod reader;
mod registry;
mod stream;
mod util;
mod writer;

pub use cancellation::{cancellation_pair, Cancellation, CancellationHandle};
pub use channel::{Channel, ChannelState, TerminationReason};
pub use completion::Completion;
pub use dupe::Dupe;
pub use error::{Error, Result};
pub use events::ChannelOffered;
pub use options::{ChannelOptions, MultiplexingStreamOptions};
pub use stream::MultiplexingStream;
