//! Frame header codec and the closed control-code set.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::{FRAME_HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::error::Error;
use bytes::Bytes;

/// The closed set of frame types. Unknown codes on the wire are ignored,
/// reserved for forward compatibility (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCode {
    /// Offer a new channel, named or anonymous.
    Offer = 1,
    /// Accept a previously offered channel.
    OfferAccepted = 2,
    /// Deliver a chunk of channel payload.
    Content = 3,
    /// Declare that no more `Content` frames will be sent for this channel.
    ContentWritingCompleted = 4,
    /// Tear down a channel.
    ChannelTerminated = 5,
}

impl ControlCode {
    /// Whether frames of this control code are permitted to carry a payload.
    #[must_use]
    pub const fn allows_payload(self) -> bool {
        matches!(self, Self::Offer | Self::Content)
    }

    fn try_from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Offer),
            2 => Some(Self::OfferAccepted),
            3 => Some(Self::Content),
            4 => Some(Self::ContentWritingCompleted),
            5 => Some(Self::ChannelTerminated),
            _ => None,
        }
    }
}

/// A decoded frame header: control code (or `None` if unrecognized, per the
/// forward-compatibility rule), channel id, and payload length.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// The decoded control code, or `None` if the byte on the wire is
    /// outside the closed set and must be ignored.
    pub code: Option<ControlCode>,
    /// Target channel id.
    pub channel_id: u32,
    /// Length in bytes of the payload that follows this header, if any.
    pub payload_length: u32,
}

/// Serialize a frame header into a fixed 9-byte buffer. No allocation beyond
/// the returned array (spec.md §4.2).
#[must_use]
pub(crate) fn encode_header(code: ControlCode, channel_id: u32, payload_length: u32) -> [u8; FRAME_HEADER_LEN] {
    let mut buf = [0u8; FRAME_HEADER_LEN];
    buf[0] = code as u8;
    buf[1..5].copy_from_slice(&channel_id.to_be_bytes());
    buf[5..9].copy_from_slice(&payload_length.to_be_bytes());
    buf
}

/// Decode a 9-byte frame header. Returns `MalformedFrame` if the payload
/// length exceeds [`MAX_PAYLOAD_LEN`] or is nonzero for a control code that
/// forbids payloads.
pub(crate) fn decode_header(bytes: &[u8; FRAME_HEADER_LEN]) -> Result<FrameHeader, Error> {
    let code = ControlCode::try_from_u8(bytes[0]);
    let channel_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let payload_length = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    if payload_length > MAX_PAYLOAD_LEN {
        return Err(Error::MalformedFrame("payload length exceeds maximum"));
    }
    if let Some(code) = code {
        if payload_length != 0 && !code.allows_payload() {
            return Err(Error::MalformedFrame("payload present on a code that forbids one"));
        }
    }
    Ok(FrameHeader {
        code,
        channel_id,
        payload_length,
    })
}

/// A fully assembled outbound frame: header plus optional payload, ready to
/// be written to the transport as one logical write (§4.6).
#[derive(Debug, Clone)]
pub(crate) struct OutboundFrame {
    pub header: [u8; FRAME_HEADER_LEN],
    pub payload: Bytes,
}

impl OutboundFrame {
    pub fn new(code: ControlCode, channel_id: u32, payload: Bytes) -> Result<Self, Error> {
        let len = u32::try_from(payload.len()).map_err(|_| Error::MalformedFrame("payload too long to encode"))?;
        if len > MAX_PAYLOAD_LEN {
            return Err(Error::MalformedFrame("payload length exceeds maximum"));
        }
        Ok(Self {
            header: encode_header(code, channel_id, len),
            payload,
        })
    }

    pub fn control(code: ControlCode, channel_id: u32) -> Self {
        Self {
            header: encode_header(code, channel_id, 0),
            payload: Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header() {
        let header = encode_header(ControlCode::Content, 0x0102_0304, 42);
        let decoded = decode_header(&header).unwrap();
        assert_eq!(decoded.code, Some(ControlCode::Content));
        assert_eq!(decoded.channel_id, 0x0102_0304);
        assert_eq!(decoded.payload_length, 42);
    }

    #[test]
    fn rejects_oversized_payload_length() {
        let header = encode_header(ControlCode::Content, 1, MAX_PAYLOAD_LEN);
        assert!(decode_header(&header).is_ok());
        let mut too_big = header;
        too_big[5..9].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        assert!(matches!(decode_header(&too_big), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn rejects_payload_on_payloadless_code() {
        let header = encode_header(ControlCode::ChannelTerminated, 1, 1);
        assert!(matches!(decode_header(&header), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn unknown_codes_decode_to_none_rather_than_error() {
        let mut header = encode_header(ControlCode::Offer, 1, 0);
        header[0] = 0xEE;
        let decoded = decode_header(&header).unwrap();
        assert!(decoded.code.is_none());
    }

    #[test]
    fn header_is_big_endian() {
        let header = encode_header(ControlCode::Offer, 1, 256);
        assert_eq!(&header[1..5], &[0, 0, 0, 1]);
        assert_eq!(&header[5..9], &[0, 0, 1, 0]);
    }
}
