//! Framing for the byte link to the IR transceiver.
//!
//! ```text
//! 0x32 | kind | flags | protocol | length | payload[length] | checksum | 0x34
//! ```
//!
//! The checksum is the XOR of the header and payload bytes.

use std::time::Instant;

use bytes::{BytesMut, BufMut, Buf};
use packed_struct::prelude::*;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};


const FRAME_START: u8 = 0x32;
const FRAME_END: u8 = 0x34;

const HEADER_SIZE: usize = 4;

/// start, header, checksum, end
const FRAME_OVERHEAD: usize = 1 + HEADER_SIZE + 2;

/// Maximum payload a single link frame can carry.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;


#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// Host to transceiver: start delivering captures.
    ListenEnable = 0x01,

    /// Host to transceiver: stop capturing.
    ListenDisable = 0x02,

    /// Host to transceiver: drive the line to its idle level before a transmission.
    ChannelPrepare = 0x03,

    /// Host to transceiver: hand the line back to the receiver.
    ChannelRelease = 0x04,

    /// Host to transceiver: send the payload as an IR frame.
    Transmit = 0x10,

    /// Transceiver to host: a decoded IR capture.
    Capture = 0x80
}

#[derive(PackedStruct, Debug, Clone, Copy, PartialEq)]
#[packed_struct(bit_numbering="msb0")]
pub struct LinkHeader {
    #[packed_field(bytes="0", ty="enum")]
    pub kind: LinkKind,

    /// The capture buffer overflowed; the payload is incomplete.
    #[packed_field(bits="8")]
    pub overflow: bool,

    #[packed_field(bytes="2")]
    pub protocol: u8,

    #[packed_field(bytes="3")]
    pub length: u8,
}


/// IR protocol family a capture was classified as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Unknown,
    Gree,
    Kelvinator,
    Other(u8)
}

impl From<u8> for Protocol {
    fn from(tag: u8) -> Self {
        match tag {
            0 => Protocol::Unknown,
            1 => Protocol::Gree,
            2 => Protocol::Kelvinator,
            other => Protocol::Other(other),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Unknown => 0,
            Protocol::Gree => 1,
            Protocol::Kelvinator => 2,
            Protocol::Other(tag) => tag,
        }
    }
}

/// Bytes captured by the IR receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capture {
    pub protocol: Protocol,
    pub overflow: bool,
    pub data: Vec<u8>
}


/// A frame on the transceiver link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkFrame {
    ListenEnable,
    ListenDisable,
    ChannelPrepare,
    ChannelRelease,
    Transmit {
        protocol: Protocol,
        data: Vec<u8>
    },
    Capture(Capture),
}

impl LinkFrame {
    fn parts(&self) -> (LinkKind, Protocol, bool, &[u8]) {
        match self {
            LinkFrame::ListenEnable => (LinkKind::ListenEnable, Protocol::Unknown, false, &[]),
            LinkFrame::ListenDisable => (LinkKind::ListenDisable, Protocol::Unknown, false, &[]),
            LinkFrame::ChannelPrepare => (LinkKind::ChannelPrepare, Protocol::Unknown, false, &[]),
            LinkFrame::ChannelRelease => (LinkKind::ChannelRelease, Protocol::Unknown, false, &[]),
            LinkFrame::Transmit { protocol, data } => (LinkKind::Transmit, *protocol, false, data),
            LinkFrame::Capture(capture) => (LinkKind::Capture, capture.protocol, capture.overflow, &capture.data),
        }
    }
}

/// A frame received from the link
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RxFrame {
    Link(LinkFrame),

    /// Well delimited but failed the checksum or header check.
    Corrupted(Vec<u8>)
}


trait Checksum {
    fn checksum(&mut self) -> u8;
}

impl <'a>Checksum for std::slice::Iter<'a, u8> {
    fn checksum(&mut self) -> u8 {
        self.fold(0, |acc, byte| acc ^ byte)
    }
}


#[derive(Error, Debug)]
pub enum LinkError {
    #[error("invalid checksum (expected {expected:x}, actual: {actual:x})")]
    InvalidChecksum {
        expected: u8,
        actual: u8,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(#[from] PackingError),
    #[error("frame truncated")]
    Truncated,
}

/// Parse the bytes between the start and end markers.
fn parse_frame(body: &[u8]) -> Result<LinkFrame, LinkError> {
    let [data @ .., checksum] = body else {
        return Err(LinkError::Truncated)
    };

    let expected = data.iter().checksum();
    if expected != *checksum {
        return Err(LinkError::InvalidChecksum { expected, actual: *checksum })
    }

    let [h0, h1, h2, h3, payload @ ..] = data else {
        return Err(LinkError::Truncated)
    };

    let header = LinkHeader::unpack(&[*h0, *h1, *h2, *h3])?;

    if payload.len() != usize::from(header.length) {
        return Err(LinkError::Truncated)
    }

    let frame = match header.kind {
        LinkKind::ListenEnable => LinkFrame::ListenEnable,
        LinkKind::ListenDisable => LinkFrame::ListenDisable,
        LinkKind::ChannelPrepare => LinkFrame::ChannelPrepare,
        LinkKind::ChannelRelease => LinkFrame::ChannelRelease,
        LinkKind::Transmit => LinkFrame::Transmit {
            protocol: header.protocol.into(),
            data: payload.to_vec()
        },
        LinkKind::Capture => LinkFrame::Capture(Capture {
            protocol: header.protocol.into(),
            overflow: header.overflow,
            data: payload.to_vec()
        }),
    };

    Ok(frame)
}


pub struct LinkCodec {
    start_time: Instant,
    last_rx_time: Option<Instant>,
    last_tx_time: Option<Instant>,
}

impl LinkCodec {
    pub fn new() -> Self {
        LinkCodec {
            start_time: Instant::now(),
            last_rx_time: None,
            last_tx_time: None,
        }
    }
}

impl Default for LinkCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since `time`, 0 if never.
pub fn delta_ms(time: Option<Instant>) -> u128 {
    time.map(|time| time.elapsed().as_millis()).unwrap_or(0)
}

impl Decoder for LinkCodec {
    type Item = RxFrame;

    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // skip junk up to the next start marker to resync
            match src.iter().position(|&b| b == FRAME_START) {
                Some(0) => (),
                Some(junk) => {
                    tracing::trace!(junk, "skipping bytes before frame start");
                    src.advance(junk);
                },
                None => {
                    src.clear();
                    return Ok(None)
                }
            }

            if src.len() < 1 + HEADER_SIZE {
                return Ok(None)
            }

            let size = FRAME_OVERHEAD + usize::from(src[HEADER_SIZE]);

            if src.len() < size {
                return Ok(None)
            }

            if src[size - 1] != FRAME_END {
                // the start marker was inside junk or a previous frame -- skip it
                src.advance(1);
                continue;
            }

            let frame = src.split_to(size);

            tracing::trace!(
                elapsed_ms = delta_ms(Some(self.start_time)),
                rx_delta_ms = delta_ms(self.last_rx_time),
                "RX {:02x?}", &frame[..]
            );
            self.last_rx_time = Some(Instant::now());

            let frame = match parse_frame(&frame[1..size - 1]) {
                Ok(link) => RxFrame::Link(link),
                Err(err) => {
                    tracing::debug!(%err, "corrupted link frame");
                    RxFrame::Corrupted(frame.to_vec())
                }
            };

            return Ok(Some(frame))
        }
    }
}

impl Encoder<LinkFrame> for LinkCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: LinkFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, protocol, overflow, payload) = frame.parts();

        let length = u8::try_from(payload.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "link payload too large"))?;

        let header = LinkHeader {
            kind,
            overflow,
            protocol: protocol.into(),
            length,
        };

        let header = header.pack()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

        dst.reserve(FRAME_OVERHEAD + payload.len());

        let start = dst.len();
        dst.put_u8(FRAME_START);
        dst.put(&header[..]);
        dst.put(payload);

        let checksum = dst[start + 1..].iter().checksum();
        dst.put_u8(checksum);
        dst.put_u8(FRAME_END);

        tracing::trace!(
            elapsed_ms = delta_ms(Some(self.start_time)),
            tx_delta_ms = delta_ms(self.last_tx_time),
            "TX {:02x?}", &dst[start..]
        );
        self.last_tx_time = Some(Instant::now());

        Ok(())
    }
}
