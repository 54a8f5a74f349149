// MIT License - Copyright (c) 2021 TJForc
// Frame codec: splits a rolling byte stream into complete frames

use std::fmt;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{Result, SessionError};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;
/// First byte of every frame header.
pub const MARKER: u8 = 0xAA;
/// Filler byte used for header reserved bytes and for trailing padding after a body.
pub const PADDING: u8 = 0xEE;
/// Shortest frame that can carry a response (header plus one body byte).
pub const MIN_RESPONSE_LEN: usize = HEADER_LEN + 1;
/// Largest body the one-byte length field can describe.
pub const MAX_BODY_LEN: usize = u8::MAX as usize;

/// Parsed 16-byte frame header.
///
/// Wire layout:
///
/// ```text
/// [0] 0xAA marker        [1] body length
/// [2] message type       [3] flags
/// [4] command            [5] sub-command
/// [6] channel            [7..16] reserved (0xEE filled on send)
/// ```
///
/// The body length is not stored; it is always derived from the body so the two
/// can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: u8,
    pub flags: u8,
    pub command: u8,
    pub sub_command: u8,
    pub channel: u8,
    pub reserved: [u8; 9],
}

impl FrameHeader {
    pub fn new(message_type: u8, command: u8) -> Self {
        let mut reserved = [PADDING; 9];
        reserved[0] = 0x00;
        Self {
            message_type,
            flags: 0,
            command,
            sub_command: 0,
            channel: 0,
            reserved,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sub_command(mut self, sub_command: u8) -> Self {
        self.sub_command = sub_command;
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    fn write(&self, body_len: u8, out: &mut BytesMut) {
        out.extend_from_slice(&[
            MARKER,
            body_len,
            self.message_type,
            self.flags,
            self.command,
            self.sub_command,
            self.channel,
        ]);
        out.extend_from_slice(&self.reserved);
    }

    fn read(raw: &[u8]) -> Self {
        let mut reserved = [0u8; 9];
        reserved.copy_from_slice(&raw[7..HEADER_LEN]);
        Self {
            message_type: raw[2],
            flags: raw[3],
            command: raw[4],
            sub_command: raw[5],
            channel: raw[6],
            reserved,
        }
    }
}

/// One complete protocol message.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    body: Bytes,
}

impl Frame {
    /// Build a frame, rejecting bodies the length byte cannot describe.
    pub fn new(header: FrameHeader, body: impl Into<Bytes>) -> Result<Self> {
        let body = body.into();
        if body.len() > MAX_BODY_LEN {
            return Err(SessionError::InvalidArgument {
                details: format!("frame body of {} bytes exceeds {}", body.len(), MAX_BODY_LEN),
            });
        }
        Ok(Self { header, body })
    }

    /// Parse exactly one frame from `data`, ignoring trailing padding.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(SessionError::MalformedFrame {
                details: format!("{} bytes is shorter than a header", data.len()),
            });
        }
        if data[0] != MARKER {
            return Err(SessionError::MalformedFrame {
                details: format!("bad marker 0x{:02X}", data[0]),
            });
        }
        let body_len = data[1] as usize;
        let end = HEADER_LEN + body_len;
        if data.len() < end {
            return Err(SessionError::MalformedFrame {
                details: format!(
                    "declared body of {} bytes but only {} available",
                    body_len,
                    data.len() - HEADER_LEN
                ),
            });
        }
        if data[end..].iter().any(|&b| b != PADDING) {
            return Err(SessionError::MalformedFrame {
                details: "unexpected bytes after frame body".to_string(),
            });
        }
        Ok(Self::from_wire(Bytes::copy_from_slice(&data[..end])))
    }

    /// Build from a buffer holding exactly header + body.
    fn from_wire(raw: Bytes) -> Self {
        let header = FrameHeader::read(&raw[..HEADER_LEN]);
        let body = raw.slice(HEADER_LEN..);
        Self { header, body }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Total wire length (header + body, padding excluded).
    pub fn len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Header length byte as it appears on the wire.
    pub fn declared_len(&self) -> u8 {
        self.body.len() as u8
    }

    /// High nibble of the first body byte, which identifies the response type.
    pub fn response_type(&self) -> Option<u8> {
        self.body.first().map(|b| b >> 4)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        self.header.write(self.declared_len(), &mut out);
        out.extend_from_slice(&self.body);
        out.freeze()
    }

    /// Serialize, then pad with 0xEE up to a multiple of `block` bytes.
    pub fn encode_padded(&self, block: usize) -> Bytes {
        let mut out = BytesMut::from(&self.encode()[..]);
        if block > 0 {
            let rem = out.len() % block;
            if rem != 0 {
                out.resize(out.len() + block - rem, PADDING);
            }
        }
        out.freeze()
    }

    pub fn to_hex(&self) -> String {
        hex_string(&self.encode())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("message_type", &format_args!("0x{:02X}", self.header.message_type))
            .field("command", &format_args!("0x{:02X}", self.header.command))
            .field("body", &hex_string(&self.body))
            .finish()
    }
}

/// Format bytes as space-separated uppercase hex.
pub fn hex_string(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Counters for anomalies seen while splitting the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecStats {
    /// Complete frames emitted
    pub frames: u64,
    /// Times the buffer did not start with a frame marker
    pub malformed: u64,
    /// Bytes thrown away while resynchronising on a marker
    pub discarded_bytes: u64,
}

/// Accumulates raw chunks and extracts complete frames.
///
/// Incomplete trailing data (a split header, or a body shorter than its declared
/// length) is kept for the next `push`.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    stats: CodecStats,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            stats: CodecStats::default(),
        }
    }

    /// Append a chunk and return every frame it completes, in wire order.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    /// Drop any partial frame (used when the link is re-established).
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Discarding {} buffered bytes", self.buffer.len());
        }
        self.buffer.clear();
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            // Padding whose frame was emitted at the end of the previous chunk
            self.skip_padding();

            if self.buffer.is_empty() {
                return None;
            }

            if self.buffer[0] != MARKER {
                let skip = self
                    .buffer
                    .iter()
                    .position(|&b| b == MARKER)
                    .unwrap_or(self.buffer.len());
                debug!(
                    "No frame header found (0x{:02X}), discarding {} bytes",
                    self.buffer[0], skip
                );
                self.stats.malformed += 1;
                self.stats.discarded_bytes += skip as u64;
                let _ = self.buffer.split_to(skip);
                continue;
            }

            if self.buffer.len() < HEADER_LEN {
                return None;
            }

            let frame_len = HEADER_LEN + self.buffer[1] as usize;
            if self.buffer.len() < frame_len {
                trace!(
                    "Waiting for {} more bytes of frame body",
                    frame_len - self.buffer.len()
                );
                return None;
            }

            let raw = self.buffer.split_to(frame_len).freeze();
            self.skip_padding();
            self.stats.frames += 1;
            return Some(Frame::from_wire(raw));
        }
    }

    fn skip_padding(&mut self) {
        let padding = self.buffer.iter().take_while(|&&b| b == PADDING).count();
        if padding > 0 {
            let _ = self.buffer.split_to(padding);
        }
    }
}
