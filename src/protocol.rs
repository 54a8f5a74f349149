// MIT License - Copyright (c) 2021 TJForc
// IP150 frame vocabulary

use bitflags::bitflags;
use bytes::Bytes;

use crate::codec::{Frame, FrameHeader, MIN_RESPONSE_LEN};
use crate::error::{Result, SessionError};

/// Message type carried in header byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Reply from the IP module itself
    IpResponse,
    /// Reply relayed from the panel's serial bus
    SerialPassthruResponse,
    /// Request relayed to the panel's serial bus
    SerialPassthruRequest,
    /// Request handled by the IP module
    IpRequest,
}

impl MessageType {
    pub fn code(&self) -> u8 {
        match self {
            Self::IpResponse => 0x01,
            Self::SerialPassthruResponse => 0x02,
            Self::SerialPassthruRequest => 0x03,
            Self::IpRequest => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IpResponse),
            0x02 => Some(Self::SerialPassthruResponse),
            0x03 => Some(Self::SerialPassthruRequest),
            0x04 => Some(Self::IpRequest),
            _ => None,
        }
    }
}

bitflags! {
    /// Header byte 3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        /// Body is encrypted with the session key
        const ENCRYPTED = 0x01;
        /// Set on every frame the module produces
        const BASE      = 0x08;
    }
}

/// IP module command: log in with the gateway password.
pub const IP_LOGIN: u8 = 0xF0;
/// IP module command: keep-alive.
pub const IP_KEEP_ALIVE: u8 = 0xF2;
/// IP module command: open the serial pass-through channel.
pub const IP_SERIAL_CONNECT: u8 = 0xF3;

/// Serial command: initialize communication (carries the PC password).
pub const CMD_INITIALIZE: u8 = 0x00;
/// The panel answers an initialize request with this command nibble.
pub const INITIALIZE_REPLY: u8 = 0x1;
/// Serial command: read RAM or EEPROM.
pub const CMD_READ_MEMORY: u8 = 0x50;
/// Serial command: close the panel connection.
pub const CMD_CLOSE_CONNECTION: u8 = 0x70;

/// Channel byte used for serial pass-through requests.
pub const SERIAL_CHANNEL: u8 = 0x14;

/// Bytes in a serial response body before the payload starts.
pub const RESPONSE_PREFIX_LEN: usize = 6;
/// Trailing checksum byte on serial bodies.
pub const CHECKSUM_LEN: usize = 1;

/// Largest memory read a single request can ask for.
pub const MAX_READ_LEN: u8 = 64;
/// Size of a RAM block.
pub const RAM_BLOCK_LEN: u8 = 64;

const CONTROL_RAM: u8 = 0x80;
const CONTROL_EEPROM: u8 = 0x00;

/// How a response frame is recognised for a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMatch {
    /// High nibble of the first body byte equals this command (reduced to its
    /// high nibble if larger than 0xF).
    BodyCommand(u8),
    /// Header command byte equals this value.
    HeaderCommand(u8),
}

impl ResponseMatch {
    /// Match serial responses to `command`.
    pub fn for_command(command: u8) -> Self {
        Self::BodyCommand(command)
    }

    /// The code recorded in timeouts and logs.
    pub fn code(&self) -> u8 {
        match self {
            Self::BodyCommand(c) => reduce_command(*c),
            Self::HeaderCommand(c) => *c,
        }
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        if frame.len() < MIN_RESPONSE_LEN {
            return false;
        }
        match self {
            Self::BodyCommand(c) => frame.response_type() == Some(reduce_command(*c)),
            Self::HeaderCommand(c) => frame.header().command == *c,
        }
    }
}

fn reduce_command(command: u8) -> u8 {
    if command > 0xF { command >> 4 } else { command }
}

/// An outgoing frame together with the response it waits for.
#[derive(Debug, Clone)]
pub struct Request {
    pub frame: Frame,
    pub expect: ResponseMatch,
}

impl Request {
    /// A request handled by the IP module, answered with the same header command.
    pub fn ip(command: u8, body: impl Into<Bytes>) -> Result<Self> {
        let header = FrameHeader::new(MessageType::IpRequest.code(), command)
            .with_flags(HeaderFlags::BASE.bits());
        Ok(Self {
            frame: Frame::new(header, body)?,
            expect: ResponseMatch::HeaderCommand(command),
        })
    }

    /// A serial pass-through request: `[command, args..., checksum]`.
    pub fn serial(command: u8, args: &[u8]) -> Result<Self> {
        let header = FrameHeader::new(MessageType::SerialPassthruRequest.code(), 0x00)
            .with_flags(HeaderFlags::BASE.bits())
            .with_channel(SERIAL_CHANNEL);
        Ok(Self {
            frame: Frame::new(header, serial_body(command, args))?,
            expect: ResponseMatch::for_command(command),
        })
    }

    pub fn command(&self) -> u8 {
        self.expect.code()
    }
}

/// Build a serial body with its trailing checksum.
pub fn serial_body(command: u8, args: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(args.len() + 2);
    body.push(command);
    body.extend_from_slice(args);
    body.push(checksum(&body));
    body
}

/// Sum of all bytes modulo 256.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// The payload of a serial response: body minus its prefix and checksum.
pub fn response_payload(frame: &Frame) -> Bytes {
    let body = frame.body();
    if body.len() < RESPONSE_PREFIX_LEN + CHECKSUM_LEN {
        return Bytes::new();
    }
    body.slice(RESPONSE_PREFIX_LEN..body.len() - CHECKSUM_LEN)
}

/// Login request carrying the gateway password.
pub fn login_request(gateway_password: &str) -> Result<Request> {
    if gateway_password.is_empty() {
        return Err(SessionError::InvalidArgument {
            details: "gateway password must not be empty".to_string(),
        });
    }
    Request::ip(IP_LOGIN, gateway_password.as_bytes().to_vec())
}

/// Initialize-communication request carrying the 4 hex digit PC password.
pub fn initialize_request(pc_password: &str) -> Result<Request> {
    let code = encode_pc_password(pc_password)?;
    let mut request = Request::serial(CMD_INITIALIZE, &[0x00, code[0], code[1]])?;
    request.expect = ResponseMatch::BodyCommand(INITIALIZE_REPLY);
    Ok(request)
}

pub fn keep_alive_request() -> Result<Request> {
    Request::ip(IP_KEEP_ALIVE, Bytes::new())
}

pub fn serial_connect_request() -> Result<Request> {
    Request::ip(IP_SERIAL_CONNECT, Bytes::new())
}

pub fn close_connection_request() -> Result<Request> {
    Request::serial(CMD_CLOSE_CONNECTION, &[0x00, 0x05])
}

/// Read one RAM block.
pub fn ram_read_request(block: u16) -> Result<Request> {
    memory_read_request(CONTROL_RAM, block, RAM_BLOCK_LEN)
}

/// Read `len` bytes of EEPROM at `address` (1–64 bytes).
pub fn eeprom_read_request(address: u16, len: u8) -> Result<Request> {
    if len == 0 || len > MAX_READ_LEN {
        return Err(SessionError::InvalidArgument {
            details: format!("bytes to read must be 1 to {}, got {}", MAX_READ_LEN, len),
        });
    }
    memory_read_request(CONTROL_EEPROM, address, len)
}

fn memory_read_request(control: u8, address: u16, len: u8) -> Result<Request> {
    let [hi, lo] = address.to_be_bytes();
    Request::serial(CMD_READ_MEMORY, &[0x00, control, 0x00, hi, lo, len])
}

/// Whether an IP login reply accepts the credentials.
pub fn login_accepted(frame: &Frame) -> bool {
    frame.body().first() == Some(&0x00)
}

/// Encode a PC password ("0000"–"FFFF") into two bytes.
pub fn encode_pc_password(password: &str) -> Result<[u8; 2]> {
    if password.len() != 4 {
        return Err(SessionError::InvalidArgument {
            details: format!("PC password must be 4 hex digits, got {} characters", password.len()),
        });
    }
    u16::from_str_radix(password, 16)
        .map(|v| v.to_be_bytes())
        .map_err(|_| SessionError::InvalidArgument {
            details: "PC password must be 4 hex digits".to_string(),
        })
}

/// Build a serial response frame (used by device simulators and tests).
pub fn serial_response(command: u8, prefix: [u8; 5], payload: &[u8]) -> Result<Frame> {
    let header = FrameHeader::new(MessageType::SerialPassthruResponse.code(), 0x00)
        .with_flags(HeaderFlags::BASE.bits())
        .with_channel(SERIAL_CHANNEL);
    let mut args = prefix.to_vec();
    args.extend_from_slice(payload);
    Frame::new(header, serial_body(command, &args))
}

/// Build an IP module reply frame (used by device simulators and tests).
pub fn ip_response(command: u8, body: &[u8]) -> Result<Frame> {
    let header = FrameHeader::new(MessageType::IpResponse.code(), command)
        .with_flags(HeaderFlags::BASE.bits());
    Frame::new(header, body.to_vec())
}
