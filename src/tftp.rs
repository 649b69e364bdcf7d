// TFTP packet codec and the async UDP socket wrapper.
//
// The codec is pure: pack/unpack functions over byte slices with no state and
// no I/O. The socket wrapper at the bottom is the only part that touches the
// network, handing raw datagrams to the transfer state machines.

use crate::store::StoreError;
use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Fixed data block size; RFC 2347 blocksize negotiation is unsupported.
pub const BLOCK_SIZE: usize = 512;

// Largest well-formed packet is DATA: 2 opcode + 2 block + 512 payload.
const MAX_PACKET_SIZE: usize = 4 + BLOCK_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents a failure to pack or unpack a TFTP packet.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    /// The leading two bytes are not a known opcode.
    UnknownOpcode(u16),

    /// An error code outside 0..=7 was handed to `pack_error`.
    UnknownErrorCode(u16),

    /// The packet parsed, but is the wrong kind for the current exchange.
    IllegalOperation { expected: &'static str, got: OpCode },

    /// A required field or terminator is missing.
    MalformedPacket(&'static str),

    /// The request named a transfer mode outside octet/netascii/mail.
    UnknownMode(String),

    /// The filename failed store-level validation. Filename emptiness is a
    /// file-naming rule, not a wire-format rule, so it carries the store's
    /// own error kind.
    Store(StoreError),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::UnknownOpcode(raw) => write!(f, "Unknown opcode '{raw}'"),
            PacketError::UnknownErrorCode(raw) => write!(f, "Unknown error code '{raw}'"),
            PacketError::IllegalOperation { expected, got } => {
                write!(f, "Expected {expected} packet, but got '{got}'")
            }
            PacketError::MalformedPacket(what) => write!(f, "Malformed packet: {what}"),
            PacketError::UnknownMode(mode) => write!(f, "Mode '{mode}' not recognized"),
            PacketError::Store(e) => e.fmt(f),
        }
    }
}

impl From<StoreError> for PacketError {
    fn from(e: StoreError) -> Self {
        PacketError::Store(e)
    }
}

///////////////////////////////////////////////////////////////
// Protocol vocabularies

/// The five TFTP operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl OpCode {
    fn from_u16(raw: u16) -> Option<OpCode> {
        match raw {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpCode::Rrq => "RRQ",
            OpCode::Wrq => "WRQ",
            OpCode::Data => "DATA",
            OpCode::Ack => "ACK",
            OpCode::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// The eight error codes a TFTP ERROR packet may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    AllocationExceeded = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    fn from_u16(raw: u16) -> Option<ErrorCode> {
        match raw {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::AllocationExceeded),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }
}

/// Represents the transfer mode a client requests for a file.
///
/// Mail is accepted on the wire but transfers like octet; nothing is mailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Octet,
    Netascii,
    Mail,
}

impl Mode {
    fn from_wire(raw: &[u8]) -> Result<Mode, PacketError> {
        let s = std::str::from_utf8(raw)
            .map_err(|_| PacketError::MalformedPacket("mode is not valid UTF-8"))?;
        if s.eq_ignore_ascii_case("octet") {
            Ok(Mode::Octet)
        } else if s.eq_ignore_ascii_case("netascii") {
            Ok(Mode::Netascii)
        } else if s.eq_ignore_ascii_case("mail") {
            Ok(Mode::Mail)
        } else {
            Err(PacketError::UnknownMode(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Octet => "octet",
            Mode::Netascii => "netascii",
            Mode::Mail => "mail",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read request packet
    ReadReq { path: String, mode: Mode },

    /// A write request packet
    WriteReq { path: String, mode: Mode },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack { block: u16 },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

impl Packet {
    /// Serializes this packet into its big-endian wire representation.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(OpCode::Rrq, path, *mode),
            Packet::WriteReq { path, mode } => encode_request(OpCode::Wrq, path, *mode),
            Packet::Data { block, data } => {
                let mut b = Vec::with_capacity(4 + data.len());
                b.extend_from_slice(&(OpCode::Data as u16).to_be_bytes());
                b.extend_from_slice(&block.to_be_bytes());
                b.extend_from_slice(data);
                b
            }
            Packet::Ack { block } => {
                let mut b = Vec::with_capacity(4);
                b.extend_from_slice(&(OpCode::Ack as u16).to_be_bytes());
                b.extend_from_slice(&block.to_be_bytes());
                b
            }
            Packet::Error { code, message } => {
                let mut b = Vec::with_capacity(5 + message.len());
                b.extend_from_slice(&(OpCode::Error as u16).to_be_bytes());
                b.extend_from_slice(&(*code as u16).to_be_bytes());
                b.extend_from_slice(message.as_bytes());
                b.push(0);
                b
            }
        }
    }
}

fn encode_request(opcode: OpCode, path: &str, mode: Mode) -> Vec<u8> {
    let mut b = Vec::with_capacity(4 + path.len() + mode.as_str().len());
    b.extend_from_slice(&(opcode as u16).to_be_bytes());
    b.extend_from_slice(path.as_bytes());
    b.push(0);
    b.extend_from_slice(mode.as_str().as_bytes());
    b.push(0);
    b
}

///////////////////////////////////////////////////////////////
// Unpack functions

/// Reads the leading two bytes of `packet` as a big-endian opcode.
pub fn unpack_opcode(packet: &[u8]) -> Result<OpCode, PacketError> {
    if packet.len() < 2 {
        return Err(PacketError::MalformedPacket("packet too short for an opcode"));
    }
    let raw = u16::from_be_bytes([packet[0], packet[1]]);
    OpCode::from_u16(raw).ok_or(PacketError::UnknownOpcode(raw))
}

/// Builds an ERROR packet from a raw error code, failing on codes outside
/// the 0..=7 vocabulary.
pub fn pack_error(code: u16, message: &str) -> Result<Vec<u8>, PacketError> {
    let code = ErrorCode::from_u16(code).ok_or(PacketError::UnknownErrorCode(code))?;
    Ok(Packet::Error {
        code,
        message: message.to_string(),
    }
    .encode())
}

/// Unpacks a DATA packet into its block number and payload.
pub fn unpack_data(packet: &[u8]) -> Result<(u16, Vec<u8>), PacketError> {
    let opcode = unpack_opcode(packet)?;
    if opcode != OpCode::Data {
        return Err(PacketError::IllegalOperation {
            expected: "DATA",
            got: opcode,
        });
    }
    if packet.len() < 4 {
        return Err(PacketError::MalformedPacket("DATA packet has no block number"));
    }
    let block = u16::from_be_bytes([packet[2], packet[3]]);
    Ok((block, packet[4..].to_vec()))
}

/// Unpacks an ACK packet into the acknowledged block number.
pub fn unpack_ack(packet: &[u8]) -> Result<u16, PacketError> {
    let opcode = unpack_opcode(packet)?;
    if opcode != OpCode::Ack {
        return Err(PacketError::IllegalOperation {
            expected: "ACK",
            got: opcode,
        });
    }
    if packet.len() < 4 {
        return Err(PacketError::MalformedPacket("ACK packet has no block number"));
    }
    Ok(u16::from_be_bytes([packet[2], packet[3]]))
}

/// Unpacks an RRQ or WRQ packet into its opcode, filename, and mode.
pub fn unpack_request(packet: &[u8]) -> Result<(OpCode, String, Mode), PacketError> {
    let opcode = unpack_opcode(packet)?;
    if opcode != OpCode::Rrq && opcode != OpCode::Wrq {
        return Err(PacketError::IllegalOperation {
            expected: "RRQ or WRQ",
            got: opcode,
        });
    }

    let rest = &packet[2..];
    let name_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::MalformedPacket("missing filename terminator"))?;
    let filename = std::str::from_utf8(&rest[..name_end])
        .map_err(|_| PacketError::MalformedPacket("filename is not valid UTF-8"))?;

    let rest = &rest[name_end + 1..];
    let mode_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::MalformedPacket("missing mode terminator"))?;

    if filename.is_empty() {
        return Err(StoreError::EmptyPath.into());
    }
    let mode = Mode::from_wire(&rest[..mode_end])?;

    Ok((opcode, filename.to_string(), mode))
}

/// Unpacks an ERROR packet so a peer's abort can be logged. Wire codes
/// outside the vocabulary fall back to NotDefined rather than failing; the
/// conversation is ending either way.
pub fn unpack_error(packet: &[u8]) -> Result<(ErrorCode, String), PacketError> {
    let opcode = unpack_opcode(packet)?;
    if opcode != OpCode::Error {
        return Err(PacketError::IllegalOperation {
            expected: "ERROR",
            got: opcode,
        });
    }
    if packet.len() < 4 {
        return Err(PacketError::MalformedPacket("ERROR packet has no error code"));
    }
    let raw = u16::from_be_bytes([packet[2], packet[3]]);
    let code = ErrorCode::from_u16(raw).unwrap_or(ErrorCode::NotDefined);
    let body = &packet[4..];
    let msg_end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let message = String::from_utf8_lossy(&body[..msg_end]).into_owned();
    Ok((code, message))
}

///////////////////////////////////////////////////////////////
// Socket wrapper

/// Represents an error returned from the TFTP socket wrapper.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

/// Wrapper around a UDP socket that sends encoded packets and returns raw
/// inbound datagrams with their source address. Parsing is left to the
/// caller, which knows what packet kind its exchange expects next.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> Result<TftpSocket, SocketError> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Waits indefinitely for the next datagram. Used by the dispatcher,
    /// which has no peer to time out on.
    pub async fn recv(&mut self) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (n, src) = self.sock.recv_from(&mut buf).await?;
        Ok((buf[..n].to_vec(), src))
    }

    pub async fn recv_with_timeout(
        &mut self,
        ttl: Duration,
    ) -> Result<(Vec<u8>, SocketAddr), SocketError> {
        let mut buf = [0; MAX_PACKET_SIZE];
        let (n, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        Ok((buf[..n].to_vec(), src))
    }

    pub async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> Result<(), SocketError> {
        self.sock.send_to(&packet.encode(), dst).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_bytes(opcode: u16, filename: &[u8], mode: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&opcode.to_be_bytes());
        b.extend_from_slice(filename);
        b.push(0);
        b.extend_from_slice(mode);
        b.push(0);
        b
    }

    #[test]
    fn test_unpack_opcode_values() {
        let mut b = request_bytes(0, b"my_file", b"netascii");
        for i in 1..=5u8 {
            b[1] = i;
            let opcode = unpack_opcode(&b).unwrap();
            assert_eq!(opcode as u16, u16::from(i));
        }
    }

    #[test]
    fn test_unpack_opcode_unknown() {
        let mut b = request_bytes(0, b"my_file", b"netascii");
        assert_eq!(unpack_opcode(&b), Err(PacketError::UnknownOpcode(0)));
        b[1] = 6;
        assert_eq!(unpack_opcode(&b), Err(PacketError::UnknownOpcode(6)));
    }

    #[test]
    fn test_unpack_opcode_truncated() {
        assert!(matches!(
            unpack_opcode(&[0x01]),
            Err(PacketError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_pack_error_all_codes() {
        for code in 0..=7u16 {
            let p = pack_error(code, "Cabbage Icecream!").unwrap();
            let mut want = vec![0x00, 0x05];
            want.extend_from_slice(&code.to_be_bytes());
            want.extend_from_slice(b"Cabbage Icecream!");
            want.push(0);
            assert_eq!(p, want);
        }
    }

    #[test]
    fn test_pack_error_unknown_code() {
        assert_eq!(
            pack_error(8, "Cabbage Icecream!"),
            Err(PacketError::UnknownErrorCode(8))
        );
    }

    #[test]
    fn test_pack_data_with_payload() {
        let p = Packet::Data {
            block: 55,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        }
        .encode();
        assert_eq!(p, vec![0x00, 0x03, 0x00, 0x37, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_pack_data_zero_length() {
        let p = Packet::Data {
            block: 55,
            data: vec![],
        }
        .encode();
        assert_eq!(p, vec![0x00, 0x03, 0x00, 0x37]);
    }

    #[test]
    fn test_unpack_data() {
        let (block, data) = unpack_data(&[0x00, 0x03, 0x12, 0x34, 0x01, 0x02]).unwrap();
        assert_eq!(block, 0x1234);
        assert_eq!(data, vec![0x01, 0x02]);
    }

    #[test]
    fn test_unpack_data_too_short() {
        assert!(matches!(
            unpack_data(&[0x00, 0x03, 0x37]),
            Err(PacketError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_unpack_data_wrong_opcode() {
        assert!(matches!(
            unpack_data(&[0x00, 0x02, 0x00, 0x37, 0x01]),
            Err(PacketError::IllegalOperation { .. })
        ));
    }

    #[test]
    fn test_unpack_ack() {
        assert_eq!(unpack_ack(&[0x00, 0x04, 0x00, 0x37]), Ok(55));
    }

    #[test]
    fn test_pack_ack() {
        let p = Packet::Ack { block: 55 }.encode();
        assert_eq!(p, vec![0x00, 0x04, 0x00, 0x37]);
    }

    #[test]
    fn test_unpack_ack_wrong_opcode() {
        assert!(matches!(
            unpack_ack(&[0x00, 0x05, 0x00, 0x37]),
            Err(PacketError::IllegalOperation { .. })
        ));
    }

    #[test]
    fn test_unpack_request() {
        let b = request_bytes(1, b"myfile", b"octet");
        assert_eq!(
            unpack_request(&b),
            Ok((OpCode::Rrq, "myfile".to_string(), Mode::Octet))
        );
    }

    #[test]
    fn test_unpack_request_mode_is_case_insensitive() {
        let b = request_bytes(2, b"myfile", b"NetASCII");
        assert_eq!(
            unpack_request(&b),
            Ok((OpCode::Wrq, "myfile".to_string(), Mode::Netascii))
        );
    }

    #[test]
    fn test_unpack_request_wrong_opcode() {
        let b = request_bytes(3, b"myfile", b"netascii");
        assert!(matches!(
            unpack_request(&b),
            Err(PacketError::IllegalOperation { .. })
        ));
    }

    #[test]
    fn test_unpack_request_missing_filename_terminator() {
        let mut b = Vec::new();
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(b"myfile");
        b.extend_from_slice(b"netascii");
        assert!(matches!(
            unpack_request(&b),
            Err(PacketError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_unpack_request_missing_mode_terminator() {
        let mut b = Vec::new();
        b.extend_from_slice(&1u16.to_be_bytes());
        b.extend_from_slice(b"myfile");
        b.push(0);
        b.extend_from_slice(b"netascii");
        assert!(matches!(
            unpack_request(&b),
            Err(PacketError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_unpack_request_empty_filename() {
        let b = request_bytes(1, b"", b"netascii");
        assert_eq!(
            unpack_request(&b),
            Err(PacketError::Store(StoreError::EmptyPath))
        );
    }

    #[test]
    fn test_unpack_request_unknown_mode() {
        let b = request_bytes(1, b"myfile", b"say_friend_and_open");
        assert_eq!(
            unpack_request(&b),
            Err(PacketError::UnknownMode("say_friend_and_open".to_string()))
        );
    }

    #[test]
    fn test_unpack_error() {
        let p = Packet::Error {
            code: ErrorCode::FileExists,
            message: "taken".to_string(),
        }
        .encode();
        assert_eq!(
            unpack_error(&p),
            Ok((ErrorCode::FileExists, "taken".to_string()))
        );
    }

    #[test]
    fn test_unpack_error_out_of_range_code() {
        let b = vec![0x00, 0x05, 0x00, 0xFF, b'x', 0x00];
        assert_eq!(unpack_error(&b), Ok((ErrorCode::NotDefined, "x".to_string())));
    }

    #[test]
    fn test_request_encode_round_trip() {
        let p = Packet::ReadReq {
            path: "my_file".to_string(),
            mode: Mode::Netascii,
        };
        assert_eq!(
            unpack_request(&p.encode()),
            Ok((OpCode::Rrq, "my_file".to_string(), Mode::Netascii))
        );
    }
}
