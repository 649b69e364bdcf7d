// Transfer state machines for read and write requests.
//
// These are pure: they consume raw inbound datagrams and timeout events and
// produce actions for the connection driver to carry out. No sockets, no
// clocks. That keeps every state and transition testable in isolation.
//
// Both machines share the same shape. A transfer starts by producing its
// opening packet (DATA block 1 for reads, ACK 0 for writes), then alternates
// between sending and waiting. Each block is sent at most
// MAX_SEND_ATTEMPTS times; a matching reply resets the budget, a timeout
// spends one attempt, and exhausting the budget aborts the conversation with
// an ACCESS_VIOLATION error packet.

use crate::netascii;
use crate::store::{FileStore, StoreError};
use crate::tftp::{self, ErrorCode, Mode, OpCode, Packet, BLOCK_SIZE};
use std::sync::Arc;

/// How many times a single block is sent before the transfer gives up.
pub const MAX_SEND_ATTEMPTS: u32 = 10;

/// Represents an action that the caller of a transfer should take in
/// response to an inbound packet or a receive timeout.
#[derive(Debug, PartialEq)]
pub enum Action {
    /// Caller should send the packet and await a response.
    SendAndAwait(Packet),

    /// Caller should keep waiting without sending anything; the packet was
    /// a duplicate or stray and the previous send still stands.
    KeepWaiting,

    /// Caller should close the conversation without sending a packet,
    /// optionally logging a string.
    Close(Option<String>),

    /// Caller should send the packet and then close the conversation.
    FinishWith(Packet),
}

/// A transfer conversation in either direction.
#[derive(Debug)]
pub enum Transfer {
    Read(ReadTransfer),
    Write(WriteTransfer),
}

impl Transfer {
    /// Produces the packet that opens the conversation.
    pub fn start(&mut self) -> Action {
        match self {
            Transfer::Read(t) => t.start(),
            Transfer::Write(t) => t.start(),
        }
    }

    /// Feeds an inbound datagram from the peer to the state machine.
    pub fn on_packet(&mut self, packet: &[u8]) -> Action {
        match self {
            Transfer::Read(t) => t.on_ack(packet),
            Transfer::Write(t) => t.on_data(packet),
        }
    }

    /// Signals that the receive timeout elapsed with no packet from the peer.
    pub fn on_timeout(&mut self) -> Action {
        match self {
            Transfer::Read(t) => t.on_timeout(),
            Transfer::Write(t) => t.on_timeout(),
        }
    }
}

// A peer may abort either kind of transfer with an ERROR packet; per RFC
// 1350 that packet is neither acknowledged nor answered.
fn peer_abort(packet: &[u8]) -> Option<Action> {
    if tftp::unpack_opcode(packet) != Ok(OpCode::Error) {
        return None;
    }
    let why = match tftp::unpack_error(packet) {
        Ok((code, message)) => format!("Peer aborted the transfer: {code:?}: '{message}'"),
        Err(_) => "Peer aborted the transfer with a malformed error packet".to_string(),
    };
    Some(Action::Close(Some(why)))
}

fn attempts_exhausted(block: u16) -> Action {
    Action::FinishWith(Packet::Error {
        code: ErrorCode::AccessViolation,
        message: format!("Maximum number of send attempts reached for block [{block}]"),
    })
}

///////////////////////////////////////////////////////////////
// Read (RRQ) direction

/// Serves one file out of the store, block by block.
///
/// The whole file is fetched up front; in netascii mode the entire blob is
/// transcoded once before slicing begins so block boundaries fall on wire
/// bytes, not raw bytes.
#[derive(Debug)]
pub struct ReadTransfer {
    data: Vec<u8>,

    /// Block currently being sent, numbered from 1, wrapping at 65536.
    block: u16,

    /// Byte offset of the current block within `data`. Kept separately from
    /// `block` so files longer than 32 MiB survive the block-number wrap.
    offset: usize,

    /// Sends of the current block so far.
    attempts: u32,
}

impl ReadTransfer {
    pub fn new(store: &FileStore, filename: &str, mode: Mode) -> Result<ReadTransfer, StoreError> {
        let file = store.get(filename)?;
        let data = match mode {
            Mode::Netascii => netascii::encode(&file),
            Mode::Octet | Mode::Mail => file,
        };
        Ok(ReadTransfer {
            data,
            block: 1,
            offset: 0,
            attempts: 0,
        })
    }

    fn start(&mut self) -> Action {
        self.attempts = 1;
        Action::SendAndAwait(self.data_packet())
    }

    fn on_ack(&mut self, packet: &[u8]) -> Action {
        let block = match tftp::unpack_ack(packet) {
            Ok(block) => block,
            Err(e) => {
                if let Some(action) = peer_abort(packet) {
                    return action;
                }
                return Action::FinishWith(Packet::Error {
                    code: ErrorCode::IllegalOperation,
                    message: e.to_string(),
                });
            }
        };

        if block != self.block {
            // Stray or duplicate ack; the DATA packet in flight still stands.
            log::debug!(
                "Ignoring ACK [{block}] while waiting for ACK [{}]",
                self.block
            );
            return Action::KeepWaiting;
        }

        if self.current_payload().len() < BLOCK_SIZE {
            // The short (possibly empty) block was acknowledged: end of file.
            return Action::Close(None);
        }

        self.offset += BLOCK_SIZE;
        self.block = self.block.wrapping_add(1);
        self.attempts = 1;
        Action::SendAndAwait(self.data_packet())
    }

    fn on_timeout(&mut self) -> Action {
        if self.attempts >= MAX_SEND_ATTEMPTS {
            return attempts_exhausted(self.block);
        }
        self.attempts += 1;
        log::debug!(
            "Timed out waiting for ACK [{}], resending (attempt {})",
            self.block,
            self.attempts
        );
        Action::SendAndAwait(self.data_packet())
    }

    fn current_payload(&self) -> &[u8] {
        let end = (self.offset + BLOCK_SIZE).min(self.data.len());
        &self.data[self.offset..end]
    }

    fn data_packet(&self) -> Packet {
        Packet::Data {
            block: self.block,
            data: self.current_payload().to_vec(),
        }
    }
}

///////////////////////////////////////////////////////////////
// Write (WRQ) direction

/// Accepts one file upload into the store.
///
/// Payloads accumulate in memory and are committed in a single create-once
/// `put` when the final short block arrives, so other conversations never
/// observe a half-written file.
#[derive(Debug)]
pub struct WriteTransfer {
    store: Arc<FileStore>,
    filename: String,
    mode: Mode,

    /// Last accepted block, 0 until the first DATA arrives.
    block: u16,
    buf: Vec<u8>,
    attempts: u32,
}

impl WriteTransfer {
    /// Fails with `FileExists` up front so a doomed upload is refused before
    /// the client sends a single data block.
    pub fn new(
        store: Arc<FileStore>,
        filename: &str,
        mode: Mode,
    ) -> Result<WriteTransfer, StoreError> {
        match store.get(filename) {
            Ok(_) => Err(StoreError::FileExists(filename.to_string())),
            Err(StoreError::FileNotFound(_)) => Ok(WriteTransfer {
                store,
                filename: filename.to_string(),
                mode,
                block: 0,
                buf: Vec::new(),
                attempts: 0,
            }),
            Err(e) => Err(e),
        }
    }

    fn start(&mut self) -> Action {
        self.attempts = 1;
        Action::SendAndAwait(Packet::Ack { block: 0 })
    }

    fn on_data(&mut self, packet: &[u8]) -> Action {
        let (block, data) = match tftp::unpack_data(packet) {
            Ok(parts) => parts,
            Err(e) => {
                if let Some(action) = peer_abort(packet) {
                    return action;
                }
                return Action::FinishWith(Packet::Error {
                    code: ErrorCode::IllegalOperation,
                    message: e.to_string(),
                });
            }
        };

        if block != self.block.wrapping_add(1) {
            // Duplicate or out-of-order block. Send nothing; the peer will
            // time out and retransmit, and our previous ACK still stands.
            log::debug!(
                "Ignoring DATA [{block}] while expecting DATA [{}]",
                self.block.wrapping_add(1)
            );
            return Action::KeepWaiting;
        }

        self.block = block;
        self.attempts = 1;
        self.buf.extend_from_slice(&data);

        if data.len() < BLOCK_SIZE {
            return self.commit();
        }
        Action::SendAndAwait(Packet::Ack { block })
    }

    fn on_timeout(&mut self) -> Action {
        if self.attempts >= MAX_SEND_ATTEMPTS {
            return attempts_exhausted(self.block);
        }
        self.attempts += 1;
        log::debug!(
            "Timed out waiting for DATA [{}], resending ACK [{}] (attempt {})",
            self.block.wrapping_add(1),
            self.block,
            self.attempts
        );
        Action::SendAndAwait(Packet::Ack { block: self.block })
    }

    // The final short block arrived: decode if needed, commit, and ack.
    fn commit(&mut self) -> Action {
        let raw = std::mem::take(&mut self.buf);
        let blob = match self.mode {
            Mode::Netascii => netascii::decode(&raw),
            Mode::Octet | Mode::Mail => raw,
        };
        match self.store.put(&self.filename, blob) {
            Ok(()) => Action::FinishWith(Packet::Ack { block: self.block }),
            // Lost a race with another writer for the same name.
            Err(e @ StoreError::FileExists(_)) => Action::FinishWith(Packet::Error {
                code: ErrorCode::FileExists,
                message: e.to_string(),
            }),
            Err(e) => Action::FinishWith(Packet::Error {
                code: ErrorCode::NotDefined,
                message: e.to_string(),
            }),
        }
    }
}
