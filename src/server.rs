// The request dispatcher.
//
// The dispatcher owns the well-known port. It parses each inbound datagram
// as a read or write request, answers unparseable ones with an ERROR packet
// directly, and spawns one task per accepted request. Each task runs its
// conversation over a freshly bound socket, so a slow client never blocks
// the dispatcher or any other transfer.

use crate::srv_conn::{bind_reply_socket, send_error, ConversationHandler};
use crate::store::{FileStore, StoreError};
use crate::tftp::{self, ErrorCode, Mode, OpCode, Packet, PacketError, SocketError, TftpSocket};
use crate::transfer::{ReadTransfer, Transfer, WriteTransfer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// How long a conversation waits for each peer datagram before feeding a
/// timeout to its transfer. Retries are bounded by attempt count, so this
/// only sets the pace of retransmission.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A TFTP server over an in-memory file store.
pub struct Server {
    sock: TftpSocket,
    store: Arc<FileStore>,
    recv_timeout: Duration,
}

impl Server {
    pub fn bind(addr: SocketAddr, store: Arc<FileStore>) -> Result<Server, SocketError> {
        Ok(Server {
            sock: TftpSocket::bind(addr)?,
            store,
            recv_timeout: RECV_TIMEOUT,
        })
    }

    /// Overrides the per-wait receive timeout; tests shorten it so
    /// retransmission paths run in milliseconds.
    pub fn with_recv_timeout(mut self, recv_timeout: Duration) -> Server {
        self.recv_timeout = recv_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// Receives requests forever. Returns only if the dispatch socket fails;
    /// a bad request or a failed conversation never tears the server down.
    pub async fn serve(mut self) -> Result<(), SocketError> {
        loop {
            let (buf, src) = self.sock.recv().await?;
            match tftp::unpack_request(&buf) {
                Ok((opcode, filename, mode)) => {
                    let store = self.store.clone();
                    let recv_timeout = self.recv_timeout;
                    tokio::spawn(async move {
                        run_conversation(store, src, opcode, filename, mode, recv_timeout).await;
                    });
                }
                Err(e) => {
                    log::info!("Rejecting request from [{src}]: {e}");
                    let reply = Packet::Error {
                        code: rejection_code(&e),
                        message: e.to_string(),
                    };
                    let _ = self.sock.send(&reply, src).await;
                }
            }
        }
    }
}

// Translates a request parse failure into the wire error code the peer sees.
fn rejection_code(e: &PacketError) -> ErrorCode {
    match e {
        PacketError::UnknownMode(_) => ErrorCode::AccessViolation,
        PacketError::Store(_) => ErrorCode::FileNotFound,
        PacketError::UnknownOpcode(_)
        | PacketError::UnknownErrorCode(_)
        | PacketError::IllegalOperation { .. }
        | PacketError::MalformedPacket(_) => ErrorCode::IllegalOperation,
    }
}

async fn run_conversation(
    store: Arc<FileStore>,
    peer: SocketAddr,
    opcode: OpCode,
    filename: String,
    mode: Mode,
    recv_timeout: Duration,
) {
    let mut sock = bind_reply_socket();

    let transfer = match opcode {
        OpCode::Rrq => {
            log::info!(
                "Client [{peer}] requested to read file [{filename}] using transfer mode [{mode}]"
            );
            match ReadTransfer::new(&store, &filename, mode) {
                Ok(t) => Transfer::Read(t),
                Err(e) => {
                    send_error(&mut sock, peer, ErrorCode::FileNotFound, &e.to_string()).await;
                    return;
                }
            }
        }
        _ => {
            log::info!(
                "Client [{peer}] requested to write file [{filename}] using transfer mode [{mode}]"
            );
            match WriteTransfer::new(store, &filename, mode) {
                Ok(t) => Transfer::Write(t),
                Err(e) => {
                    let code = match e {
                        StoreError::FileExists(_) => ErrorCode::FileExists,
                        StoreError::EmptyPath | StoreError::FileNotFound(_) => {
                            ErrorCode::FileNotFound
                        }
                    };
                    send_error(&mut sock, peer, code, &e.to_string()).await;
                    return;
                }
            }
        }
    };

    ConversationHandler::new(sock, peer, transfer)
        .handle(recv_timeout)
        .await;
}
