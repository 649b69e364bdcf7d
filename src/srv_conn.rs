// This module contains the server-side conversation driver.
//
// A conversation starts when the dispatcher accepts a read or write request.
// The driver binds a fresh socket on a random high port (the server's
// transfer ID), sends the transfer's opening packet, and then cycles between
// work and wait: the transfer state machine decides what to send, and the
// driver waits for the peer's reply with a bounded timeout. A timeout is fed
// back into the machine, which either retransmits or gives up once its
// attempt budget for the current block is spent. The conversation ends when
// the machine closes it, deliberately or with a final error packet.
//
// Datagrams arriving from any address other than the peer belong to some
// other conversation that guessed our port; they are answered with an
// UNKNOWN_TRANSFER_ID error and do not disturb this transfer.

use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use crate::transfer::{Action, Transfer};
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Attempts to bind to a random UDP socket until one succeeds.
pub fn bind_reply_socket() -> TftpSocket {
    let mut rng = rand::thread_rng();
    loop {
        match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, rng.gen_range(1024..65535)).into()) {
            Ok(sock) => return sock,
            Err(e) => log::warn!("Couldn't bind reply socket: {e}"),
        }
    }
}

/// Sends an ERROR packet without caring whether it arrives; error packets
/// are never retransmitted or acknowledged.
pub async fn send_error(sock: &mut TftpSocket, dst: SocketAddr, code: ErrorCode, message: &str) {
    let packet = Packet::Error {
        code,
        message: message.to_string(),
    };
    let _ = sock.send(&packet, dst).await;
    log::info!("Sent error to Client [{dst}]: {message}");
}

/// Drives a single transfer conversation over its own socket.
pub struct ConversationHandler {
    sock: TftpSocket,
    peer: SocketAddr,
    transfer: Transfer,
}

impl ConversationHandler {
    pub fn new(sock: TftpSocket, peer: SocketAddr, transfer: Transfer) -> ConversationHandler {
        ConversationHandler {
            sock,
            peer,
            transfer,
        }
    }

    /// Runs the conversation to completion. `recv_timeout` bounds each wait
    /// for a peer datagram; the overall lifetime is bounded by the transfer's
    /// per-block attempt budget, not by wall clock.
    pub async fn handle(&mut self, recv_timeout: Duration) {
        let mut out = match self.transfer.start() {
            Action::SendAndAwait(p) => p,
            Action::FinishWith(p) => {
                let _ = self.sock.send(&p, self.peer).await;
                return;
            }
            Action::Close(_) | Action::KeepWaiting => {
                log::error!(
                    "Transfer produced no opening packet for {:#?}. This should never happen!",
                    self.peer
                );
                send_error(
                    &mut self.sock,
                    self.peer,
                    ErrorCode::NotDefined,
                    "Internal error, please retry",
                )
                .await;
                return;
            }
        };

        // The outer loop sends; the inner loop waits until the transfer
        // produces the next packet or ends the conversation. Stray and
        // duplicate datagrams keep the wait going without a resend.
        loop {
            if let Err(e) = self.sock.send(&out, self.peer).await {
                log::warn!("Unable to send packet to {:#?}: {e}", self.peer);
                return;
            }

            'wait: loop {
                let action = match self.sock.recv_with_timeout(recv_timeout).await {
                    Ok((buf, src)) => {
                        if src != self.peer {
                            send_error(
                                &mut self.sock,
                                src,
                                ErrorCode::UnknownTransferId,
                                "Unknown transfer ID",
                            )
                            .await;
                            continue 'wait;
                        }
                        log::debug!("Got {} bytes from {:#?}", buf.len(), src);
                        self.transfer.on_packet(&buf)
                    }
                    Err(SocketError::Timeout(_)) => self.transfer.on_timeout(),
                    Err(SocketError::IO(e)) => {
                        log::warn!("I/O error talking to {:#?}: {:#?}", self.peer, e);
                        return;
                    }
                };

                match action {
                    Action::SendAndAwait(p) => {
                        out = p;
                        break 'wait;
                    }
                    Action::KeepWaiting => continue 'wait,
                    Action::Close(maybe_why) => {
                        if let Some(why) = maybe_why {
                            log::warn!("{why}");
                        }
                        log::info!("Closing conversation with {:#?}", self.peer);
                        return;
                    }
                    Action::FinishWith(p) => {
                        let _ = self.sock.send(&p, self.peer).await;
                        log::info!("Closing conversation with {:#?}", self.peer);
                        return;
                    }
                }
            }
        }
    }
}
