// An in-memory TFTP server compliant with the RFC 1350 core.
//
// A transfer begins with a request to read or write a file. If the server
// grants the request, the file moves in blocks of 512 bytes, and each DATA
// packet must be acked before the next one goes out. A DATA packet shorter
// than 512 bytes marks the end of the transfer.
//
// On packet loss the waiting side times out and retransmits its last packet,
// prompting the peer to retransmit the lost one; each block gets a bounded
// number of send attempts before the conversation is abandoned. Errors are
// signaled with an ERROR packet, which is never acked or retransmitted.
//
// Requests arrive on the well-known port. Each granted request is answered
// from a fresh port (the server's transfer ID) so concurrent conversations
// stay separate. Files live in a shared in-memory store: reads serve what an
// earlier write uploaded, and a name can only be written once.

use std::net::Ipv4Addr;
use std::sync::Arc;

pub mod netascii;
pub mod server;
pub mod srv_conn;
pub mod store;
pub mod tftp;
pub mod transfer;

use server::Server;
use store::FileStore;

use anyhow::Result;

const PORT: u16 = 69;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let store = Arc::new(FileStore::new());
    let server = Server::bind((Ipv4Addr::UNSPECIFIED, PORT).into(), store)?;
    log::info!("Listening on {}", server.local_addr()?);

    server.serve().await?;
    Ok(())
}
