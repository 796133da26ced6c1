//! ADNL over UDP.
//!
//! ## Layers
//!
//! - [`Adnl`]: one UDP socket and the routing table. Each datagram is
//!   prefixed with the 32-byte id of its destination, a local node or a
//!   channel, and queued to whoever owns that id.
//! - [`AdnlLocalNode`]: one local identity. Decrypts first-contact packets
//!   addressed to it and keeps one peer pair per remote identity.
//! - [`AdnlChannel`]: a peer pair. Batches outgoing messages into packets,
//!   checks incoming packets against replay and restart rules, and runs the
//!   channel handshake.
//!
//! ## Protocol Overview
//!
//! 1. **First contact**: packets are signed, then encrypted to the peer's
//!    identity key with an ephemeral ECDH key, and carry `createChannel`.
//! 2. **Handshake**: the peer answers with `confirmChannel`; both sides derive
//!    one AES key per direction from their channel keys.
//! 3. **Channel**: once the peer has used the channel, packets are only
//!    sealed with the channel key, no signature and no sender field.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ton_adnl::udp::Adnl;
//! use ton_crypto::PrivateKey;
//!
//! async fn run() -> ton_adnl::Result<()> {
//!     let adnl_a = Adnl::bind("127.0.0.1:30303".parse().unwrap()).await?;
//!     let adnl_b = Adnl::bind("127.0.0.1:30304".parse().unwrap()).await?;
//!
//!     let node_b = adnl_b
//!         .local_node(PrivateKey::generate())
//!         .on_query(|_, query| {
//!             query.respond(query.data().to_vec());
//!         })
//!         .build()?;
//!     let node_a = adnl_a.local_node(PrivateKey::generate()).build()?;
//!
//!     let channel = node_a.create_channel(node_b.node()).await?;
//!     let answer = channel.send_query(b"ping".to_vec(), Duration::from_secs(5)).await?;
//!     assert_eq!(answer, b"ping");
//!     Ok(())
//! }
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

mod assembler;
mod channel;
mod dispatcher;
mod history;
mod message;
mod node;
mod packet;
mod peer;

pub use dispatcher::Adnl;
pub use history::{HISTORY_BITS, PacketsHistory};
pub use message::AdnlMessage;
pub use node::{AdnlLocalNode, LocalNodeBuilder};
pub use packet::{
    ADNL_MTU, AdnlPacket, AdnlPacketFlags, CHANNEL_PACKET_HEADER_MAX_SIZE,
    PACKET_HEADER_MAX_SIZE, ReinitDates,
};
pub use peer::{AdnlChannel, AdnlQuery, MessageHandler, PeerPairState, QueryHandler};

/// Current Unix time in seconds, as used for reinit and channel dates.
pub(crate) fn unix_time() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0)
}
