//! # ton-adnl
//!
//! ADNL (Abstract Datagram Network Layer) over UDP: identity-addressed,
//! encrypted, peer-to-peer datagrams for TON.
//!
//! Every participant is named by the SHA-256 of its Ed25519 public key. A
//! single [`udp::Adnl`] transport can host several local identities, each of
//! which talks to many remote ones:
//!
//! - **Identity addressing**: datagrams start with the 32-byte id of their
//!   recipient, so one UDP port serves many identities and channels
//! - **Encrypted channels**: after a short handshake, packets are sealed with
//!   per-direction AES keys derived from ephemeral ECDH keys
//! - **Replay protection**: a 512-bit sliding window over sequence numbers
//! - **Restart detection**: reinit dates let peers notice each other's
//!   restarts and start over cleanly
//! - **Queries**: request/response with caller-side timeouts
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ton_adnl::udp::Adnl;
//! use ton_crypto::PrivateKey;
//!
//! async fn ping() -> Result<(), Box<dyn std::error::Error>> {
//!     let adnl = Adnl::bind("0.0.0.0:30303".parse()?).await?;
//!     let node = adnl.local_node(PrivateKey::generate()).build()?;
//!
//!     // Descriptor of the remote node, e.g. from a DHT lookup
//!     let remote = ton_adnl::AdnlNode::with_socket_addr(
//!         ton_crypto::PublicKey::from_bytes([0u8; 32]).into(),
//!         "1.2.3.4:30303".parse()?,
//!     );
//!
//!     let channel = node.create_channel(remote).await?;
//!     channel.send_message(b"hello".to_vec()).await?;
//!     let answer = channel.send_query(b"ping".to_vec(), Duration::from_secs(5)).await?;
//!     println!("Answer: {} bytes", answer.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Packet Formats
//!
//! ### Initial Packet Format
//!
//! ```text
//! +----------------+------------------+------------------+------------------+
//! | Recipient ID   | Ephemeral Pubkey | SHA256(content)  | Encrypted Content|
//! | 32 bytes       | 32 bytes         | 32 bytes         | Variable         |
//! +----------------+------------------+------------------+------------------+
//! ```
//!
//! ### Channel Packet Format
//!
//! ```text
//! +----------------+------------------+------------------+
//! | Channel ID     | SHA256(content)  | Encrypted Content|
//! | 32 bytes       | 32 bytes         | Variable         |
//! +----------------+------------------+------------------+
//! ```
//!
//! The content in all packets is encrypted with AES-256-CTR.

mod address;
mod config;
mod error;
mod id;
mod tl;
pub mod udp;

// Re-export main types
pub use address::{AdnlAddress, AdnlAddressList, AdnlNode};
pub use config::{AdnlConfig, RateLimitConfig};
pub use error::{AdnlError, Result};
pub use id::{AdnlIdFull, AdnlIdShort};
pub use udp::{Adnl, AdnlChannel, AdnlLocalNode, AdnlQuery, PeerPairState};

// Re-export TL schema IDs for convenience
pub mod schemas {
    //! TL schema IDs for ADNL protocol messages.
    pub use crate::tl::{
        ADNL_ADDRESS_UDP, ADNL_ADDRESS_UDP6, ADNL_MESSAGE_ANSWER, ADNL_MESSAGE_CONFIRM_CHANNEL,
        ADNL_MESSAGE_CREATE_CHANNEL, ADNL_MESSAGE_CUSTOM, ADNL_MESSAGE_NOP, ADNL_MESSAGE_PART,
        ADNL_MESSAGE_QUERY, ADNL_MESSAGE_REINIT, ADNL_PACKET_CONTENTS, PUB_ED25519,
    };
}

// Re-export TL utilities
pub use tl::{TlReader, TlWriter};
