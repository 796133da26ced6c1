//! Symmetric encrypted channels.
//!
//! After the `createChannel`/`confirmChannel` exchange each side holds the
//! other's ephemeral channel key. The ECDH secret of the two channel keys gives
//! one AES key per direction; which side uses the secret as is and which uses
//! it reversed is decided by comparing the peers' short ids, so the two ends
//! always pick opposite keys.
//!
//! Channel datagrams are addressed by the id of the AES key they are sealed
//! with: we send to `out_id` (our encryption key) and receive on `in_id` (our
//! decryption key), which is the peer's `out_id`.

use std::cmp::Ordering as IdOrdering;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ton_crypto::aes_key_id;
use ton_crypto::encryption::{open, seal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{AdnlError, Result};
use crate::id::AdnlIdShort;

use super::dispatcher::{Adnl, Datagram, Route, RouteKind};
use super::packet::AdnlPacket;
use super::peer::IncomingPacket;

/// The pair of AES keys used by one side of a channel.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct ChannelKeys {
    pub encrypt: [u8; 32],
    pub decrypt: [u8; 32],
}

impl ChannelKeys {
    /// Splits the ECDH secret into directional keys.
    pub fn derive(secret: [u8; 32], local: &AdnlIdShort, remote: &AdnlIdShort) -> Self {
        let mut reversed = secret;
        reversed.reverse();

        match local.cmp(remote) {
            IdOrdering::Less => Self {
                encrypt: reversed,
                decrypt: secret,
            },
            IdOrdering::Greater => Self {
                encrypt: secret,
                decrypt: reversed,
            },
            IdOrdering::Equal => Self {
                encrypt: secret,
                decrypt: secret,
            },
        }
    }

    /// Id prefixed to the datagrams we send.
    pub fn out_id(&self) -> AdnlIdShort {
        AdnlIdShort::new(aes_key_id(&self.encrypt))
    }

    /// Id on which the peer's datagrams arrive.
    pub fn in_id(&self) -> AdnlIdShort {
        AdnlIdShort::new(aes_key_id(&self.decrypt))
    }
}

/// Plaintext packet bytes waiting to be sealed and sent.
struct ChannelOutgoing {
    data: Vec<u8>,
    addr: SocketAddr,
}

/// What a peer pair hands to a channel so it can route decrypted packets back.
#[derive(Clone)]
pub(crate) struct ChannelContext {
    pub adnl: Adnl,
    pub peer_input: mpsc::Sender<IncomingPacket>,
    pub cancel: CancellationToken,
}

/// A live channel: registered with the dispatcher and running one relay task
/// per direction. Dropping it stops both relays and releases `in_id`.
pub(crate) struct EncryptedChannel {
    remote_key: [u8; 32],
    date: i32,
    in_id: AdnlIdShort,
    out_id: AdnlIdShort,
    ready: Arc<AtomicBool>,
    outgoing: mpsc::Sender<ChannelOutgoing>,
    cancel: CancellationToken,
    _route: Route,
}

impl EncryptedChannel {
    /// Registers `keys.in_id()` and spawns the relays.
    pub fn open(
        ctx: &ChannelContext,
        keys: ChannelKeys,
        remote_key: [u8; 32],
        date: i32,
    ) -> Result<Self> {
        let capacity = ctx.adnl.config().queue_capacity;
        let in_id = keys.in_id();
        let out_id = keys.out_id();

        let (in_tx, in_rx) = mpsc::channel(capacity);
        let route = ctx.adnl.register(in_id, RouteKind::Channel, in_tx)?;

        let (out_tx, out_rx) = mpsc::channel(capacity);
        let cancel = ctx.cancel.child_token();
        let ready = Arc::new(AtomicBool::new(false));

        tokio::spawn(decrypt_relay(
            keys.decrypt,
            in_rx,
            ctx.peer_input.clone(),
            ready.clone(),
            cancel.clone(),
        ));
        tokio::spawn(encrypt_relay(
            keys.encrypt,
            out_id,
            out_rx,
            ctx.adnl.clone(),
            cancel.clone(),
        ));

        debug!(?in_id, ?out_id, "channel opened");

        Ok(Self {
            remote_key,
            date,
            in_id,
            out_id,
            ready,
            outgoing: out_tx,
            cancel,
            _route: route,
        })
    }

    /// The peer's channel public key.
    pub fn remote_key(&self) -> &[u8; 32] {
        &self.remote_key
    }

    pub fn date(&self) -> i32 {
        self.date
    }

    pub fn in_id(&self) -> AdnlIdShort {
        self.in_id
    }

    pub fn out_id(&self) -> AdnlIdShort {
        self.out_id
    }

    /// Whether the peer has shown it holds the channel keys.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Returns a sender that seals packets through this channel.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            outgoing: self.outgoing.clone(),
        }
    }
}

impl Drop for EncryptedChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        trace!(in_id = ?self.in_id, "channel closed");
    }
}

/// Handle for queueing packets on a channel without holding peer state.
#[derive(Clone)]
pub(crate) struct ChannelSender {
    outgoing: mpsc::Sender<ChannelOutgoing>,
}

impl ChannelSender {
    pub async fn send(&self, data: Vec<u8>, addr: SocketAddr) -> Result<()> {
        self.outgoing
            .send(ChannelOutgoing { data, addr })
            .await
            .map_err(|_| AdnlError::ChannelClosed)
    }
}

async fn decrypt_relay(
    key: [u8; 32],
    mut incoming: mpsc::Receiver<Datagram>,
    peer_input: mpsc::Sender<IncomingPacket>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            datagram = incoming.recv() => match datagram {
                Some(datagram) => datagram,
                None => break,
            },
        };

        let plaintext = match open(&key, &datagram.payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                trace!("channel decrypt failed from {}: {}", datagram.source, e);
                continue;
            }
        };
        ready.store(true, Ordering::Release);

        let packet = match AdnlPacket::from_bytes(&plaintext) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("bad channel packet from {}: {}", datagram.source, e);
                continue;
            }
        };

        let incoming = IncomingPacket {
            packet,
            source: datagram.source,
            via_channel: true,
        };
        if peer_input.send(incoming).await.is_err() {
            break;
        }
    }
}

async fn encrypt_relay(
    key: [u8; 32],
    out_id: AdnlIdShort,
    mut outgoing: mpsc::Receiver<ChannelOutgoing>,
    adnl: Adnl,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = outgoing.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let sealed = seal(&key, &packet.data);
        if let Err(e) = adnl.send_datagram(&out_id, packet.addr, &sealed).await {
            warn!("channel send to {} failed: {}", packet.addr, e);
        }
    }
}
