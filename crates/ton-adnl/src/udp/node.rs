//! Local ADNL identities.
//!
//! An [`AdnlLocalNode`] owns one Ed25519 key, is registered with the
//! transport under its short id and keeps one peer pair per remote identity.
//! Datagrams addressed to the node are public-key encrypted; the node decrypts
//! them, finds (or creates) the pair for the sender and hands the packet over.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use ton_crypto::PrivateKey;
use ton_crypto::encryption::decrypt_with;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::address::{AdnlAddressList, AdnlNode};
use crate::error::{AdnlError, Result};
use crate::id::{AdnlIdFull, AdnlIdShort};

use super::dispatcher::{Adnl, Datagram, Route, RouteKind};
use super::packet::AdnlPacket;
use super::peer::{AdnlChannel, IncomingPacket, MessageHandler, PeerTable, QueryHandler};
use super::{AdnlMessage, unix_time};

/// The parts of a local node that its peer pairs need.
pub(crate) struct LocalIdentity {
    pub key: PrivateKey,
    pub id: AdnlIdFull,
    pub reinit_date: i32,
    pub addr_list: AdnlAddressList,
}

/// Application callbacks, shared by every pair of a node.
#[derive(Default)]
pub(crate) struct Handlers {
    pub messages: Vec<MessageHandler>,
    pub queries: Vec<QueryHandler>,
}

/// Builder returned by [`Adnl::local_node`].
pub struct LocalNodeBuilder {
    adnl: Adnl,
    key: PrivateKey,
    reinit_date: Option<i32>,
    addr_list: Option<AdnlAddressList>,
    handlers: Handlers,
}

impl LocalNodeBuilder {
    pub(crate) fn new(adnl: Adnl, key: PrivateKey) -> Self {
        Self {
            adnl,
            key,
            reinit_date: None,
            addr_list: None,
            handlers: Handlers::default(),
        }
    }

    /// Overrides the reinit date, which defaults to the current time.
    pub fn reinit_date(mut self, date: i32) -> Self {
        self.reinit_date = Some(date);
        self
    }

    /// Sets the address list advertised to peers.
    ///
    /// By default the list holds the transport's bound address, or nothing
    /// when bound to an unspecified address.
    pub fn address_list(mut self, addr_list: AdnlAddressList) -> Self {
        self.addr_list = Some(addr_list);
        self
    }

    /// Registers a handler for custom messages.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AdnlChannel, &[u8]) + Send + Sync + 'static,
    {
        self.handlers.messages.push(Arc::new(handler));
        self
    }

    /// Registers a handler for queries.
    pub fn on_query<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AdnlChannel, super::AdnlQuery) + Send + Sync + 'static,
    {
        self.handlers.queries.push(Arc::new(handler));
        self
    }

    /// Registers the node with the transport and starts its receive loop.
    pub fn build(self) -> Result<AdnlLocalNode> {
        let now = unix_time();
        let reinit_date = self.reinit_date.unwrap_or(now);
        let addr_list = match self.addr_list {
            Some(addr_list) => addr_list,
            None => default_address_list(self.adnl.local_addr()?, now, reinit_date),
        };

        let id = AdnlIdFull::new(self.key.public_key());
        let config = self.adnl.config();
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let route = self
            .adnl
            .register(id.short_id(), RouteKind::LocalNode, queue_tx)?;
        let (incoming, _) = broadcast::channel(config.incoming_channels_capacity.max(1));

        let core = NodeCore {
            adnl: self.adnl.clone(),
            local: Arc::new(LocalIdentity {
                key: self.key,
                id,
                reinit_date,
                addr_list,
            }),
            handlers: Arc::new(self.handlers),
            peers: Arc::new(PeerTable::new()),
            incoming,
            cancel: self.adnl.cancel_token().child_token(),
        };

        debug!(id = ?route.id(), reinit_date, "local node started");
        tokio::spawn(core.clone().receive_loop(queue_rx));

        Ok(AdnlLocalNode {
            inner: Arc::new(LocalNodeInner {
                core,
                _route: route,
            }),
        })
    }
}

fn default_address_list(bound: SocketAddr, version: i32, reinit_date: i32) -> AdnlAddressList {
    let mut addr_list = if bound.ip().is_unspecified() {
        AdnlAddressList::default()
    } else {
        AdnlAddressList::from_socket_addr(bound)
    };
    addr_list.version = version;
    addr_list.reinit_date = reinit_date;
    addr_list
}

#[derive(Clone)]
struct NodeCore {
    adnl: Adnl,
    local: Arc<LocalIdentity>,
    handlers: Arc<Handlers>,
    peers: Arc<PeerTable>,
    incoming: broadcast::Sender<AdnlChannel>,
    cancel: CancellationToken,
}

impl NodeCore {
    async fn receive_loop(self, mut queue: mpsc::Receiver<Datagram>) {
        loop {
            let datagram = tokio::select! {
                _ = self.cancel.cancelled() => break,
                datagram = queue.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => break,
                },
            };
            self.handle_datagram(datagram);
        }
        debug!(id = ?self.local.id.short_id(), "local node stopped");
    }

    fn handle_datagram(&self, datagram: Datagram) {
        let plaintext = match decrypt_with(&self.local.key, &datagram.payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                trace!("cannot decrypt datagram from {}: {}", datagram.source, e);
                return;
            }
        };
        let packet = match AdnlPacket::from_bytes(&plaintext) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("bad packet from {}: {}", datagram.source, e);
                return;
            }
        };
        let Some(remote_id) = packet.sender_id() else {
            trace!("packet without sender from {}", datagram.source);
            return;
        };

        let existing = self
            .peers
            .get(&remote_id)
            .map(|entry| entry.value().clone())
            .filter(|channel| !channel.is_closed());
        let channel = match existing {
            Some(channel) => channel,
            None => {
                let Some(from) = packet.from else {
                    trace!("first packet from {:?} lacks a full id", remote_id);
                    return;
                };
                let (channel, created) =
                    self.get_or_spawn(AdnlNode::new(from, AdnlAddressList::default()));
                if created {
                    debug!(remote = ?remote_id, source = %datagram.source, "new inbound peer");
                    // nobody listening is fine
                    let _ = self.incoming.send(channel.clone());
                }
                channel
            }
        };

        channel.deliver(IncomingPacket {
            packet,
            source: datagram.source,
            via_channel: false,
        });
    }

    /// Returns the live pair for `remote`, starting one if needed.
    fn get_or_spawn(&self, remote: AdnlNode) -> (AdnlChannel, bool) {
        let id = remote.id.short_id();
        if let Some(existing) = self.peers.get(&id)
            && !existing.is_closed()
        {
            return (existing.value().clone(), false);
        }

        let channel = AdnlChannel::spawn(
            self.adnl.clone(),
            self.local.clone(),
            self.handlers.clone(),
            remote,
            Arc::downgrade(&self.peers),
            &self.cancel,
        );

        match self.peers.entry(id) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                entry.insert(channel.clone());
                (channel, true)
            }
            Entry::Occupied(entry) => {
                channel.close();
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                entry.insert(channel.clone());
                (channel, true)
            }
        }
    }
}

struct LocalNodeInner {
    core: NodeCore,
    _route: Route,
}

impl Drop for LocalNodeInner {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

/// A local identity bound to an [`Adnl`] transport.
///
/// Cheap to clone. Dropping the last handle stops the node and all its pairs.
#[derive(Clone)]
pub struct AdnlLocalNode {
    inner: Arc<LocalNodeInner>,
}

impl AdnlLocalNode {
    pub fn id(&self) -> &AdnlIdFull {
        &self.inner.core.local.id
    }

    pub fn short_id(&self) -> AdnlIdShort {
        self.inner.core.local.id.short_id()
    }

    pub fn reinit_date(&self) -> i32 {
        self.inner.core.local.reinit_date
    }

    /// The address list advertised to peers.
    pub fn address_list(&self) -> &AdnlAddressList {
        &self.inner.core.local.addr_list
    }

    /// Descriptor other nodes can pass to [`AdnlLocalNode::create_channel`].
    pub fn node(&self) -> AdnlNode {
        AdnlNode::new(*self.id(), self.address_list().clone())
    }

    /// Returns the channel to `remote`, starting the handshake if it is new.
    ///
    /// For a known peer the handle is shared with every earlier caller and
    /// `remote`'s address list is adopted if it is newer.
    pub async fn create_channel(&self, remote: AdnlNode) -> Result<AdnlChannel> {
        if self.is_closed() {
            return Err(AdnlError::ChannelClosed);
        }

        let addr_list = remote.addr_list.clone();
        let (channel, created) = self.inner.core.get_or_spawn(remote);
        if created {
            channel.enqueue(AdnlMessage::Nop).await?;
        } else {
            channel.update_address_list(addr_list).await;
        }
        Ok(channel)
    }

    /// The live channel to `remote`, if any.
    pub fn channel(&self, remote: &AdnlIdShort) -> Option<AdnlChannel> {
        self.inner
            .core
            .peers
            .get(remote)
            .map(|entry| entry.value().clone())
            .filter(|channel| !channel.is_closed())
    }

    /// All live channels.
    pub fn channels(&self) -> Vec<AdnlChannel> {
        self.inner
            .core
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|channel| !channel.is_closed())
            .collect()
    }

    /// Subscribes to channels opened by remote peers.
    ///
    /// Only pairs created after the call are reported.
    pub fn incoming_channels(&self) -> broadcast::Receiver<AdnlChannel> {
        self.inner.core.incoming.subscribe()
    }

    /// Stops the node and every pair it owns.
    pub fn shutdown(&self) {
        self.inner.core.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.core.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for AdnlLocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdnlLocalNode")
            .field("id", &self.short_id())
            .field("reinit_date", &self.reinit_date())
            .field("peers", &self.inner.core.peers.len())
            .finish()
    }
}
