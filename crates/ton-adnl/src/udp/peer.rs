//! Peer pairs: the conversation between one local identity and one remote one.
//!
//! Every pair runs two tasks. The receive task validates incoming packets
//! against [`PeerState`] and dispatches their messages; the send task batches
//! queued messages into packets and decides whether they travel signed and
//! public-key encrypted, or through the encrypted channel once it is ready.
//!
//! Applications talk to a pair through [`AdnlChannel`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use ton_crypto::encryption::encrypt_for;
use ton_crypto::{PrivateKey, PublicKey, random_bytes_32};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::address::{AdnlAddressList, AdnlNode};
use crate::config::AdnlConfig;
use crate::error::{AdnlError, Result};
use crate::id::{AdnlIdFull, AdnlIdShort};

use super::assembler::MessageAssembler;
use super::channel::{ChannelContext, ChannelKeys, ChannelSender, EncryptedChannel};
use super::dispatcher::Adnl;
use super::history::PacketsHistory;
use super::node::{Handlers, LocalIdentity};
use super::packet::{AdnlPacket, CHANNEL_PACKET_HEADER_MAX_SIZE, ReinitDates, plain_header_size};
use super::{AdnlMessage, unix_time};

/// Callback for `adnl.message.custom` payloads.
pub type MessageHandler = Arc<dyn Fn(&AdnlChannel, &[u8]) + Send + Sync>;

/// Callback for `adnl.message.query`; answer through [`AdnlQuery::respond`].
pub type QueryHandler = Arc<dyn Fn(&AdnlChannel, AdnlQuery) + Send + Sync>;

/// Peer table of a local node, keyed by remote short id.
pub(crate) type PeerTable = DashMap<AdnlIdShort, AdnlChannel>;

/// A decoded packet on its way to a peer pair.
#[derive(Debug)]
pub(crate) struct IncomingPacket {
    pub packet: AdnlPacket,
    pub source: SocketAddr,
    /// Arrived through the encrypted channel rather than public-key encrypted.
    pub via_channel: bool,
}

/// Channel handshake progress as seen by the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPairState {
    /// Nothing sent yet.
    NoChannel,
    /// Our channel key was announced, no reply yet.
    ChannelPending,
    /// Both channel keys are known but the peer has not used the channel.
    ChannelConfirmed,
    /// Packets flow through the channel.
    ChannelReady,
}

/// Why an incoming packet was dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub(crate) enum PacketDrop {
    #[error("sender {0:?} does not belong to this peer pair")]
    WrongSender(AdnlIdShort),
    #[error("bad signature")]
    BadSignature,
    #[error("dst_reinit_date {dst} is ahead of our reinit date {local}")]
    FutureDstReinitDate { dst: i32, local: i32 },
    #[error("reinit_date {0} is too far in the future")]
    FutureReinitDate(i32),
    #[error("reinit_date {got} is older than {known}")]
    StaleReinitDate { got: i32, known: i32 },
    #[error("seqno {0} already seen or too old")]
    Replay(u64),
    #[error("confirm_seqno {confirm} was never sent (last {sent})")]
    UnsentConfirm { confirm: u64, sent: u64 },
}

/// Where a finished packet goes.
enum Outgoing {
    /// Public-key encrypted, fanned out to every known address.
    Plain {
        destination: AdnlIdShort,
        addrs: Vec<SocketAddr>,
        data: Vec<u8>,
    },
    /// Plaintext packet bytes, sealed by the channel relay.
    Channel {
        sender: ChannelSender,
        addr: SocketAddr,
        data: Vec<u8>,
    },
}

/// Protocol state of a peer pair. Every method is synchronous; the tasks
/// hold the lock only while calling into it.
pub(crate) struct PeerState {
    local: Arc<LocalIdentity>,
    remote: AdnlNode,
    /// The remote's address list came from the remote itself.
    remote_addr_adopted: bool,
    /// Version of our address list the peer says it has.
    peer_known_addr_version: Option<i32>,
    observed_addr: Option<SocketAddr>,
    peer_reinit_date: i32,
    sender: PacketsHistory,
    receiver: PacketsHistory,
    channel_key: PrivateKey,
    channel_date: i32,
    channel: Option<EncryptedChannel>,
    create_sent: bool,
    assembler: MessageAssembler,
    ctx: ChannelContext,
    max_reinit_skew: i32,
    mtu: usize,
}

impl PeerState {
    pub fn new(
        local: Arc<LocalIdentity>,
        remote: AdnlNode,
        ctx: ChannelContext,
        config: &AdnlConfig,
        now: i32,
    ) -> Self {
        Self {
            local,
            remote,
            remote_addr_adopted: false,
            peer_known_addr_version: None,
            observed_addr: None,
            peer_reinit_date: 0,
            sender: PacketsHistory::for_sender(),
            receiver: PacketsHistory::for_receiver(),
            channel_key: PrivateKey::generate(),
            channel_date: now,
            channel: None,
            create_sent: false,
            assembler: MessageAssembler::new(config.assembler_max_bytes, config.assembler_ttl),
            ctx,
            max_reinit_skew: config.max_reinit_skew_secs(),
            mtu: config.mtu,
        }
    }

    pub fn state(&self) -> PeerPairState {
        match &self.channel {
            None if self.create_sent => PeerPairState::ChannelPending,
            None => PeerPairState::NoChannel,
            Some(channel) if channel.is_ready() => PeerPairState::ChannelReady,
            Some(_) => PeerPairState::ChannelConfirmed,
        }
    }

    fn channel_public_key(&self) -> [u8; 32] {
        *self.channel_key.public_key().as_bytes()
    }

    /// Validates an incoming packet and applies its header.
    ///
    /// A rejected packet leaves the state untouched, except that a packet
    /// whose header proves a peer restart resets the pair before a later
    /// check fails.
    pub fn check_packet(
        &mut self,
        packet: &AdnlPacket,
        source: SocketAddr,
        via_channel: bool,
        now: i32,
    ) -> std::result::Result<(), PacketDrop> {
        let remote_id = self.remote.id.short_id();
        if let Some(sender) = packet.sender_id()
            && sender != remote_id
        {
            return Err(PacketDrop::WrongSender(sender));
        }

        if !via_channel && packet.verify(self.remote.id.public_key()).is_err() {
            return Err(PacketDrop::BadSignature);
        }

        if let Some(dates) = packet.reinit_dates {
            if dates.dst_reinit_date > self.local.reinit_date {
                return Err(PacketDrop::FutureDstReinitDate {
                    dst: dates.dst_reinit_date,
                    local: self.local.reinit_date,
                });
            }
            self.observe_reinit_date(dates.reinit_date, now)?;
        }

        let addr_list = packet
            .address
            .as_ref()
            .filter(|addr_list| self.screen_address_list(addr_list, now));

        if let Some(seqno) = packet.seqno
            && !self.receiver.deliver(seqno)
        {
            return Err(PacketDrop::Replay(seqno));
        }

        if let Some(confirm) = packet.confirm_seqno
            && confirm > self.sender.seqno()
        {
            return Err(PacketDrop::UnsentConfirm {
                confirm,
                sent: self.sender.seqno(),
            });
        }

        if let Some(addr_list) = addr_list {
            self.adopt_address_list(addr_list);
        }
        if let Some(version) = packet.recv_addr_list_version {
            self.peer_known_addr_version = Some(version);
        }
        self.observed_addr = Some(source);
        Ok(())
    }

    /// Applies a reinit date announced by the peer.
    pub fn observe_reinit_date(
        &mut self,
        date: i32,
        now: i32,
    ) -> std::result::Result<(), PacketDrop> {
        if date > now.saturating_add(self.max_reinit_skew) {
            return Err(PacketDrop::FutureReinitDate(date));
        }
        if date < self.peer_reinit_date {
            return Err(PacketDrop::StaleReinitDate {
                got: date,
                known: self.peer_reinit_date,
            });
        }
        if date > self.peer_reinit_date {
            self.reinit(date, now);
        }
        Ok(())
    }

    /// Checks the epoch of an address list sent by the peer, reinitializing
    /// the pair if the list comes from a newer one. Returns whether the list
    /// may be adopted once the rest of the packet checks out.
    fn screen_address_list(&mut self, addr_list: &AdnlAddressList, now: i32) -> bool {
        if addr_list.reinit_date > now.saturating_add(self.max_reinit_skew) {
            debug!(
                peer = ?self.remote.id.short_id(),
                reinit_date = addr_list.reinit_date,
                "ignoring address list from the future"
            );
            return false;
        }
        if addr_list.reinit_date > self.peer_reinit_date {
            self.reinit(addr_list.reinit_date, now);
        } else if addr_list.reinit_date < self.peer_reinit_date {
            trace!("ignoring address list from an older peer epoch");
            return false;
        }
        true
    }

    fn adopt_address_list(&mut self, addr_list: &AdnlAddressList) {
        if addr_list.is_newer_than(&self.remote.addr_list) {
            trace!(
                peer = ?self.remote.id.short_id(),
                version = addr_list.version,
                "adopted peer address list"
            );
            self.remote.addr_list = addr_list.clone();
        } else if *addr_list != self.remote.addr_list {
            trace!(
                version = addr_list.version,
                known = self.remote.addr_list.version,
                "ignoring outdated address list"
            );
            return;
        }
        self.remote_addr_adopted = true;
    }

    /// Starts over with a peer that restarted at `date`.
    fn reinit(&mut self, date: i32, now: i32) {
        if self.peer_reinit_date == 0 {
            self.peer_reinit_date = date;
            return;
        }

        debug!(
            peer = ?self.remote.id.short_id(),
            old = self.peer_reinit_date,
            new = date,
            "peer reinitialized"
        );
        self.peer_reinit_date = date;
        self.sender.reset();
        self.receiver.reset();
        self.channel_key = PrivateKey::generate();
        self.channel_date = now;
        self.channel = None;
        self.create_sent = false;
        self.peer_known_addr_version = None;
    }

    /// Updates the remote's address list from an out-of-band descriptor.
    pub fn update_address_list(&mut self, addr_list: AdnlAddressList) {
        if self.remote.update(addr_list) {
            self.remote_addr_adopted = false;
        }
    }

    /// Installs the channel towards `remote_key`, replacing an older one.
    fn install_channel(&mut self, remote_key: [u8; 32], date: i32, ready: bool) -> Result<()> {
        if let Some(channel) = &self.channel {
            if *channel.remote_key() == remote_key {
                if ready {
                    channel.mark_ready();
                }
                return Ok(());
            }
            if date <= channel.date() {
                return Err(AdnlError::InvalidPacket(format!(
                    "channel date {date} is not newer than {}",
                    channel.date()
                )));
            }
        }

        let secret = self.channel_key.shared_secret(&PublicKey::from_bytes(remote_key))?;
        let keys = ChannelKeys::derive(
            secret,
            &self.local.id.short_id(),
            &self.remote.id.short_id(),
        );
        // release the previous registration first, its in_id may collide
        self.channel = None;
        let channel = EncryptedChannel::open(&self.ctx, keys, remote_key, date)?;
        if ready {
            channel.mark_ready();
        }

        debug!(
            peer = ?self.remote.id.short_id(),
            in_id = ?channel.in_id(),
            out_id = ?channel.out_id(),
            date = channel.date(),
            ready,
            "channel installed"
        );
        self.channel = Some(channel);
        Ok(())
    }

    /// Handles `createChannel`; returns the confirmation to send back.
    pub fn on_create_channel(&mut self, key: [u8; 32], date: i32) -> Result<AdnlMessage> {
        self.install_channel(key, date, false)?;
        Ok(AdnlMessage::ConfirmChannel {
            key: self.channel_public_key(),
            peer_key: key,
            date: self.channel_date,
        })
    }

    /// Handles `confirmChannel` addressed to our current channel key.
    pub fn on_confirm_channel(&mut self, key: [u8; 32], peer_key: [u8; 32], date: i32) -> Result<()> {
        if peer_key != self.channel_public_key() {
            return Err(AdnlError::InvalidPacket(
                "confirmation for a channel key we no longer hold".into(),
            ));
        }
        self.install_channel(key, date, true)
    }

    fn channel_ready(&self) -> bool {
        self.channel.as_ref().is_some_and(EncryptedChannel::is_ready)
    }

    /// Picks the messages for the next packet: any handshake message, then
    /// `first`, then whatever else is queued while it fits in the MTU.
    fn collect_messages(
        &mut self,
        first: AdnlMessage,
        queue: &mut mpsc::Receiver<AdnlMessage>,
        pending: &mut Option<AdnlMessage>,
    ) -> Vec<AdnlMessage> {
        let mut messages = Vec::new();
        let mut size = if self.channel_ready() {
            CHANNEL_PACKET_HEADER_MAX_SIZE
        } else {
            plain_header_size(&self.local.addr_list)
        };

        match &self.channel {
            None => {
                messages.push(AdnlMessage::CreateChannel {
                    key: self.channel_public_key(),
                    date: self.channel_date,
                });
                self.create_sent = true;
            }
            Some(channel)
                if !channel.is_ready()
                    && !matches!(first, AdnlMessage::ConfirmChannel { .. }) =>
            {
                messages.push(AdnlMessage::ConfirmChannel {
                    key: self.channel_public_key(),
                    peer_key: *channel.remote_key(),
                    date: self.channel_date,
                });
            }
            Some(_) => {}
        }
        size += messages.iter().map(AdnlMessage::encoded_len).sum::<usize>();

        if size + first.encoded_len() > self.mtu {
            warn!(
                size = first.encoded_len(),
                "message does not fit in a packet, dropping"
            );
        } else {
            size += first.encoded_len();
            messages.push(first);
        }

        while let Ok(next) = queue.try_recv() {
            if size + next.encoded_len() > self.mtu {
                *pending = Some(next);
                break;
            }
            size += next.encoded_len();
            messages.push(next);
        }

        messages
    }

    /// Fills in the packet header for `messages`.
    fn build_packet(&mut self, messages: Vec<AdnlMessage>) -> AdnlPacket {
        let via_channel = self.channel_ready();

        let mut packet = AdnlPacket::new();
        packet.set_messages(messages);
        packet.seqno = Some(self.sender.next_seqno());
        packet.confirm_seqno = Some(self.receiver.seqno());
        packet.reinit_dates = Some(ReinitDates {
            reinit_date: self.local.reinit_date,
            dst_reinit_date: self.peer_reinit_date,
        });
        if self.remote_addr_adopted {
            packet.recv_addr_list_version = Some(self.remote.addr_list.version);
        }

        if !via_channel {
            packet.from = Some(self.local.id);
            if self.peer_known_addr_version != Some(self.local.addr_list.version) {
                packet.address = Some(self.local.addr_list.clone());
            }
            packet.sign(&self.local.key);
        }
        packet
    }

    /// Decides how `packet` leaves: through the channel or encrypted to the
    /// peer's identity key.
    fn route_packet(&self, packet: &AdnlPacket) -> Result<Outgoing> {
        if let Some(channel) = self.channel.as_ref().filter(|c| c.is_ready()) {
            let addr = self
                .observed_addr
                .or_else(|| self.remote.addr_list.socket_addrs().next())
                .ok_or_else(|| AdnlError::InvalidAddress("no address for peer".into()))?;
            return Ok(Outgoing::Channel {
                sender: channel.sender(),
                addr,
                data: packet.to_bytes(),
            });
        }

        let mut addrs: Vec<SocketAddr> = self.remote.addr_list.socket_addrs().collect();
        if let Some(observed) = self.observed_addr
            && !addrs.contains(&observed)
        {
            addrs.push(observed);
        }
        if addrs.is_empty() {
            return Err(AdnlError::InvalidAddress("no address for peer".into()));
        }

        Ok(Outgoing::Plain {
            destination: self.remote.id.short_id(),
            addrs,
            data: encrypt_for(self.remote.id.public_key(), &packet.to_bytes())?,
        })
    }

    fn close_channel(&mut self) {
        self.channel = None;
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            peer_reinit_date: self.peer_reinit_date,
            channel_key: self.channel_public_key(),
            channel: self
                .channel
                .as_ref()
                .map(|c| (*c.remote_key(), c.in_id(), c.out_id())),
            remote_addr_list: self.remote.addr_list.clone(),
        }
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PeerSnapshot {
    pub sender: PacketsHistory,
    pub receiver: PacketsHistory,
    pub peer_reinit_date: i32,
    pub channel_key: [u8; 32],
    pub channel: Option<([u8; 32], AdnlIdShort, AdnlIdShort)>,
    pub remote_addr_list: AdnlAddressList,
}

/// An inbound query handed to query handlers.
///
/// Clones share one reply slot: the first [`AdnlQuery::respond`] wins.
#[derive(Clone)]
pub struct AdnlQuery {
    query_id: [u8; 32],
    data: Arc<[u8]>,
    responder: Arc<std::sync::Mutex<Option<oneshot::Sender<Vec<u8>>>>>,
}

impl AdnlQuery {
    fn new(query_id: [u8; 32], data: Vec<u8>, responder: oneshot::Sender<Vec<u8>>) -> Self {
        Self {
            query_id,
            data: data.into(),
            responder: Arc::new(std::sync::Mutex::new(Some(responder))),
        }
    }

    pub fn query_id(&self) -> &[u8; 32] {
        &self.query_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Answers the query. Returns `false` if it was already answered or has
    /// been abandoned.
    pub fn respond(&self, answer: impl Into<Vec<u8>>) -> bool {
        let responder = match self.responder.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match responder {
            Some(responder) => responder.send(answer.into()).is_ok(),
            None => false,
        }
    }
}

/// Removes a pending query entry when the caller stops waiting.
struct PendingQuery<'a> {
    queries: &'a DashMap<[u8; 32], oneshot::Sender<Vec<u8>>>,
    query_id: [u8; 32],
}

impl Drop for PendingQuery<'_> {
    fn drop(&mut self) {
        self.queries.remove(&self.query_id);
    }
}

struct PeerShared {
    local: Arc<LocalIdentity>,
    remote: AdnlIdFull,
    adnl: Adnl,
    handlers: Arc<Handlers>,
    state: Mutex<PeerState>,
    outgoing: mpsc::Sender<AdnlMessage>,
    input: mpsc::Sender<IncomingPacket>,
    queries: DashMap<[u8; 32], oneshot::Sender<Vec<u8>>>,
    cancel: CancellationToken,
}

/// Handle to a peer pair.
///
/// Cheap to clone. Messages and queries are queued to the pair's send task,
/// which takes care of the channel handshake.
#[derive(Clone)]
pub struct AdnlChannel {
    inner: Arc<PeerShared>,
}

impl AdnlChannel {
    /// Starts the tasks of a new pair. `peers` is the table the pair removes
    /// itself from when it stops.
    pub(crate) fn spawn(
        adnl: Adnl,
        local: Arc<LocalIdentity>,
        handlers: Arc<Handlers>,
        remote: AdnlNode,
        peers: Weak<PeerTable>,
        parent: &CancellationToken,
    ) -> Self {
        let config = adnl.config().clone();
        let (input_tx, input_rx) = mpsc::channel(config.queue_capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.queue_capacity);
        let cancel = parent.child_token();
        let remote_id = remote.id;

        let ctx = ChannelContext {
            adnl: adnl.clone(),
            peer_input: input_tx.clone(),
            cancel: cancel.clone(),
        };
        let state = PeerState::new(local.clone(), remote, ctx, &config, unix_time());

        let channel = Self {
            inner: Arc::new(PeerShared {
                local,
                remote: remote_id,
                adnl,
                handlers,
                state: Mutex::new(state),
                outgoing: outgoing_tx,
                input: input_tx,
                queries: DashMap::new(),
                cancel,
            }),
        };

        debug!(
            local = ?channel.local_id(),
            remote = ?channel.remote_id(),
            "peer pair started"
        );
        tokio::spawn(channel.clone().receive_loop(input_rx, peers));
        tokio::spawn(channel.clone().send_loop(outgoing_rx));
        channel
    }

    /// Short id of the local identity.
    pub fn local_id(&self) -> AdnlIdShort {
        self.inner.local.id.short_id()
    }

    /// Short id of the remote identity.
    pub fn remote_id(&self) -> AdnlIdShort {
        self.inner.remote.short_id()
    }

    /// Full id of the remote identity.
    pub fn remote(&self) -> &AdnlIdFull {
        &self.inner.remote
    }

    /// Sends an `adnl.message.custom`.
    pub async fn send_message(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let message = AdnlMessage::Custom { data: data.into() };
        self.check_size(&message)?;
        self.enqueue(message).await
    }

    /// Sends a query and waits up to `timeout` for its answer.
    pub async fn send_query(&self, data: impl Into<Vec<u8>>, timeout: Duration) -> Result<Vec<u8>> {
        let query_id = random_bytes_32();
        let message = AdnlMessage::Query {
            query_id,
            query: data.into(),
        };
        self.check_size(&message)?;

        let (tx, rx) = oneshot::channel();
        self.inner.queries.insert(query_id, tx);
        let _pending = PendingQuery {
            queries: &self.inner.queries,
            query_id,
        };

        let exchange = async {
            self.enqueue(message).await?;
            rx.await.map_err(|_| AdnlError::ChannelClosed)
        };

        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(AdnlError::ChannelClosed),
            result = tokio::time::timeout(timeout, exchange) => {
                result.map_err(|_| AdnlError::QueryTimeout)?
            }
        }
    }

    /// Current handshake state.
    pub async fn state(&self) -> PeerPairState {
        self.inner.state.lock().await.state()
    }

    /// Reinit date last announced by the peer, 0 until it has been heard from.
    pub async fn peer_reinit_date(&self) -> i32 {
        self.inner.state.lock().await.peer_reinit_date
    }

    /// Id under which the peer receives our channel packets, once a channel
    /// is installed. Changes whenever the channel is rebuilt.
    pub async fn channel_out_id(&self) -> Option<AdnlIdShort> {
        self.inner
            .state
            .lock()
            .await
            .channel
            .as_ref()
            .map(EncryptedChannel::out_id)
    }

    /// Stops the pair. Queued messages are dropped and waiting queries fail.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn same_pair(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queues a packet from the local node's receive path; drops it when the
    /// pair is backed up.
    pub(crate) fn deliver(&self, packet: IncomingPacket) {
        if self.inner.input.try_send(packet).is_err() {
            trace!(remote = ?self.remote_id(), "peer input full, dropping packet");
        }
    }

    pub(crate) async fn update_address_list(&self, addr_list: AdnlAddressList) {
        self.inner.state.lock().await.update_address_list(addr_list);
    }

    pub(crate) async fn enqueue(&self, message: AdnlMessage) -> Result<()> {
        if self.is_closed() {
            return Err(AdnlError::ChannelClosed);
        }
        self.inner
            .outgoing
            .send(message)
            .await
            .map_err(|_| AdnlError::ChannelClosed)
    }

    /// Largest encoded message this pair accepts. Smaller than
    /// [`AdnlConfig::max_message_size`] when the local address list is long.
    pub fn max_message_size(&self) -> usize {
        self.inner
            .adnl
            .config()
            .max_message_size_with(plain_header_size(&self.inner.local.addr_list))
    }

    fn check_size(&self, message: &AdnlMessage) -> Result<()> {
        let max = self.max_message_size();
        let size = message.encoded_len();
        if size > max {
            return Err(AdnlError::MessageTooLarge { size, max });
        }
        Ok(())
    }

    async fn receive_loop(self, mut input: mpsc::Receiver<IncomingPacket>, peers: Weak<PeerTable>) {
        loop {
            let incoming = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                incoming = input.recv() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            self.handle_packet(incoming).await;
        }

        self.inner.cancel.cancel();
        self.inner.state.lock().await.close_channel();
        if let Some(peers) = peers.upgrade() {
            peers.remove_if(&self.remote_id(), |_, entry| entry.same_pair(&self));
        }
        debug!(remote = ?self.remote_id(), "peer pair stopped");
    }

    async fn handle_packet(&self, mut incoming: IncomingPacket) {
        let messages = {
            let mut state = self.inner.state.lock().await;
            if let Err(reason) = state.check_packet(
                &incoming.packet,
                incoming.source,
                incoming.via_channel,
                unix_time(),
            ) {
                debug!(
                    remote = ?self.remote_id(),
                    source = %incoming.source,
                    "dropping packet: {}",
                    reason
                );
                return;
            }
            incoming.packet.take_messages()
        };

        let mut work: VecDeque<AdnlMessage> = messages.into();
        while let Some(message) = work.pop_front() {
            if let Some(assembled) = self.handle_message(message).await {
                work.push_back(assembled);
            }
        }
    }

    /// Processes one message; returns a message completed by reassembly.
    async fn handle_message(&self, message: AdnlMessage) -> Option<AdnlMessage> {
        match message {
            AdnlMessage::CreateChannel { key, date } => {
                let confirm = self.inner.state.lock().await.on_create_channel(key, date);
                match confirm {
                    Ok(confirm) => {
                        let _ = self.enqueue(confirm).await;
                    }
                    Err(e) => debug!(remote = ?self.remote_id(), "createChannel rejected: {}", e),
                }
            }
            AdnlMessage::ConfirmChannel {
                key,
                peer_key,
                date,
            } => {
                let result = self
                    .inner
                    .state
                    .lock()
                    .await
                    .on_confirm_channel(key, peer_key, date);
                if let Err(e) = result {
                    debug!(remote = ?self.remote_id(), "confirmChannel rejected: {}", e);
                }
            }
            AdnlMessage::Custom { data } => {
                for handler in &self.inner.handlers.messages {
                    handler(self, &data);
                }
            }
            AdnlMessage::Query { query_id, query } => self.spawn_query(query_id, query),
            AdnlMessage::Answer { query_id, answer } => {
                match self.inner.queries.remove(&query_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(answer);
                    }
                    None => trace!("answer for unknown query {}", hex::encode(query_id)),
                }
            }
            AdnlMessage::Reinit { date } => {
                let result = self
                    .inner
                    .state
                    .lock()
                    .await
                    .observe_reinit_date(date, unix_time());
                if let Err(reason) = result {
                    debug!(remote = ?self.remote_id(), "reinit ignored: {}", reason);
                }
            }
            AdnlMessage::Nop => {}
            AdnlMessage::Part {
                hash,
                total_size,
                offset,
                data,
            } => {
                return self
                    .inner
                    .state
                    .lock()
                    .await
                    .assembler
                    .accept(hash, total_size, offset, &data);
            }
        }
        None
    }

    /// Runs the query handlers off the receive task and queues the answer.
    fn spawn_query(&self, query_id: [u8; 32], data: Vec<u8>) {
        if self.inner.handlers.queries.is_empty() {
            trace!("no query handlers, ignoring query");
            return;
        }

        let channel = self.clone();
        let timeout = self.inner.adnl.config().query_handler_timeout;
        tokio::spawn(async move {
            let (tx, rx) = oneshot::channel();
            let query = AdnlQuery::new(query_id, data, tx);
            for handler in &channel.inner.handlers.queries {
                handler(&channel, query.clone());
            }
            drop(query);

            let answer = tokio::select! {
                _ = channel.inner.cancel.cancelled() => return,
                answer = tokio::time::timeout(timeout, rx) => match answer {
                    Ok(Ok(answer)) => answer,
                    Ok(Err(_)) => {
                        trace!("query dropped without an answer");
                        return;
                    }
                    Err(_) => {
                        debug!(remote = ?channel.remote_id(), "query handler timed out");
                        return;
                    }
                },
            };

            let answer = AdnlMessage::Answer { query_id, answer };
            if let Err(e) = channel.check_size(&answer) {
                warn!(remote = ?channel.remote_id(), "cannot send answer: {}", e);
                return;
            }
            let _ = channel.enqueue(answer).await;
        });
    }

    async fn send_loop(self, mut queue: mpsc::Receiver<AdnlMessage>) {
        let mut pending = None;
        loop {
            let first = match pending.take() {
                Some(message) => message,
                None => tokio::select! {
                    _ = self.inner.cancel.cancelled() => break,
                    message = queue.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                },
            };

            let outgoing = {
                let mut state = self.inner.state.lock().await;
                let messages = state.collect_messages(first, &mut queue, &mut pending);
                if messages.is_empty() {
                    continue;
                }
                let packet = state.build_packet(messages);
                state.route_packet(&packet)
            };

            match outgoing {
                Ok(outgoing) => self.transmit(outgoing).await,
                Err(e) => warn!(remote = ?self.remote_id(), "cannot send packet: {}", e),
            }
        }
    }

    async fn transmit(&self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Channel { sender, addr, data } => {
                if let Err(e) = sender.send(data, addr).await {
                    warn!(remote = ?self.remote_id(), "channel send failed: {}", e);
                }
            }
            Outgoing::Plain {
                destination,
                addrs,
                data,
            } => {
                let data: Arc<[u8]> = data.into();
                let mut sends = JoinSet::new();
                for addr in addrs {
                    let adnl = self.inner.adnl.clone();
                    let data = data.clone();
                    sends.spawn(async move {
                        adnl.send_datagram(&destination, addr, &data)
                            .await
                            .map_err(|e| (addr, e))
                    });
                }
                while let Some(result) = sends.join_next().await {
                    if let Ok(Err((addr, e))) = result {
                        warn!("Failed to send packet to {}: {}", addr, e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for AdnlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdnlChannel")
            .field("local", &self.local_id())
            .field("remote", &self.remote_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
