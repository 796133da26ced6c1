//! The UDP transport shared by local nodes and channels.
//!
//! [`Adnl`] owns the socket and a single receive loop. Every datagram starts
//! with the 32-byte id of its destination: either a local node's short id or
//! the inbound id of an encrypted channel. Both live in one routing table, so
//! an id can never be claimed twice. The prefix is stripped and the rest is
//! queued for whoever registered the id; unknown destinations are dropped.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use ton_crypto::PrivateKey;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{AdnlConfig, RateLimitConfig};
use crate::error::{AdnlError, Result};
use crate::id::AdnlIdShort;

use super::node::LocalNodeBuilder;

/// Largest datagram the receive loop can take in.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Length of the destination id prefix.
const DESTINATION_LEN: usize = 32;

/// Type alias for the keyed rate limiter (by IP address).
type KeyedRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// A datagram with its destination prefix removed.
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    pub source: SocketAddr,
    pub payload: Vec<u8>,
}

/// What a routing table entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteKind {
    LocalNode,
    Channel,
}

struct RouteEntry {
    kind: RouteKind,
    queue: mpsc::Sender<Datagram>,
}

type RouteTable = DashMap<AdnlIdShort, RouteEntry>;

/// Registration of an id in the routing table, removed on drop.
pub(crate) struct Route {
    table: Weak<RouteTable>,
    id: AdnlIdShort,
    queue: mpsc::Sender<Datagram>,
}

impl Route {
    pub fn id(&self) -> AdnlIdShort {
        self.id
    }
}

impl Drop for Route {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            // only our own entry; the id may have been claimed again since
            table.remove_if(&self.id, |_, entry| entry.queue.same_channel(&self.queue));
        }
    }
}

struct AdnlInner {
    socket: Arc<UdpSocket>,
    config: AdnlConfig,
    routes: Arc<RouteTable>,
    rate_limiter: Option<Arc<KeyedRateLimiter>>,
    cancel: CancellationToken,
}

impl Drop for AdnlInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// An ADNL transport bound to one UDP socket.
///
/// Cheap to clone. Local nodes and their peer pairs hold clones too, so the
/// receive loop runs until [`Adnl::shutdown`] is called.
#[derive(Clone)]
pub struct Adnl {
    inner: Arc<AdnlInner>,
}

impl Adnl {
    /// Binds a transport with the default configuration.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, AdnlConfig::default()).await
    }

    /// Binds a transport with a custom configuration.
    pub async fn bind_with_config(addr: SocketAddr, config: AdnlConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(AdnlError::Io)?;
        Ok(Self::from_socket(socket, config))
    }

    /// Wraps an already bound socket and starts the receive loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_socket(socket: UdpSocket, config: AdnlConfig) -> Self {
        let socket = Arc::new(socket);
        let routes = Arc::new(RouteTable::new());
        let rate_limiter = create_rate_limiter(&config.rate_limit).map(Arc::new);
        let cancel = CancellationToken::new();

        if let Ok(addr) = socket.local_addr() {
            debug!("ADNL transport listening on {}", addr);
        }

        tokio::spawn(receive_loop(
            socket.clone(),
            routes.clone(),
            rate_limiter.clone(),
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(AdnlInner {
                socket,
                config,
                routes,
                rate_limiter,
                cancel,
            }),
        }
    }

    /// Returns the local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.socket.local_addr().map_err(AdnlError::Io)
    }

    pub fn config(&self) -> &AdnlConfig {
        &self.inner.config
    }

    /// Starts building a local node that owns `key`.
    pub fn local_node(&self, key: PrivateKey) -> LocalNodeBuilder {
        LocalNodeBuilder::new(self.clone(), key)
    }

    /// Stops the receive loop and every node and channel bound to it.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Checks if a packet from the given IP address should be rate limited.
    ///
    /// Returns `true` if the packet is allowed, `false` if it should be dropped.
    pub fn check_rate_limit(&self, ip: &IpAddr) -> bool {
        check_rate_limit(self.inner.rate_limiter.as_deref(), ip)
    }

    /// Root cancellation token; nodes and channels hang child tokens off it.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Claims `id` and returns the guard that releases it.
    pub(crate) fn register(
        &self,
        id: AdnlIdShort,
        kind: RouteKind,
        queue: mpsc::Sender<Datagram>,
    ) -> Result<Route> {
        match self.inner.routes.entry(id) {
            Entry::Occupied(existing) => Err(AdnlError::IdCollision(format!(
                "{} already routes to a {:?}",
                id,
                existing.get().kind
            ))),
            Entry::Vacant(slot) => {
                slot.insert(RouteEntry {
                    kind,
                    queue: queue.clone(),
                });
                trace!(%id, ?kind, "route registered");
                Ok(Route {
                    table: Arc::downgrade(&self.inner.routes),
                    id,
                    queue,
                })
            }
        }
    }

    /// Sends `payload` to `addr`, prefixed with the destination id.
    pub(crate) async fn send_datagram(
        &self,
        destination: &AdnlIdShort,
        addr: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        let mut datagram = Vec::with_capacity(DESTINATION_LEN + payload.len());
        datagram.extend_from_slice(destination.as_bytes());
        datagram.extend_from_slice(payload);

        self.inner
            .socket
            .send_to(&datagram, addr)
            .await
            .map_err(AdnlError::Io)?;
        trace!("Sent {} bytes to {} via {:?}", datagram.len(), addr, destination);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn route_kind(&self, id: &AdnlIdShort) -> Option<RouteKind> {
        self.inner.routes.get(id).map(|entry| entry.kind)
    }
}

/// Creates a keyed rate limiter; `None` when disabled or set to zero.
fn create_rate_limiter(config: &RateLimitConfig) -> Option<KeyedRateLimiter> {
    if !config.enabled {
        return None;
    }
    NonZeroU32::new(config.packets_per_second).map(|pps| RateLimiter::keyed(Quota::per_second(pps)))
}

fn check_rate_limit(limiter: Option<&KeyedRateLimiter>, ip: &IpAddr) -> bool {
    match limiter {
        Some(limiter) => limiter.check_key(ip).is_ok(),
        None => true,
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    routes: Arc<RouteTable>,
    rate_limiter: Option<Arc<KeyedRateLimiter>>,
    cancel: CancellationToken,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, source) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP receive error: {}", e);
                    continue;
                }
            },
        };

        if !check_rate_limit(rate_limiter.as_deref(), &source.ip()) {
            trace!("Rate limited packet from {}, dropping", source);
            continue;
        }

        if len < DESTINATION_LEN {
            trace!("Runt datagram of {} bytes from {}", len, source);
            continue;
        }

        let Ok(destination) = AdnlIdShort::from_slice(&buffer[..DESTINATION_LEN]) else {
            continue;
        };
        let Some(queue) = routes.get(&destination).map(|entry| entry.queue.clone()) else {
            trace!("Unknown destination {:?} from {}", destination, source);
            continue;
        };

        let datagram = Datagram {
            source,
            payload: buffer[DESTINATION_LEN..len].to_vec(),
        };
        match queue.try_send(datagram) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("Queue for {:?} is full, dropping datagram", destination);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Queue for {:?} is closed", destination);
            }
        }
    }

    debug!("ADNL receive loop stopped");
}
