//! Runtime configuration.

use std::time::Duration;

use crate::udp::{ADNL_MTU, PACKET_HEADER_MAX_SIZE};

/// Default rate limit: packets per second per IP address.
const DEFAULT_RATE_LIMIT_PPS: u32 = 100;

/// Encoded size of `adnl.message.confirmChannel`, the largest handshake
/// message that may share a packet with an application message.
const CONFIRM_CHANNEL_LEN: usize = 4 + 32 + 32 + 4;

/// Configuration for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum packets per second per IP address.
    pub packets_per_second: u32,
    /// Whether rate limiting is enabled.
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            packets_per_second: DEFAULT_RATE_LIMIT_PPS,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Creates a new rate limit configuration.
    pub fn new(packets_per_second: u32) -> Self {
        Self {
            packets_per_second,
            enabled: true,
        }
    }

    /// Creates a disabled rate limit configuration.
    pub fn disabled() -> Self {
        Self {
            packets_per_second: DEFAULT_RATE_LIMIT_PPS,
            enabled: false,
        }
    }
}

/// Tunables shared by a transport and every local node bound to it.
#[derive(Debug, Clone)]
pub struct AdnlConfig {
    /// Datagram payload budget used when batching messages.
    pub mtu: usize,
    /// Capacity of every per-peer and per-channel queue.
    pub queue_capacity: usize,
    /// How long a query handler may take before the query is abandoned.
    pub query_handler_timeout: Duration,
    /// How far in the future a peer's reinit date may be.
    pub max_reinit_skew: Duration,
    /// Largest message accepted through `adnl.message.part` reassembly.
    pub assembler_max_bytes: usize,
    /// Idle time after which a partial transfer is discarded.
    pub assembler_ttl: Duration,
    /// Backlog of unclaimed inbound channel announcements.
    pub incoming_channels_capacity: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for AdnlConfig {
    fn default() -> Self {
        Self {
            mtu: ADNL_MTU,
            queue_capacity: 1024,
            query_handler_timeout: Duration::from_secs(10),
            max_reinit_skew: Duration::from_secs(60),
            assembler_max_bytes: 64 * 1024,
            assembler_ttl: Duration::from_secs(10),
            incoming_channels_capacity: 64,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AdnlConfig {
    /// Sets the rate limit configuration.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Largest encoded application message that always fits in one packet,
    /// even alongside a channel confirmation.
    ///
    /// Assumes a local address list of at most six IPv4 or three IPv6
    /// addresses; see [`AdnlChannel::max_message_size`](crate::AdnlChannel::max_message_size)
    /// for the exact limit of a pair.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size_with(PACKET_HEADER_MAX_SIZE)
    }

    /// Same as [`AdnlConfig::max_message_size`] for a plaintext header of
    /// `header_size` bytes.
    pub(crate) fn max_message_size_with(&self, header_size: usize) -> usize {
        self.mtu
            .saturating_sub(header_size)
            .saturating_sub(CONFIRM_CHANNEL_LEN)
    }

    /// `max_reinit_skew` in whole seconds, as compared against wire dates.
    pub(crate) fn max_reinit_skew_secs(&self) -> i32 {
        i32::try_from(self.max_reinit_skew.as_secs()).unwrap_or(i32::MAX)
    }
}
