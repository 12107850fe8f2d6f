//! Transport configuration.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stats::{STATS_INIT_PERIOD, STATS_PERIOD};
use crate::version::{NetworkId, PROTOCOL_VERSION_CURRENT};
use crate::wire::MAX_PACKET_SIZE;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Default gap between datagrams on the same priority lane.
pub const DEFAULT_SEND_DELAY: Duration = Duration::from_millis(50);

/// Default minimum spacing of outgoing upload stats.
pub const DEFAULT_UPLOAD_STATS_INTERVAL: Duration = Duration::from_millis(333);

pub const DEFAULT_MAX_FAILS_FOR_LIVE: u32 = 1;
pub const DEFAULT_MAX_FAILS_FOR_UNKNOWN: u32 = 3;

pub const DEFAULT_PORT: u16 = 6881;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    // ========================================================================
    // Identity
    // ========================================================================
    /// DHT network this transport joins.
    pub network: NetworkId,
    /// Highest protocol version spoken. Lower it to interoperate with a
    /// constrained network.
    pub protocol_version: u8,
    pub port: u16,

    // ========================================================================
    // Address Overrides
    // ========================================================================
    /// Local interface to bind; also taken as the external address.
    pub bind_address: Option<IpAddr>,
    /// Known external address, skipping triangulation.
    pub explicit_ip: Option<IpAddr>,

    // ========================================================================
    // Timing
    // ========================================================================
    pub request_timeout: Duration,
    pub send_delay: Duration,
    /// Minimum spacing between upload stats attached to outgoing requests.
    pub upload_stats_interval: Duration,
    pub stats_period: Duration,
    /// Uptime before reachability is trusted.
    pub stats_warmup: Duration,

    // ========================================================================
    // Contact Health
    // ========================================================================
    /// Consecutive failures before a contact that has been alive is dropped.
    pub max_fails_for_live: u32,
    /// Consecutive failures before a never-alive contact is dropped.
    pub max_fails_for_unknown: u32,

    // ========================================================================
    // Behaviour
    // ========================================================================
    /// Answer only self-lookups, stats and query-store requests.
    pub bootstrap_node: bool,
    /// Reachability assumed until the warm-up period ends.
    pub initially_reachable: bool,
    /// Last known routable percentage, seeds the running estimate.
    pub routable_percentage_seed: i32,
    pub alt_contacts_enabled: bool,
    /// Packing limit for multi-packet requests, capped at the datagram size.
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            network: NetworkId::default(),
            protocol_version: PROTOCOL_VERSION_CURRENT,
            port: DEFAULT_PORT,

            bind_address: None,
            explicit_ip: None,

            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            send_delay: DEFAULT_SEND_DELAY,
            upload_stats_interval: DEFAULT_UPLOAD_STATS_INTERVAL,
            stats_period: STATS_PERIOD,
            stats_warmup: STATS_INIT_PERIOD,

            max_fails_for_live: DEFAULT_MAX_FAILS_FOR_LIVE,
            max_fails_for_unknown: DEFAULT_MAX_FAILS_FOR_UNKNOWN,

            bootstrap_node: false,
            initially_reachable: false,
            routable_percentage_seed: 0,
            alt_contacts_enabled: true,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl TransportConfig {
    /// Protocol version clamped to what the network accepts.
    pub fn effective_version(&self) -> u8 {
        self.protocol_version.clamp(self.network.min_protocol_version(), PROTOCOL_VERSION_CURRENT)
    }

    pub fn packet_limit(&self) -> usize {
        self.max_packet_size.min(MAX_PACKET_SIZE)
    }

    /// Failure threshold for a contact, depending on whether it has ever
    /// answered.
    pub fn max_fails(&self, has_been_alive: bool) -> u32 {
        if has_been_alive {
            self.max_fails_for_live
        } else {
            self.max_fails_for_unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.protocol_version, PROTOCOL_VERSION_CURRENT);
        assert_eq!(config.upload_stats_interval, Duration::from_millis(333));
        assert_eq!(config.packet_limit(), MAX_PACKET_SIZE);
        assert_eq!(config.max_fails(true), 1);
        assert_eq!(config.max_fails(false), 3);
    }

    #[test]
    fn version_clamped_to_network() {
        let config = TransportConfig { network: NetworkId::AZ_CVS, protocol_version: 20, ..Default::default() };
        assert_eq!(config.effective_version(), 51);
    }
}
