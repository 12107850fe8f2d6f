//! Traits at the transport's seams.
//!
//! The transport owns framing, correlation and contact bookkeeping. Everything
//! above it (routing table, value store) and everything below it (the socket,
//! address filters, address discovery) is reached through the traits here.
//!
//! | Direction | Trait | Purpose |
//! |-----------|-------|---------|
//! | below | [`DatagramChannel`] | send/receive datagrams with a priority |
//! | above | [`RequestHandler`] | answer inbound requests |
//! | above | [`TransportListener`] | local contact and reachability events |
//! | side | [`IpFilter`] | external address block list |
//! | side | [`PublicAddressSource`] | platform view of the public address |
//! | side | [`AltContactProvider`] | local contacts on another network |
//! | side | [`UploadStatsSource`] | upload stats to piggyback on requests |

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

use crate::altnet::{AltNetworkType, AlternativeContact};
use crate::identity::Contact;
use crate::messages::DataPacket;
use crate::wire::{FullStats, TransportValue, UploadStats};

/// Send priority, highest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Immediate,
    High,
    Medium,
    Low,
}

// ============================================================================
// Below
// ============================================================================

/// Unreliable datagram channel shared with a co-hosted protocol.
#[async_trait]
pub trait DatagramChannel: Send + Sync + 'static {
    async fn send_to(&self, datagram: Vec<u8>, to: SocketAddr, priority: Priority) -> io::Result<()>;

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

// ============================================================================
// Above
// ============================================================================

/// Outcome of a find-value lookup on the responding node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueResult {
    Values { values: Vec<TransportValue>, diversification: u8 },
    Contacts(Vec<Contact>),
    /// The key is blocked; the proof goes back to the requester.
    Blocked { request: Vec<u8>, signature: Vec<u8> },
}

/// Outcome of a store on the responding node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreResult {
    /// One diversification type per stored key.
    Stored(Vec<u8>),
    Blocked { request: Vec<u8>, signature: Vec<u8> },
}

/// Answer to a query-store request: one entry per queried suffix, `None`
/// where the responder holds nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryStoreResult {
    pub header_size: u8,
    pub entries: Vec<Option<Vec<u8>>>,
}

/// Routing-layer callbacks for inbound requests.
///
/// Calls that return data run inside the inbound task of the request; heavy
/// work belongs on the handler's own tasks.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// A contact came alive (first request or reply seen from it).
    fn contact_imported(&self, contact: &Contact, is_bootstrap: bool);

    /// A contact exceeded its failure threshold.
    fn contact_removed(&self, contact: &Contact);

    async fn ping_request(&self, from: &Contact);

    async fn find_node_request(&self, from: &Contact, id: &[u8]) -> Vec<Contact>;

    async fn find_value_request(&self, from: &Contact, key: &[u8], max_values: u8, flags: u8) -> FindValueResult;

    async fn store_request(
        &self,
        from: &Contact,
        keys: &[Vec<u8>],
        value_sets: &[Vec<TransportValue>],
    ) -> StoreResult;

    async fn query_store_request(
        &self,
        from: &Contact,
        header_length: u8,
        keys: &[(Vec<u8>, Vec<Vec<u8>>)],
    ) -> QueryStoreResult;

    /// Returns false when the block request was refused.
    async fn key_block_request(&self, from: &Contact, request: &[u8], signature: &[u8]) -> bool;

    async fn stats_request(&self, from: &Contact) -> FullStats;

    /// One-way transfer-protocol packet.
    fn data_request(&self, from: &Contact, packet: DataPacket);

    /// Upload stats reported by a peer.
    fn upload_stats(&self, _from: &Contact, _stats: UploadStats) {}

    /// Current estimate of the DHT's size, echoed in find-node traffic.
    fn estimated_dht_size(&self) -> u32 {
        0
    }

    /// A peer's estimate of the DHT's size.
    fn set_estimated_dht_size(&self, _size: u32) {}
}

/// Local contact and reachability events.
pub trait TransportListener: Send + Sync + 'static {
    fn local_contact_changed(&self, _local: &Contact) {}

    fn current_address(&self, _address: IpAddr) {}

    fn reachability_changed(&self, _reachable: bool) {}

    fn reset_network_positions(&self) {}
}

// ============================================================================
// Side
// ============================================================================

pub trait IpFilter: Send + Sync + 'static {
    fn is_enabled(&self) -> bool;

    fn is_blocked(&self, ip: &IpAddr) -> bool;
}

/// Platform knowledge of the public address (port mapping, interface scan).
#[async_trait]
pub trait PublicAddressSource: Send + Sync + 'static {
    async fn public_address(&self, ipv6: bool) -> Option<IpAddr>;
}

pub trait AltContactProvider: Send + Sync + 'static {
    fn network(&self) -> AltNetworkType;

    /// Up to `max` contacts, most recently alive first.
    fn contacts(&self, max: usize) -> Vec<AlternativeContact>;
}

pub trait UploadStatsSource: Send + Sync + 'static {
    fn upload_stats(&self) -> Option<UploadStats>;
}
