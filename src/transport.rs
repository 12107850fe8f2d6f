//! # DHT Transport
//!
//! Ties the pieces together: one receive loop reading the datagram channel,
//! inbound request dispatch to the [`RequestHandler`], reply matching for
//! outbound RPCs (see [`crate::rpc`]), and a periodic stats tick.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//! datagrams ─────►│ receive loop │──── foreign ───► foreign sink
//!                 └──────┬───────┘
//!              ┌─────────┴─────────┐
//!              ▼                   ▼
//!          requests             replies
//!     (task per request)    (pending table)
//!              │                   │
//!              ▼                   ▼
//!       RequestHandler        RPC futures
//! ```
//!
//! [`DhtTransport`] is a cheap handle over shared state. Locks guard short
//! synchronous sections only and are never held across `.await`.
//!
//! ## Inbound Rules
//!
//! | Request | Bootstrap node | Reply |
//! |---------|----------------|-------|
//! | ping | ignored | positions, alternate contacts |
//! | find-node | only lookups of the sender's own ID | contacts, status, size |
//! | find-value | ignored | values (split) or contacts |
//! | store | ignored | diversifications |
//! | key-block | ignored | empty |
//! | query-store | served | presence entries |
//! | stats | served | full or opaque stats |
//! | data | ignored | none |
//!
//! A sender whose claimed address does not derive its ID is told where it was
//! seen (unless this is a bootstrap node, which serves it anyway under the
//! observed address).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::altnet::{AltNetworkRegistry, AltNetworkType, AltNetworks, AlternativeContact};
use crate::config::TransportConfig;
use crate::filter::AddressGuard;
use crate::identity::{now_ms, Contact, NodeIdCache, NodeStatus};
use crate::lock;
use crate::messages::{
    classify, decode, DatagramKind, ErrorReply, FindValueReply, Packet, Reply, ReplyBody, ReplyHeader, Request,
    RequestBody, StatsReply, STATS_TYPE_NP_VER2, STATS_TYPE_ORIGINAL,
};
use crate::nat::AddressTracker;
use crate::netpos::NetworkPositionManager;
use crate::protocols::{
    AltContactProvider, DatagramChannel, FindValueResult, IpFilter, Priority, PublicAddressSource, RequestHandler,
    StoreResult, TransportListener, UploadStatsSource,
};
use crate::rpc::{value_wire_size, PendingTable};
use crate::stats::{
    ContactHistory, ReachabilityTracker, RecentDestinations, RecentReports, RoutableTracker, RpcKind, StatsSnapshot,
    TransportStats, CONTACT_HISTORY_MAX, RECENT_REPORTS_HISTORY_MAX, ROUTABLE_CONTACT_HISTORY_MAX,
};
use crate::version::{
    PROTOCOL_VERSION_ALT_CONTACTS, PROTOCOL_VERSION_BLOCK_KEYS, PROTOCOL_VERSION_MORE_NODE_STATUS,
    PROTOCOL_VERSION_XFER_STATUS, VENDOR_ID_SELF,
};
use crate::wire::{ContactInfo, DecodeError, EncodeError, Reader, TransportValue, Writer, MAX_PACKET_SIZE};

/// Foreign datagrams queued for the co-hosted protocol before dropping.
pub const FOREIGN_SINK_CAPACITY: usize = 256;

// ============================================================================
// Shared State
// ============================================================================

/// Histories and trackers updated together under one lock.
pub(crate) struct TransportState {
    pub contact_history: ContactHistory,
    pub routable_history: ContactHistory,
    pub recent_reports: RecentReports,
    pub reachability: ReachabilityTracker,
    pub routable: RoutableTracker,
    pub recent_destinations: RecentDestinations,
}

pub(crate) struct TransportInner {
    pub(crate) config: TransportConfig,
    /// Protocol version spoken, clamped to the network.
    pub(crate) version: u8,
    pub(crate) channel: Arc<dyn DatagramChannel>,
    pub(crate) handler: Arc<dyn RequestHandler>,
    listeners: Mutex<Vec<Arc<dyn TransportListener>>>,
    pub(crate) ids: NodeIdCache,
    pub(crate) guard: AddressGuard,
    pub(crate) stats: TransportStats,
    pub(crate) netpos: NetworkPositionManager,
    pub(crate) pending: PendingTable,
    pub(crate) local: Mutex<Contact>,
    pub(crate) state: Mutex<TransportState>,
    pub(crate) address: Mutex<AddressTracker>,
    pub(crate) address_changing: AtomicBool,
    pub(crate) alt: Arc<AltNetworks>,
    registry: Option<Arc<AltNetworkRegistry>>,
    local_provider: Mutex<Option<Arc<dyn AltContactProvider>>>,
    pub(crate) public_address: Option<Arc<dyn PublicAddressSource>>,
    pub(crate) upload_stats_source: Option<Arc<dyn UploadStatsSource>>,
    pub(crate) last_upload_stats: Mutex<Option<Instant>>,
    foreign_sink: Mutex<Option<mpsc::Sender<(Vec<u8>, SocketAddr)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) next_transaction: AtomicU32,
}

impl TransportInner {
    pub(crate) fn local_contact(&self) -> Contact {
        lock(&self.local).clone()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn TransportListener>> {
        lock(&self.listeners).clone()
    }

    pub(crate) fn is_ipv6(&self) -> bool {
        self.channel.local_addr().map(|a| a.is_ipv6()).unwrap_or(false) || self.config.network.is_ipv6()
    }

    /// Status we advertise in find-node traffic.
    pub(crate) fn node_status(&self) -> NodeStatus {
        if self.config.bootstrap_node {
            return NodeStatus::NONE;
        }
        let state = lock(&self.state);
        if !state.reachability.is_accurate() {
            NodeStatus::UNKNOWN
        } else if state.reachability.is_reachable() {
            NodeStatus::ROUTABLE
        } else {
            NodeStatus::NONE
        }
    }

    /// Record a contact's self-reported status. Incoming reports also feed
    /// the routable percentage.
    pub(crate) fn update_contact_status(&self, contact: &Contact, status: NodeStatus, incoming: bool) {
        contact.set_node_status(status);
        if contact.protocol_version() < PROTOCOL_VERSION_XFER_STATUS || status == NodeStatus::UNKNOWN {
            return;
        }
        let mut state = lock(&self.state);
        if status.is_routable() {
            if incoming {
                state.routable.record(true);
            }
            state.routable_history.insert(contact.clone());
        } else if incoming {
            state.routable.record(false);
        }
    }

    pub(crate) fn contact_alive(&self, contact: &Contact) {
        contact.mark_alive();
        lock(&self.state).contact_history.insert(contact.clone());
    }

    pub(crate) fn remove_contact(&self, contact: &Contact) {
        {
            let mut state = lock(&self.state);
            state.contact_history.remove(&contact.transport_addr());
            state.routable_history.remove(&contact.transport_addr());
        }
        self.handler.contact_removed(contact);
    }

    fn import(&self, contact: Contact, is_bootstrap: bool) -> Contact {
        {
            let mut state = lock(&self.state);
            if state.contact_history.len() < CONTACT_HISTORY_MAX {
                state.contact_history.insert(contact.clone());
            }
        }
        self.handler.contact_imported(&contact, is_bootstrap);
        contact
    }

    // ------------------------------------------------------------------------
    // Receive Loop
    // ------------------------------------------------------------------------

    fn on_datagram(self: &Arc<Self>, datagram: Vec<u8>, from: SocketAddr) {
        if classify(&datagram) == DatagramKind::Foreign {
            if let Some(tx) = lock(&self.foreign_sink).as_ref() {
                if tx.try_send((datagram, from)).is_err() {
                    trace!(from = %from, "foreign sink full, dropping datagram");
                }
            }
            return;
        }
        self.stats.packet_received(datagram.len());

        match decode(&datagram) {
            Ok(Packet::Request(request)) => {
                if request.header.network != self.config.network {
                    trace!(from = %from, network = %request.header.network, "request for another network");
                    return;
                }
                let alien = lock(&self.state).recent_destinations.is_alien(&from);
                let received_at = Instant::now();
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.process_request(from, request, alien, received_at).await });
            }
            Ok(Packet::Reply(reply)) => self.on_reply(from, reply),
            Err(e) => debug!(from = %from, error = %e, "dropping undecodable datagram"),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound Requests
    // ------------------------------------------------------------------------

    async fn process_request(self: Arc<Self>, from: SocketAddr, request: Request, alien: bool, received_at: Instant) {
        self.stats.request_received(request_kind(&request.body), alien);

        let header = &request.header;
        let skew = now_ms() - header.originator_time;
        self.stats.record_skew(skew);
        let mut contact = Contact::new(
            &self.ids,
            from,
            header.originator_address,
            header.originator_version,
            header.originator_instance_id,
            skew,
        );
        contact.set_generic_flags(header.flags, header.flags2);

        if let Err(e) = self.guard.check(&from) {
            trace!(from = %from, error = %e, "request from filtered address");
            return;
        }

        let bad_originator = !contact.address_matches_id();
        let bootstrap = self.config.bootstrap_node;
        if bad_originator && !bootstrap {
            let first = lock(&self.state).recent_reports.first_report(&contact.to_string());
            if first {
                debug!(contact = %contact, claimed = %header.originator_address, "node has incorrect ID, reporting it");
            }
            let body = ReplyBody::Error(ErrorReply::OriginatorAddressWrong(from));
            self.send_reply(from, &request, received_at, body).await;
            return;
        }
        if bad_originator {
            contact = Contact::new(
                &self.ids,
                from,
                from,
                header.originator_version,
                header.originator_instance_id,
                skew,
            );
            contact.set_generic_flags(header.flags, header.flags2);
        } else {
            self.contact_alive(&contact);
        }

        let replies = self.dispatch_request(&contact, &request, bad_originator).await;
        for body in replies {
            self.send_reply(from, &request, received_at, body).await;
        }
    }

    /// Reply bodies for a request, in send order. Empty for requests that
    /// get no answer.
    async fn dispatch_request(&self, contact: &Contact, request: &Request, bad_originator: bool) -> Vec<ReplyBody> {
        let bootstrap = self.config.bootstrap_node;
        match &request.body {
            RequestBody::Ping { alt_request, upload_stats } => {
                if bootstrap {
                    return Vec::new();
                }
                self.handler.ping_request(contact).await;
                self.receive_upload_stats(contact, upload_stats.as_ref());
                let alt_contacts = if self.config.alt_contacts_enabled && !alt_request.is_empty() {
                    self.alt.build_reply(alt_request)
                } else {
                    Vec::new()
                };
                vec![ReplyBody::Ping {
                    network_positions: self.netpos.local_positions(),
                    alt_contacts,
                    upload_stats: self.outgoing_upload_stats(),
                }]
            }

            RequestBody::KeyBlock { random_id, request: block, signature } => {
                if bootstrap {
                    return Vec::new();
                }
                contact.set_random_id(*random_id);
                self.handler.key_block_request(contact, block, signature).await;
                vec![ReplyBody::KeyBlock]
            }

            RequestBody::Stats { stats_type } => match *stats_type {
                STATS_TYPE_ORIGINAL => {
                    let mut full = self.handler.stats_request(contact).await;
                    self.stats.fill_full_stats(&mut full);
                    vec![ReplyBody::Stats(StatsReply::Full(full))]
                }
                STATS_TYPE_NP_VER2 => vec![ReplyBody::Stats(StatsReply::Opaque {
                    stats_type: STATS_TYPE_NP_VER2,
                    data: self.netpos.local().encode().data,
                })],
                other => {
                    trace!(contact = %contact, stats_type = other, "unsupported stats type");
                    Vec::new()
                }
            },

            RequestBody::Store { random_id, keys, value_sets } => {
                if bootstrap {
                    return Vec::new();
                }
                contact.set_random_id(*random_id);
                let value_sets = adjust_created(value_sets, contact.skew());
                match self.handler.store_request(contact, keys, &value_sets).await {
                    StoreResult::Blocked { request: block, signature } => {
                        if contact.protocol_version() >= PROTOCOL_VERSION_BLOCK_KEYS {
                            vec![ReplyBody::Error(ErrorReply::KeyBlocked { request: block, signature })]
                        } else {
                            vec![ReplyBody::Store { diversifications: vec![0; keys.len()] }]
                        }
                    }
                    StoreResult::Stored(diversifications) => vec![ReplyBody::Store { diversifications }],
                }
            }

            RequestBody::QueryStore { header_length, keys } => {
                let result = self.handler.query_store_request(contact, *header_length, keys).await;
                vec![ReplyBody::QueryStore {
                    random_id: contact.random_id(),
                    header_size: result.header_size,
                    entries: result.entries,
                }]
            }

            RequestBody::FindNode { id, node_status, estimated_dht_size, upload_stats } => {
                // A bootstrap node answers only lookups that help the sender
                // learn its own ID.
                let acceptable = !bootstrap || bad_originator || id.as_slice() == contact.id().as_bytes();
                if !acceptable {
                    return Vec::new();
                }
                if request.header.protocol_version >= PROTOCOL_VERSION_MORE_NODE_STATUS {
                    self.update_contact_status(contact, NodeStatus(*node_status), true);
                    self.handler.set_estimated_dht_size(*estimated_dht_size);
                }
                self.receive_upload_stats(contact, upload_stats.as_ref());
                let contacts = self.handler.find_node_request(contact, id).await;
                vec![ReplyBody::FindNode {
                    random_id: contact.random_id(),
                    node_status: self.node_status().0,
                    estimated_dht_size: self.handler.estimated_dht_size(),
                    network_positions: self.netpos.local_positions(),
                    contacts: contacts.iter().map(Contact::info).collect(),
                    upload_stats: self.outgoing_upload_stats(),
                }]
            }

            RequestBody::FindValue { key, flags, max_values } => {
                if bootstrap {
                    return Vec::new();
                }
                let positions = self.netpos.local_positions();
                match self.handler.find_value_request(contact, key, *max_values, *flags).await {
                    FindValueResult::Blocked { request: block, signature } => {
                        if contact.protocol_version() >= PROTOCOL_VERSION_BLOCK_KEYS {
                            vec![ReplyBody::Error(ErrorReply::KeyBlocked { request: block, signature })]
                        } else {
                            vec![ReplyBody::FindValue {
                                has_continuation: false,
                                result: FindValueReply::Values { values: Vec::new(), diversification: 0 },
                                network_positions: positions,
                            }]
                        }
                    }
                    FindValueResult::Values { values, diversification } => {
                        let space = self.find_value_space(request, &positions);
                        let chunks = split_values(values, space);
                        let last = chunks.len().saturating_sub(1);
                        chunks
                            .into_iter()
                            .enumerate()
                            .map(|(i, values)| ReplyBody::FindValue {
                                has_continuation: i < last,
                                result: FindValueReply::Values { values, diversification },
                                network_positions: positions.clone(),
                            })
                            .collect()
                    }
                    FindValueResult::Contacts(contacts) => vec![ReplyBody::FindValue {
                        has_continuation: false,
                        result: FindValueReply::Contacts(contacts.iter().map(Contact::info).collect()),
                        network_positions: positions,
                    }],
                }
            }

            RequestBody::Data(packet) => {
                if !bootstrap {
                    self.handler.data_request(contact, packet.clone());
                }
                Vec::new()
            }
        }
    }

    fn reply_header(&self, request: &Request, received_at: Instant) -> ReplyHeader {
        let local = self.local_contact();
        ReplyHeader {
            transaction_id: request.header.transaction_id,
            connection_id: request.header.connection_id,
            protocol_version: self.version.min(request.header.originator_version),
            vendor_id: VENDOR_ID_SELF,
            network: self.config.network,
            target_instance_id: local.instance_id(),
            flags: local.generic_flags(),
            flags2: 0,
            processing_time: received_at.elapsed().as_millis().min(u16::MAX as u128) as u16,
        }
    }

    async fn send_reply(&self, to: SocketAddr, request: &Request, received_at: Instant, body: ReplyBody) {
        let reply = Reply { header: self.reply_header(request, received_at), body };
        let datagram = match Packet::Reply(reply).encode() {
            Ok(d) => d,
            Err(e) => {
                warn!(to = %to, error = %e, "failed to encode reply");
                return;
            }
        };
        let len = datagram.len();
        match self.channel.send_to(datagram, to, Priority::High).await {
            Ok(()) => self.stats.packet_sent(len),
            Err(e) => debug!(to = %to, error = %e, "reply send failed"),
        }
    }

    /// Payload bytes available for values in one find-value reply.
    fn find_value_space(&self, request: &Request, positions: &[crate::wire::NetworkPosition]) -> usize {
        let empty = Reply {
            header: self.reply_header(request, Instant::now()),
            body: ReplyBody::FindValue {
                has_continuation: true,
                result: FindValueReply::Values { values: Vec::new(), diversification: 0 },
                network_positions: positions.to_vec(),
            },
        };
        let base = Packet::Reply(empty).encode().map(|d| d.len()).unwrap_or(MAX_PACKET_SIZE);
        self.config.packet_limit().saturating_sub(base)
    }

    // ------------------------------------------------------------------------
    // Stats Tick
    // ------------------------------------------------------------------------

    fn stats_tick(self: &Arc<Self>) {
        let (aliens, alien_fvs) = self.stats.aliens();
        let (flip, routable_pct) = {
            let mut state = lock(&self.state);
            let flip = state.reachability.tick(aliens, alien_fvs);
            (flip, state.routable.percentage())
        };
        if let Some(reachable) = flip {
            info!(reachable, "reachability changed");
            for listener in self.listeners() {
                listener.reachability_changed(reachable);
            }
        }
        trace!(routable_pct, aliens, alien_fvs, "stats tick");

        if self.config.alt_contacts_enabled && self.alt.total_required() > 0 {
            let target = {
                let state = lock(&self.state);
                let candidates: Vec<Contact> = state
                    .routable_history
                    .contacts()
                    .into_iter()
                    .filter(|c| c.protocol_version() >= PROTOCOL_VERSION_ALT_CONTACTS)
                    .collect();
                candidates.choose(&mut rand::thread_rng()).cloned()
            };
            if let Some(contact) = target {
                let transport = DhtTransport { inner: Arc::clone(self) };
                tokio::spawn(async move {
                    if let Err(e) = transport.ping(&contact).await {
                        trace!(contact = %contact, error = %e, "alternate contact ping failed");
                    }
                });
            }
        }
    }
}

fn request_kind(body: &RequestBody) -> RpcKind {
    match body {
        RequestBody::Ping { .. } => RpcKind::Ping,
        RequestBody::Store { .. } => RpcKind::Store,
        RequestBody::FindNode { .. } => RpcKind::FindNode,
        RequestBody::FindValue { .. } => RpcKind::FindValue,
        RequestBody::Stats { .. } => RpcKind::Stats,
        RequestBody::Data(_) => RpcKind::Data,
        RequestBody::KeyBlock { .. } => RpcKind::KeyBlock,
        RequestBody::QueryStore { .. } => RpcKind::QueryStore,
    }
}

/// Shift value creation times from the sender's clock onto ours.
fn adjust_created(value_sets: &[Vec<TransportValue>], skew: i64) -> Vec<Vec<TransportValue>> {
    value_sets
        .iter()
        .map(|set| {
            set.iter()
                .map(|v| TransportValue { created: v.created.saturating_add(skew), ..v.clone() })
                .collect()
        })
        .collect()
}

/// Split values over find-value replies of `space` bytes. A value too big
/// for an empty reply still goes out alone. The final chunk may be empty.
pub(crate) fn split_values(values: Vec<TransportValue>, space: usize) -> Vec<Vec<TransportValue>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for value in values {
        let size = value_wire_size(&value);
        if used > 0 && used + size > space {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += size;
        current.push(value);
    }
    chunks.push(current);
    chunks
}

async fn receive_loop(channel: Arc<dyn DatagramChannel>, inner: Weak<TransportInner>) {
    loop {
        let (datagram, from) = match channel.recv_from().await {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected) => {
                debug!(error = %e, "datagram channel closed");
                break;
            }
            Err(e) => {
                debug!(error = %e, "receive failed");
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else { break };
        inner.on_datagram(datagram, from);
    }
    trace!("receive loop stopped");
}

async fn stats_loop(inner: Weak<TransportInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        inner.stats_tick();
    }
}

// ============================================================================
// Local Alternate Provider
// ============================================================================

/// Publishes our routable contacts to peers asking for this network's
/// contacts in alternate-contact gossip.
struct RoutableContactsProvider {
    network: AltNetworkType,
    inner: Weak<TransportInner>,
}

impl AltContactProvider for RoutableContactsProvider {
    fn network(&self) -> AltNetworkType {
        self.network
    }

    fn contacts(&self, max: usize) -> Vec<AlternativeContact> {
        let Some(inner) = self.inner.upgrade() else {
            return Vec::new();
        };
        let contacts = lock(&inner.state).routable_history.contacts();
        contacts
            .iter()
            .take(max)
            .filter_map(|c| AlternativeContact::for_socket_addr(self.network, c.protocol_version(), c.external_addr()).ok())
            .collect()
    }
}

// ============================================================================
// Contact Map
// ============================================================================

/// Bencoded `{a, p, v}` form of a contact. Fields are declared in key order.
#[derive(Debug, Serialize, Deserialize)]
struct ContactMap {
    #[serde(rename = "a", with = "serde_bytes")]
    address: Vec<u8>,
    #[serde(rename = "p")]
    port: u16,
    #[serde(rename = "v")]
    version: u8,
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

fn ip_to_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

// ============================================================================
// Public Handle
// ============================================================================

/// Handle to a running transport. Cheap to clone.
#[derive(Clone)]
pub struct DhtTransport {
    pub(crate) inner: Arc<TransportInner>,
}

impl DhtTransport {
    pub fn builder(config: TransportConfig, channel: Arc<dyn DatagramChannel>) -> TransportBuilder {
        TransportBuilder::new(config, channel)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn protocol_version(&self) -> u8 {
        self.inner.version
    }

    pub fn local_contact(&self) -> Contact {
        self.inner.local_contact()
    }

    /// Last resolved external address.
    pub fn external_address(&self) -> Option<IpAddr> {
        lock(&self.inner.address).current()
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        if let Some(ip) = self.external_address() {
            listener.current_address(ip);
        }
        lock(&self.inner.listeners).push(listener);
    }

    /// Route datagrams that are not DHT traffic to the returned receiver,
    /// replacing any earlier one. Datagrams beyond
    /// [`FOREIGN_SINK_CAPACITY`] unread ones are dropped.
    pub fn foreign_datagrams(&self) -> mpsc::Receiver<(Vec<u8>, SocketAddr)> {
        let (tx, rx) = mpsc::channel(FOREIGN_SINK_CAPACITY);
        *lock(&self.inner.foreign_sink) = Some(tx);
        rx
    }

    // ------------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------------

    /// Contacts that reported themselves routable, most recent first.
    pub fn reachable_contacts(&self) -> Vec<Contact> {
        lock(&self.inner.state).routable_history.contacts()
    }

    /// Contacts recently seen alive, most recent first.
    pub fn recent_contacts(&self) -> Vec<Contact> {
        lock(&self.inner.state).contact_history.contacts()
    }

    pub fn import_contact(&self, addr: SocketAddr, version: u8, is_bootstrap: bool) -> Contact {
        let contact = Contact::new(&self.inner.ids, addr, addr, version, 0, 0);
        self.inner.import(contact, is_bootstrap)
    }

    /// Import a contact in its wire form.
    pub fn import_contact_bytes(&self, bytes: &[u8], is_bootstrap: bool) -> Result<Contact, DecodeError> {
        let info = Reader::new(bytes).read_contact()?;
        Ok(self.import_contact(info.address, info.version, is_bootstrap))
    }

    pub fn export_contact(&self, contact: &Contact) -> Result<Vec<u8>, EncodeError> {
        let mut w = Writer::new();
        w.write_contact(&contact.info())?;
        Ok(w.into_bytes())
    }

    /// Bencoded map with keys `v` (version), `p` (port) and `a` (IP bytes).
    pub fn export_contact_map(&self, contact: &Contact) -> Result<Vec<u8>, EncodeError> {
        let addr = contact.external_addr();
        let map = ContactMap { address: ip_to_bytes(&addr.ip()), port: addr.port(), version: contact.protocol_version() };
        bendy::serde::to_bytes(&map).map_err(|e| EncodeError::Properties(e.to_string()))
    }

    pub fn import_contact_map(&self, bytes: &[u8], is_bootstrap: bool) -> Result<Contact, DecodeError> {
        let map: ContactMap = bendy::serde::from_bytes(bytes).map_err(|e| DecodeError::Properties(e.to_string()))?;
        let ip = ip_from_bytes(&map.address).ok_or(DecodeError::InvalidAddress(map.address.len()))?;
        Ok(self.import_contact(SocketAddr::new(ip, map.port), map.version, is_bootstrap))
    }

    /// Forget a contact and tell the handler.
    pub fn remove_contact(&self, contact: &Contact) {
        self.inner.remove_contact(contact);
    }

    /// Wire form of a contact heard about elsewhere, e.g. in a lookup.
    pub fn contact_from_info(&self, info: &ContactInfo) -> Contact {
        Contact::from_info(&self.inner.ids, info)
    }

    // ------------------------------------------------------------------------
    // Reachability & Stats
    // ------------------------------------------------------------------------

    pub fn is_reachable(&self) -> bool {
        lock(&self.inner.state).reachability.is_reachable()
    }

    /// Share of incoming requesters that report themselves routable, or -1.
    pub fn routable_percentage(&self) -> i32 {
        lock(&self.inner.state).routable.percentage()
    }

    pub fn node_status(&self) -> NodeStatus {
        self.inner.node_status()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Drop our network position estimate.
    pub fn reset_network_positions(&self) {
        self.inner.netpos.reset();
        for listener in self.inner.listeners() {
            listener.reset_network_positions();
        }
    }

    /// Estimated round trip to a contact from network positions.
    pub fn estimate_rtt(&self, contact: &Contact) -> Option<f32> {
        self.inner.netpos.estimate_rtt(&contact.network_positions())
    }

    // ------------------------------------------------------------------------
    // Alternate Networks
    // ------------------------------------------------------------------------

    pub fn alt_networks(&self) -> Arc<AltNetworks> {
        Arc::clone(&self.inner.alt)
    }

    /// Live contacts cached for `network`.
    pub fn alternative_contacts(&self, network: AltNetworkType, max: usize) -> Vec<AlternativeContact> {
        self.inner.alt.get_contacts(network, max, true)
    }

    pub fn register_alt_provider(&self, provider: Arc<dyn AltContactProvider>) {
        self.inner.alt.register_provider(provider);
    }

    pub fn unregister_alt_provider(&self, provider: &Arc<dyn AltContactProvider>) {
        self.inner.alt.unregister_provider(provider);
    }

    // ------------------------------------------------------------------------
    // Address
    // ------------------------------------------------------------------------

    /// Re-run external address resolution, committing a new local contact
    /// if the result differs.
    pub async fn refresh_external_address(&self) -> IpAddr {
        let current = self.local_contact().external_addr().ip();
        let resolved = self.inner.resolve_external_address(current).await;
        if resolved != current {
            self.inner.set_local_contact(resolved);
        }
        resolved
    }

    /// Stop background tasks and fail outstanding requests.
    pub fn shutdown(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        self.inner.pending.close_all();
        if let Some(provider) = lock(&self.inner.local_provider).take() {
            self.inner.alt.unregister_provider(&provider);
        }
        if let Some(registry) = &self.inner.registry {
            registry.unregister_transport(&self.inner.alt);
        }
        info!("dht transport stopped");
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct TransportBuilder {
    config: TransportConfig,
    channel: Arc<dyn DatagramChannel>,
    ip_filter: Option<Arc<dyn IpFilter>>,
    public_address: Option<Arc<dyn PublicAddressSource>>,
    upload_stats: Option<Arc<dyn UploadStatsSource>>,
    registry: Option<Arc<AltNetworkRegistry>>,
    listeners: Vec<Arc<dyn TransportListener>>,
}

impl TransportBuilder {
    pub fn new(config: TransportConfig, channel: Arc<dyn DatagramChannel>) -> Self {
        Self {
            config,
            channel,
            ip_filter: None,
            public_address: None,
            upload_stats: None,
            registry: None,
            listeners: Vec::new(),
        }
    }

    pub fn ip_filter(mut self, filter: Arc<dyn IpFilter>) -> Self {
        self.ip_filter = Some(filter);
        self
    }

    pub fn public_address_source(mut self, source: Arc<dyn PublicAddressSource>) -> Self {
        self.public_address = Some(source);
        self
    }

    pub fn upload_stats_source(mut self, source: Arc<dyn UploadStatsSource>) -> Self {
        self.upload_stats = Some(source);
        self
    }

    pub fn alt_registry(mut self, registry: Arc<AltNetworkRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn TransportListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Start the receive loop and stats tick and resolve the external
    /// address. Must be called inside a tokio runtime.
    pub async fn start(self, handler: Arc<dyn RequestHandler>) -> Result<DhtTransport> {
        let local_addr = self.channel.local_addr().context("datagram channel has no local address")?;
        let config = self.config;
        let version = config.effective_version();
        if version != config.protocol_version {
            warn!(
                requested = config.protocol_version,
                using = version,
                network = %config.network,
                "protocol version adjusted for network"
            );
        }

        let default_ip = config.bind_address.unwrap_or_else(|| local_addr.ip());
        let ids = NodeIdCache::default();
        let external = SocketAddr::new(default_ip, local_addr.port());
        let local = Contact::new(&ids, external, external, version, rand::thread_rng().gen(), 0);
        let ipv6 = local_addr.is_ipv6() || config.network.is_ipv6();

        let state = TransportState {
            contact_history: ContactHistory::new(CONTACT_HISTORY_MAX),
            routable_history: ContactHistory::new(ROUTABLE_CONTACT_HISTORY_MAX),
            recent_reports: RecentReports::new(RECENT_REPORTS_HISTORY_MAX),
            reachability: ReachabilityTracker::with_warmup(config.initially_reachable, config.stats_warmup),
            routable: RoutableTracker::new(config.routable_percentage_seed),
            recent_destinations: RecentDestinations::new(),
        };

        let inner = Arc::new(TransportInner {
            version,
            channel: Arc::clone(&self.channel),
            handler,
            listeners: Mutex::new(self.listeners),
            ids,
            guard: AddressGuard::new(self.ip_filter),
            stats: TransportStats::new(),
            netpos: NetworkPositionManager::new(),
            pending: PendingTable::default(),
            local: Mutex::new(local),
            state: Mutex::new(state),
            address: Mutex::new(AddressTracker::new(ipv6)),
            address_changing: AtomicBool::new(false),
            alt: Arc::new(AltNetworks::new(&AltNetworkType::ALL)),
            registry: self.registry,
            local_provider: Mutex::new(None),
            public_address: self.public_address,
            upload_stats_source: self.upload_stats,
            last_upload_stats: Mutex::new(None),
            foreign_sink: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            next_transaction: AtomicU32::new(rand::thread_rng().gen()),
            config,
        });

        let provider: Arc<dyn AltContactProvider> = Arc::new(RoutableContactsProvider {
            network: if ipv6 { AltNetworkType::BiglybtV6 } else { AltNetworkType::BiglybtV4 },
            inner: Arc::downgrade(&inner),
        });
        inner.alt.register_provider(Arc::clone(&provider));
        *lock(&inner.local_provider) = Some(provider);
        if let Some(registry) = &inner.registry {
            registry.register_transport(&inner.alt);
        }

        {
            let mut tasks = lock(&inner.tasks);
            tasks.push(tokio::spawn(receive_loop(Arc::clone(&inner.channel), Arc::downgrade(&inner))));
            tasks.push(tokio::spawn(stats_loop(Arc::downgrade(&inner), inner.config.stats_period)));
        }

        let resolved = inner.resolve_external_address(default_ip).await;
        if resolved != default_ip {
            inner.set_local_contact(resolved);
        }

        info!(
            addr = %local_addr,
            external = %inner.local_contact().external_addr(),
            version,
            network = %inner.config.network,
            bootstrap = inner.config.bootstrap_node,
            "dht transport started"
        );
        Ok(DhtTransport { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(len: usize) -> TransportValue {
        TransportValue {
            version: 1,
            created: 0,
            value: vec![1; len],
            originator: ContactInfo { version: 50, address: "203.0.113.5:6881".parse().unwrap() },
            flags: 0,
            life_hours: 0,
            replication_control: 0,
        }
    }

    #[test]
    fn split_keeps_every_value_once() {
        let values: Vec<_> = (0..20).map(|_| value(300)).collect();
        let chunks = split_values(values, 1300);
        let per_chunk = 1300 / value_wire_size(&value(300));
        assert_eq!(chunks.len(), 20usize.div_ceil(per_chunk));
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 20);
    }

    #[test]
    fn oversized_value_sent_alone() {
        let chunks = split_values(vec![value(2000), value(10)], 1300);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 1);
        assert_eq!(chunks[0][0].value.len(), 2000);
    }

    #[test]
    fn empty_values_give_one_empty_chunk() {
        let chunks = split_values(Vec::new(), 1300);
        assert_eq!(chunks, vec![Vec::<TransportValue>::new()]);
    }

    #[test]
    fn skew_shifts_creation_time() {
        let sets = vec![vec![value(1)]];
        let adjusted = adjust_created(&sets, 500);
        assert_eq!(adjusted[0][0].created, 500);
    }

    #[test]
    fn ip_bytes_round_trip() {
        for ip in ["203.0.113.4", "2001:db8::7"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert_eq!(ip_from_bytes(&ip_to_bytes(&ip)), Some(ip));
        }
        assert_eq!(ip_from_bytes(&[1, 2, 3]), None);
    }
}
