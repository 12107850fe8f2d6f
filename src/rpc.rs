//! # Request/Reply Engine
//!
//! Outbound RPCs over an unreliable datagram channel. Every request is
//! registered under its transaction id before it is sent; the receive loop
//! matches replies against that table and resolves the waiting future.
//!
//! ```text
//! Created ──► Sent (pending) ──► Matched ──► Completed
//!                  │                 └─────► Errored (error reply, mismatch)
//!                  └───────────────────────► TimedOut
//! ```
//!
//! | RPC | Priority | Timeout |
//! |-----|----------|---------|
//! | ping | Medium | request timeout |
//! | immediate ping | Immediate | request timeout |
//! | external-address probe | High | 5 s |
//! | find-value | High | request timeout |
//! | find-node, key-block, query-store | Medium | request timeout |
//! | store | Medium | 2 × request timeout |
//! | stats | Low | request timeout |
//!
//! Find-value replies may arrive as several sub-replies; the request stays
//! registered until one arrives without the continuation flag.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::filter::AddressRejected;
use crate::identity::{now_ms, Contact, NodeStatus};
use crate::lock;
use crate::messages::{
    ErrorReply, FindValueReply, Packet, Reply, ReplyBody, Request, RequestBody, RequestHeader, StatsReply,
    ACT_REPLY_STATS, ACT_REQUEST_STATS, CONNECTION_ID_HIGH_BIT, STATS_TYPE_ORIGINAL,
};
use crate::protocols::{FindValueResult, Priority, QueryStoreResult};
use crate::stats::RpcKind;
use crate::transport::{DhtTransport, TransportInner};
use crate::version::{PROTOCOL_VERSION_GENERIC_NETPOS, VENDOR_ID_SELF};
use crate::wire::{
    EncodeError, TransportValue, UploadStats, ADDRESS_SIZE_V4, ADDRESS_SIZE_V6, VALUE_SIZE_WITHOUT_VALUE,
};

/// Timeout of the ping used to learn our external address.
pub const EXTERNAL_ADDRESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Errors
// ============================================================================

/// Error reported by the remote node in an error reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerError {
    /// The peer saw us at a different address than we claimed.
    OriginatorAddressWrong(SocketAddr),
    /// The key is blocked; the signed block request proves it.
    KeyBlocked { request: Vec<u8>, signature: Vec<u8> },
    Other(u32),
}

impl From<ErrorReply> for PeerError {
    fn from(err: ErrorReply) -> Self {
        match err {
            ErrorReply::OriginatorAddressWrong(addr) => PeerError::OriginatorAddressWrong(addr),
            ErrorReply::KeyBlocked { request, signature } => PeerError::KeyBlocked { request, signature },
            ErrorReply::Other(t) => PeerError::Other(t),
        }
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::OriginatorAddressWrong(addr) => write!(f, "originator address wrong, seen as {addr}"),
            PeerError::KeyBlocked { .. } => write!(f, "key blocked"),
            PeerError::Other(t) => write!(f, "unknown error type {t}"),
        }
    }
}

#[derive(Debug)]
pub enum RpcError {
    /// Reply did not carry the request's connection id.
    ProtocolMismatch,
    AddressRejected(AddressRejected),
    PeerReported(PeerError),
    Timeout,
    /// Reply action does not answer the request.
    UnexpectedReply { expected: u32, got: u32 },
    Encode(EncodeError),
    Io(io::Error),
    /// Transport shut down while the request was pending.
    Closed,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::ProtocolMismatch => write!(f, "connection id mismatch"),
            RpcError::AddressRejected(e) => write!(f, "{e}"),
            RpcError::PeerReported(e) => write!(f, "peer reported: {e}"),
            RpcError::Timeout => write!(f, "request timed out"),
            RpcError::UnexpectedReply { expected, got } => {
                write!(f, "unexpected reply action {got}, expected {expected}")
            }
            RpcError::Encode(e) => write!(f, "encode failed: {e}"),
            RpcError::Io(e) => write!(f, "send failed: {e}"),
            RpcError::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::AddressRejected(e) => Some(e),
            RpcError::Encode(e) => Some(e),
            RpcError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AddressRejected> for RpcError {
    fn from(e: AddressRejected) -> Self {
        RpcError::AddressRejected(e)
    }
}

impl From<EncodeError> for RpcError {
    fn from(e: EncodeError) -> Self {
        RpcError::Encode(e)
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::Io(e)
    }
}

impl RpcError {
    /// Failures that say nothing about the peer being alive.
    fn counts_against_contact(&self) -> bool {
        matches!(self, RpcError::Timeout | RpcError::Io(_))
    }
}

// ============================================================================
// Pending Table
// ============================================================================

/// A matched reply with its round trip, net of the responder's processing
/// time.
#[derive(Debug)]
pub(crate) struct Received {
    pub reply: Reply,
    pub rtt: Duration,
}

type Outcome = Result<Received, RpcError>;

pub(crate) enum ReplySink {
    Once(oneshot::Sender<Outcome>),
    Stream(mpsc::UnboundedSender<Outcome>),
}

impl ReplySink {
    fn deliver(self, outcome: Outcome) {
        // A dropped receiver means the caller gave up; nothing to do.
        match self {
            ReplySink::Once(tx) => {
                let _ = tx.send(outcome);
            }
            ReplySink::Stream(tx) => {
                let _ = tx.send(outcome);
            }
        }
    }
}

pub(crate) struct PendingRequest {
    pub contact: Contact,
    pub connection_id: u64,
    pub expected_action: u32,
    pub sent_at: Instant,
    /// External-address probes must not feed address-change handling.
    pub probe: bool,
    pub sink: ReplySink,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<u32, PendingRequest>>,
}

impl PendingTable {
    fn insert(&self, transaction_id: u32, request: PendingRequest) {
        lock(&self.entries).insert(transaction_id, request);
    }

    pub(crate) fn remove(&self, transaction_id: u32) -> Option<PendingRequest> {
        lock(&self.entries).remove(&transaction_id)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Claim the entry a reply answers. A stream expecting more sub-replies
    /// stays registered and a sender clone is handed out instead.
    pub(crate) fn claim(&self, transaction_id: u32, more_to_come: bool) -> Option<PendingRequest> {
        let mut entries = lock(&self.entries);
        if more_to_come {
            if let Some(entry) = entries.get(&transaction_id) {
                if let ReplySink::Stream(tx) = &entry.sink {
                    return Some(PendingRequest {
                        contact: entry.contact.clone(),
                        connection_id: entry.connection_id,
                        expected_action: entry.expected_action,
                        sent_at: entry.sent_at,
                        probe: entry.probe,
                        sink: ReplySink::Stream(tx.clone()),
                    });
                }
            }
        }
        entries.remove(&transaction_id)
    }

    /// Fail everything outstanding.
    pub(crate) fn close_all(&self) {
        let drained: Vec<_> = lock(&self.entries).drain().map(|(_, p)| p).collect();
        for pending in drained {
            pending.sink.deliver(Err(RpcError::Closed));
        }
    }
}

// ============================================================================
// Send Path
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub(crate) struct SendOptions {
    pub kind: RpcKind,
    pub priority: Priority,
    pub timeout: Duration,
    pub probe: bool,
}

impl SendOptions {
    fn new(kind: RpcKind, priority: Priority, timeout: Duration) -> Self {
        Self { kind, priority, timeout, probe: false }
    }
}

/// Releases a request's pending entry if its future is dropped while the
/// reply is still outstanding.
struct AbandonGuard<'a> {
    inner: &'a TransportInner,
    contact: &'a Contact,
    kind: RpcKind,
    transaction_id: u32,
}

impl AbandonGuard<'_> {
    /// The caller has taken over responsibility for the entry.
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        self.inner.abandon(self.contact, self.kind, self.transaction_id);
    }
}

pub(crate) fn new_connection_id() -> u64 {
    rand::thread_rng().gen::<u64>() | CONNECTION_ID_HIGH_BIT
}

impl TransportInner {
    /// Header for a request to `contact`, spoken at the lower of the two
    /// versions.
    pub(crate) fn request_header(&self, contact: &Contact, connection_id: u64) -> RequestHeader {
        let local = self.local_contact();
        let version = self
            .version
            .min(contact.protocol_version())
            .max(self.config.network.min_protocol_version());
        RequestHeader {
            connection_id,
            transaction_id: self.next_transaction.fetch_add(1, Ordering::Relaxed),
            protocol_version: version,
            vendor_id: VENDOR_ID_SELF,
            network: self.config.network,
            originator_version: self.version,
            originator_address: local.external_addr(),
            originator_instance_id: local.instance_id(),
            originator_time: now_ms(),
            flags: local.generic_flags(),
            flags2: 0,
        }
    }

    /// Encode, register and send. Returns the transaction id the reply will
    /// be matched on.
    async fn dispatch(
        &self,
        contact: &Contact,
        connection_id: u64,
        body: RequestBody,
        opts: SendOptions,
        sink: ReplySink,
    ) -> Result<u32, RpcError> {
        let to = contact.transport_addr();
        self.guard.check(&to)?;

        let header = self.request_header(contact, connection_id);
        let transaction_id = header.transaction_id;
        let expected_action = reply_action(body.action());
        let datagram = Packet::Request(Request { header, body }).encode()?;

        self.pending.insert(
            transaction_id,
            PendingRequest {
                contact: contact.clone(),
                connection_id,
                expected_action,
                sent_at: Instant::now(),
                probe: opts.probe,
                sink,
            },
        );
        self.stats.request_sent(opts.kind);
        lock(&self.state).recent_destinations.record_send(&to);

        let registered = AbandonGuard { inner: self, contact, kind: opts.kind, transaction_id };
        let len = datagram.len();
        let sent = self.channel.send_to(datagram, to, opts.priority).await;
        registered.disarm();
        if let Err(e) = sent {
            self.pending.remove(transaction_id);
            return Err(e.into());
        }
        self.stats.packet_sent(len);
        trace!(to = %to, kind = ?opts.kind, txn = transaction_id, "request sent");
        Ok(transaction_id)
    }

    /// One request, one reply.
    pub(crate) async fn request(
        self: Arc<Self>,
        contact: Contact,
        connection_id: u64,
        body: RequestBody,
        opts: SendOptions,
    ) -> Result<Received, RpcError> {
        let (tx, rx) = oneshot::channel();
        let outcome = match self.dispatch(&contact, connection_id, body, opts, ReplySink::Once(tx)).await {
            Ok(transaction_id) => {
                let _abandon = AbandonGuard { inner: &self, contact: &contact, kind: opts.kind, transaction_id };
                match tokio::time::timeout(opts.timeout, rx).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => Err(RpcError::Closed),
                    Err(_) => {
                        self.pending.remove(transaction_id);
                        Err(RpcError::Timeout)
                    }
                }
            }
            Err(e) => Err(e),
        };
        self.finish(&contact, opts.kind, outcome)
    }

    /// A caller gave up on `transaction_id` before it completed. The entry
    /// is dropped and the request counts as timed out.
    fn abandon(&self, contact: &Contact, kind: RpcKind, transaction_id: u32) {
        if self.pending.remove(transaction_id).is_some() {
            trace!(contact = %contact.transport_addr(), txn = transaction_id, "request abandoned");
            let _ = self.finish(contact, kind, Err::<(), _>(RpcError::Timeout));
        }
    }

    /// Count the outcome and apply failure thresholds.
    fn finish<T>(&self, contact: &Contact, kind: RpcKind, outcome: Result<T, RpcError>) -> Result<T, RpcError> {
        match &outcome {
            Ok(_) => self.stats.request_ok(kind),
            Err(e) => {
                self.stats.request_failed(kind);
                debug!(contact = %contact.transport_addr(), kind = ?kind, error = %e, "request failed");
                if e.counts_against_contact() {
                    self.contact_failed(contact);
                }
            }
        }
        outcome
    }

    fn contact_failed(&self, contact: &Contact) {
        let fails = contact.record_failure();
        if fails >= self.config.max_fails(contact.has_been_alive()) {
            debug!(contact = %contact.transport_addr(), fails, "contact exceeded failure threshold");
            self.remove_contact(contact);
        }
    }

    // ------------------------------------------------------------------------
    // Reply Path
    // ------------------------------------------------------------------------

    /// Route a decoded reply to whoever is waiting for it.
    pub(crate) fn on_reply(self: &Arc<Self>, from: SocketAddr, reply: Reply) {
        let more = matches!(reply.body, ReplyBody::FindValue { has_continuation: true, .. });
        let Some(pending) = self.pending.claim(reply.header.transaction_id, more) else {
            trace!(from = %from, txn = reply.header.transaction_id, "unmatched reply");
            return;
        };
        if from != pending.contact.transport_addr() {
            trace!(from = %from, expected = %pending.contact.transport_addr(), "reply from unexpected address");
        }
        let outcome = self.process_reply(&pending, reply);
        pending.sink.deliver(outcome);
    }

    fn process_reply(self: &Arc<Self>, pending: &PendingRequest, reply: Reply) -> Outcome {
        if reply.header.connection_id != pending.connection_id {
            return Err(RpcError::ProtocolMismatch);
        }
        let contact = &pending.contact;
        contact.set_instance_id_and_version(reply.header.target_instance_id, reply.header.protocol_version);

        let elapsed = pending.sent_at.elapsed();
        let processing = Duration::from_millis(u64::from(reply.header.processing_time));
        let rtt = elapsed.saturating_sub(processing);

        if let Some(positions) = reply_positions(&reply.body) {
            if !positions.is_empty() && !processing.is_zero() {
                contact.set_network_positions(positions.to_vec());
                self.netpos.update(rtt.as_millis() as u64, positions);
            }
        }
        contact.set_generic_flags(reply.header.flags, reply.header.flags2);

        let Reply { header, body } = reply;
        let err = match body {
            ReplyBody::Error(err) => err,
            body => {
                if body.action() != pending.expected_action {
                    return Err(RpcError::UnexpectedReply { expected: pending.expected_action, got: body.action() });
                }
                self.contact_alive(contact);
                return Ok(Received { reply: Reply { header, body }, rtt });
            }
        };
        match &err {
            ErrorReply::OriginatorAddressWrong(addr) => {
                if !pending.probe {
                    self.external_address_change(contact, *addr, false);
                }
            }
            ErrorReply::KeyBlocked { request, signature } => {
                let handler = Arc::clone(&self.handler);
                let (blocked_by, request, signature) = (contact.clone(), request.clone(), signature.clone());
                tokio::spawn(async move {
                    handler.key_block_request(&blocked_by, &request, &signature).await;
                });
                self.contact_alive(contact);
            }
            ErrorReply::Other(_) => {}
        }
        Err(RpcError::PeerReported(err.into()))
    }

    // ------------------------------------------------------------------------
    // Upload Stats
    // ------------------------------------------------------------------------

    /// Upload stats for an outgoing request, at most once per configured
    /// interval.
    pub(crate) fn outgoing_upload_stats(&self) -> Option<UploadStats> {
        let source = self.upload_stats_source.as_ref()?;
        {
            let mut last = lock(&self.last_upload_stats);
            if let Some(at) = *last {
                if at.elapsed() < self.config.upload_stats_interval {
                    return None;
                }
            }
            *last = Some(Instant::now());
        }
        let mut stats = source.upload_stats()?;
        stats.clamp();
        Some(stats)
    }

    pub(crate) fn receive_upload_stats(&self, contact: &Contact, stats: Option<&UploadStats>) {
        if let Some(stats) = stats {
            self.handler.upload_stats(contact, stats.clone());
        }
    }

    /// Ping used by external-address triangulation.
    pub(crate) async fn probe_ping(self: &Arc<Self>, contact: &Contact) -> Result<Received, RpcError> {
        let opts = SendOptions {
            probe: true,
            ..SendOptions::new(RpcKind::Ping, Priority::High, EXTERNAL_ADDRESS_PROBE_TIMEOUT)
        };
        Arc::clone(self).ping_with(contact.clone(), opts).await
    }

    async fn ping_with(self: Arc<Self>, contact: Contact, opts: SendOptions) -> Result<Received, RpcError> {
        let body = RequestBody::Ping {
            alt_request: if self.config.alt_contacts_enabled { self.alt.build_request() } else { Vec::new() },
            upload_stats: self.outgoing_upload_stats(),
        };
        let received = Arc::clone(&self).request(contact.clone(), new_connection_id(), body, opts).await?;
        if let ReplyBody::Ping { alt_contacts, upload_stats, .. } = &received.reply.body {
            if !alt_contacts.is_empty() {
                self.alt.receive(alt_contacts.clone());
            }
            self.receive_upload_stats(&contact, upload_stats.as_ref());
        }
        Ok(received)
    }
}

/// Reply action answering a request action.
fn reply_action(request_action: u32) -> u32 {
    match request_action {
        ACT_REQUEST_STATS => ACT_REPLY_STATS,
        other => other + 1,
    }
}

fn reply_positions(body: &ReplyBody) -> Option<&[crate::wire::NetworkPosition]> {
    match body {
        ReplyBody::Ping { network_positions, .. }
        | ReplyBody::FindNode { network_positions, .. }
        | ReplyBody::FindValue { network_positions, .. } => Some(network_positions),
        _ => None,
    }
}

// ============================================================================
// Packing
// ============================================================================

/// Keys with their value sets, as carried by one store packet.
pub(crate) type StoreBatch = (Vec<Vec<u8>>, Vec<Vec<TransportValue>>);

/// Per-key value cap within one store packet.
const MAX_VALUES_PER_KEY: usize = 255;

/// Encoded size of a value in a store request or find-value reply.
pub(crate) fn value_wire_size(value: &TransportValue) -> usize {
    let address_extra = if value.originator.address.is_ipv6() { ADDRESS_SIZE_V6 - ADDRESS_SIZE_V4 } else { 0 };
    VALUE_SIZE_WITHOUT_VALUE + address_extra + value.value.len() + 1
}

/// Split keys and their values over store packets with `space` payload
/// bytes each. A key costs its length plus its prefixes; a key whose values
/// all spilled into the next packet is dropped from the current one.
pub(crate) fn pack_store(keys: &[Vec<u8>], value_sets: &[Vec<TransportValue>], space: usize) -> Vec<StoreBatch> {
    let mut batches = Vec::new();
    let key_count = keys.len().min(value_sets.len());
    let (mut key_idx, mut value_idx) = (0, 0);

    while key_idx < key_count {
        let mut room = space as isize;
        let mut batch_keys: Vec<Vec<u8>> = Vec::new();
        let mut batch_values: Vec<Vec<TransportValue>> = Vec::new();

        batch_keys.push(keys[key_idx].clone());
        batch_values.push(Vec::new());
        room -= key_cost(&keys[key_idx]);

        while room > 0 && key_idx < key_count {
            if value_idx == value_sets[key_idx].len() {
                key_idx += 1;
                value_idx = 0;
                if batch_keys.len() == crate::messages::MAX_STORE_KEYS || key_idx == key_count {
                    break;
                }
                batch_keys.push(keys[key_idx].clone());
                batch_values.push(Vec::new());
                room -= key_cost(&keys[key_idx]);
                continue;
            }
            let value = &value_sets[key_idx][value_idx];
            let cost = value_wire_size(value) as isize;
            let Some(current) = batch_values.last_mut() else { break };
            if room < cost || current.len() == MAX_VALUES_PER_KEY {
                break;
            }
            current.push(value.clone());
            room -= cost;
            value_idx += 1;
        }

        if batch_values.last().map_or(false, |v| v.is_empty()) {
            batch_keys.pop();
            batch_values.pop();
        }
        if batch_keys.is_empty() {
            break;
        }
        batches.push((batch_keys, batch_values));
    }
    batches
}

fn key_cost(key: &[u8]) -> isize {
    // key length byte plus the value count
    (key.len() + 1 + 2) as isize
}

/// Prefixes with the suffixes carried in one query-store packet.
pub(crate) type QueryBatch = Vec<(Vec<u8>, Vec<Vec<u8>>)>;

/// Split query keys over packets with `space` payload bytes each. A prefix
/// costs its length plus three bytes, repeated in every packet its suffixes
/// span; a prefix is only started when a full header still fits.
pub(crate) fn pack_query_store(header_length: u8, keys: &[(Vec<u8>, Vec<Vec<u8>>)], space: usize) -> Vec<QueryBatch> {
    let header_length = header_length as usize;
    let min_space = header_length + 3;
    let mut batches = Vec::new();
    let mut current: QueryBatch = Vec::new();
    let mut room = space;

    for (prefix, suffixes) in keys {
        let suffix_len = header_length.saturating_sub(prefix.len());
        let mut rest = suffixes.as_slice();
        while !rest.is_empty() {
            if room < min_space {
                batches.push(std::mem::take(&mut current));
                room = space;
            }
            room = room.saturating_sub(3 + prefix.len());
            let mut taken = Vec::new();
            while let Some((suffix, tail)) = rest.split_first() {
                if room < suffix_len {
                    break;
                }
                taken.push(suffix.clone());
                room -= suffix_len;
                rest = tail;
            }
            if taken.is_empty() {
                // Nothing fits even in a fresh packet.
                return batches;
            }
            current.push((prefix.clone(), taken));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

// ============================================================================
// Public RPCs
// ============================================================================

/// One find-value sub-reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueResponse {
    Values { values: Vec<TransportValue>, diversification: u8, more: bool },
    Contacts(Vec<Contact>),
}

/// Sub-replies of one find-value request, in arrival order.
pub struct FindValueStream {
    inner: Arc<TransportInner>,
    contact: Contact,
    transaction_id: u32,
    timeout: Duration,
    rx: mpsc::UnboundedReceiver<Outcome>,
    done: bool,
}

impl FindValueStream {
    /// Next sub-reply; `None` once the final one has been returned. The
    /// timeout restarts with every sub-reply.
    pub async fn next(&mut self) -> Option<Result<FindValueResponse, RpcError>> {
        if self.done {
            return None;
        }
        let outcome = match tokio::time::timeout(self.timeout, self.rx.recv()).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => Err(RpcError::Closed),
            Err(_) => {
                self.inner.pending.remove(self.transaction_id);
                Err(RpcError::Timeout)
            }
        };
        let item = outcome.and_then(|received| self.convert(received));
        let finished = match &item {
            Ok(FindValueResponse::Values { more, .. }) => !more,
            _ => true,
        };
        if finished {
            self.done = true;
            self.inner.pending.remove(self.transaction_id);
            let item = self.inner.finish(&self.contact, RpcKind::FindValue, item);
            return Some(item);
        }
        Some(item)
    }

    fn convert(&self, received: Received) -> Result<FindValueResponse, RpcError> {
        match received.reply.body {
            ReplyBody::FindValue { has_continuation, result, .. } => Ok(match result {
                FindValueReply::Values { mut values, diversification } => {
                    let skew = self.contact.skew();
                    for value in &mut values {
                        value.created = value.created.saturating_add(skew);
                    }
                    FindValueResponse::Values { values, diversification, more: has_continuation }
                }
                FindValueReply::Contacts(infos) => FindValueResponse::Contacts(
                    infos.iter().map(|info| Contact::from_info(&self.inner.ids, info)).collect(),
                ),
            }),
            other => Err(RpcError::UnexpectedReply {
                expected: crate::messages::ACT_REPLY_FIND_VALUE,
                got: other.action(),
            }),
        }
    }

    /// Drain the stream into a single result. Values from all sub-replies
    /// are concatenated; the last diversification wins.
    pub async fn collect(mut self) -> Result<FindValueResult, RpcError> {
        let mut all = Vec::new();
        let mut div = 0;
        while let Some(item) = self.next().await {
            match item? {
                FindValueResponse::Values { values, diversification, .. } => {
                    all.extend(values);
                    div = diversification;
                }
                FindValueResponse::Contacts(contacts) => return Ok(FindValueResult::Contacts(contacts)),
            }
        }
        Ok(FindValueResult::Values { values: all, diversification: div })
    }
}

impl Drop for FindValueStream {
    fn drop(&mut self) {
        if !self.done {
            self.inner.abandon(&self.contact, RpcKind::FindValue, self.transaction_id);
        }
    }
}

impl DhtTransport {
    /// Liveness check; returns the round trip net of processing time.
    pub async fn ping(&self, contact: &Contact) -> Result<Duration, RpcError> {
        let opts = SendOptions::new(RpcKind::Ping, Priority::Medium, self.inner.config.request_timeout);
        Ok(Arc::clone(&self.inner).ping_with(contact.clone(), opts).await?.rtt)
    }

    /// Ping that bypasses the send queue.
    pub async fn immediate_ping(&self, contact: &Contact) -> Result<Duration, RpcError> {
        let opts = SendOptions::new(RpcKind::Ping, Priority::Immediate, self.inner.config.request_timeout);
        Ok(Arc::clone(&self.inner).ping_with(contact.clone(), opts).await?.rtt)
    }

    /// Contacts the peer knows closest to `id`. Any returned contacts also
    /// top up the contact history while it has room.
    pub async fn find_node(&self, contact: &Contact, id: &[u8]) -> Result<Vec<Contact>, RpcError> {
        let inner = &self.inner;
        let body = RequestBody::FindNode {
            id: id.to_vec(),
            node_status: inner.node_status().0,
            estimated_dht_size: inner.handler.estimated_dht_size(),
            upload_stats: inner.outgoing_upload_stats(),
        };
        let opts = SendOptions::new(RpcKind::FindNode, Priority::Medium, inner.config.request_timeout);
        let received = Arc::clone(inner).request(contact.clone(), new_connection_id(), body, opts).await?;

        let ReplyBody::FindNode { random_id, node_status, estimated_dht_size, contacts, upload_stats, .. } =
            received.reply.body
        else {
            return Err(RpcError::ProtocolMismatch);
        };
        contact.set_random_id(random_id);
        inner.update_contact_status(contact, NodeStatus(node_status), false);
        inner.handler.set_estimated_dht_size(estimated_dht_size);
        inner.receive_upload_stats(contact, upload_stats.as_ref());

        let contacts: Vec<Contact> = contacts.iter().map(|info| Contact::from_info(&inner.ids, info)).collect();
        {
            let mut state = lock(&inner.state);
            for c in &contacts {
                if state.contact_history.is_full() {
                    break;
                }
                state.contact_history.insert(c.clone());
            }
        }
        Ok(contacts)
    }

    /// Start a find-value lookup; sub-replies arrive on the returned stream.
    pub async fn find_value(
        &self,
        contact: &Contact,
        key: &[u8],
        max_values: u8,
        flags: u8,
    ) -> Result<FindValueStream, RpcError> {
        let inner = &self.inner;
        let body = RequestBody::FindValue { key: key.to_vec(), flags, max_values };
        let opts = SendOptions::new(RpcKind::FindValue, Priority::High, inner.config.request_timeout);
        let (tx, rx) = mpsc::unbounded_channel();
        let transaction_id = match inner.dispatch(contact, new_connection_id(), body, opts, ReplySink::Stream(tx)).await
        {
            Ok(id) => id,
            Err(e) => return inner.finish(contact, RpcKind::FindValue, Err(e)),
        };
        Ok(FindValueStream {
            inner: Arc::clone(inner),
            contact: contact.clone(),
            transaction_id,
            timeout: opts.timeout,
            rx,
            done: false,
        })
    }

    /// Store values under keys, split over as many packets as needed. All
    /// packets share one connection id; only the first packet's outcome is
    /// returned, the rest complete in the background.
    pub async fn store(
        &self,
        contact: &Contact,
        keys: &[Vec<u8>],
        value_sets: &[Vec<TransportValue>],
    ) -> Result<Vec<u8>, RpcError> {
        let inner = &self.inner;
        inner.guard.check(&contact.transport_addr())?;

        let connection_id = new_connection_id();
        let random_id = contact.random_id();
        let space = inner.payload_space(contact, connection_id, RequestBody::Store {
            random_id,
            keys: Vec::new(),
            value_sets: Vec::new(),
        })?;
        let opts = SendOptions::new(RpcKind::Store, Priority::Medium, inner.config.request_timeout * 2);

        let mut first = None;
        for (i, (keys, value_sets)) in pack_store(keys, value_sets, space).into_iter().enumerate() {
            let body = RequestBody::Store { random_id, keys, value_sets };
            let fut = Arc::clone(inner).request(contact.clone(), connection_id, body, opts);
            if i == 0 {
                first = Some(fut);
            } else {
                tokio::spawn(async move {
                    let _ = fut.await;
                });
            }
        }
        let Some(first) = first else {
            return Ok(Vec::new());
        };
        match first.await?.reply.body {
            ReplyBody::Store { diversifications } => Ok(diversifications),
            other => Err(RpcError::UnexpectedReply { expected: crate::messages::ACT_REPLY_STORE, got: other.action() }),
        }
    }

    /// Ask which of the given key headers the peer holds. Replies from every
    /// packet are concatenated in order; any failed packet fails the query.
    pub async fn query_store(
        &self,
        contact: &Contact,
        header_length: u8,
        keys: &[(Vec<u8>, Vec<Vec<u8>>)],
    ) -> Result<QueryStoreResult, RpcError> {
        let inner = &self.inner;
        inner.guard.check(&contact.transport_addr())?;

        let connection_id = new_connection_id();
        let space = inner.payload_space(contact, connection_id, RequestBody::QueryStore {
            header_length,
            keys: Vec::new(),
        })?;
        let opts = SendOptions::new(RpcKind::QueryStore, Priority::Medium, inner.config.request_timeout);

        let handles: Vec<_> = pack_query_store(header_length, keys, space)
            .into_iter()
            .map(|batch| {
                let body = RequestBody::QueryStore { header_length, keys: batch };
                tokio::spawn(Arc::clone(inner).request(contact.clone(), connection_id, body, opts))
            })
            .collect();

        let mut result = QueryStoreResult { header_size: header_length, entries: Vec::new() };
        let mut last_error = None;
        for handle in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::Closed),
            };
            match outcome {
                Ok(Received { reply: Reply { body: ReplyBody::QueryStore { random_id, header_size, entries }, .. }, .. }) => {
                    contact.set_random_id(random_id);
                    result.header_size = header_size;
                    result.entries.extend(entries);
                }
                Ok(Received { reply, .. }) => {
                    last_error = Some(RpcError::UnexpectedReply {
                        expected: crate::messages::ACT_REPLY_QUERY_STORE,
                        got: reply.body.action(),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Forward a signed key-block request.
    pub async fn key_block(&self, contact: &Contact, request: &[u8], signature: &[u8]) -> Result<(), RpcError> {
        let inner = &self.inner;
        let body = RequestBody::KeyBlock {
            random_id: contact.random_id(),
            request: request.to_vec(),
            signature: signature.to_vec(),
        };
        let opts = SendOptions::new(RpcKind::KeyBlock, Priority::Medium, inner.config.request_timeout);
        Arc::clone(inner).request(contact.clone(), new_connection_id(), body, opts).await?;
        Ok(())
    }

    /// Fetch the peer's stats. Peers older than typed stats always answer
    /// with the full stats block.
    pub async fn request_stats(&self, contact: &Contact, stats_type: u32) -> Result<StatsReply, RpcError> {
        let inner = &self.inner;
        let stats_type = if contact.protocol_version() < PROTOCOL_VERSION_GENERIC_NETPOS {
            STATS_TYPE_ORIGINAL
        } else {
            stats_type
        };
        let body = RequestBody::Stats { stats_type };
        let opts = SendOptions::new(RpcKind::Stats, Priority::Low, inner.config.request_timeout);
        match Arc::clone(inner).request(contact.clone(), new_connection_id(), body, opts).await?.reply.body {
            ReplyBody::Stats(stats) => Ok(stats),
            other => Err(RpcError::UnexpectedReply { expected: ACT_REPLY_STATS, got: other.action() }),
        }
    }

    /// One-way transfer packet; no reply is expected.
    pub async fn send_data(&self, contact: &Contact, packet: crate::messages::DataPacket) -> Result<(), RpcError> {
        let inner = &self.inner;
        let to = contact.transport_addr();
        inner.guard.check(&to)?;
        let header = inner.request_header(contact, new_connection_id());
        let datagram = Packet::Request(Request { header, body: RequestBody::Data(packet) }).encode()?;
        let len = datagram.len();
        inner.stats.request_sent(RpcKind::Data);
        lock(&inner.state).recent_destinations.record_send(&to);
        inner.channel.send_to(datagram, to, Priority::Medium).await?;
        inner.stats.packet_sent(len);
        Ok(())
    }
}

impl TransportInner {
    /// Bytes left for payload after the header and empty body of a request.
    fn payload_space(&self, contact: &Contact, connection_id: u64, empty: RequestBody) -> Result<usize, RpcError> {
        let header = self.request_header(contact, connection_id);
        let base = Packet::Request(Request { header, body: empty }).encode()?.len();
        Ok(self.config.packet_limit().saturating_sub(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ContactInfo;

    fn value(len: usize) -> TransportValue {
        TransportValue {
            version: 1,
            created: 1_000,
            value: vec![7; len],
            originator: ContactInfo { version: 50, address: "203.0.113.5:6881".parse().unwrap() },
            flags: 0,
            life_hours: 0,
            replication_control: 0,
        }
    }

    #[test]
    fn store_fits_one_packet() {
        let keys = vec![vec![1; 20], vec![2; 20]];
        let sets = vec![vec![value(10)], vec![value(10), value(10)]];
        let batches = pack_store(&keys, &sets, 1300);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0.len(), 2);
        assert_eq!(batches[0].1[1].len(), 2);
    }

    #[test]
    fn store_splits_values_across_packets() {
        let keys = vec![vec![1; 20]];
        let sets = vec![(0..10).map(|_| value(200)).collect::<Vec<_>>()];
        let per_value = value_wire_size(&value(200));
        let space = 1300;
        let per_packet = (space - key_cost(&keys[0]) as usize) / per_value;

        let batches = pack_store(&keys, &sets, space);
        assert_eq!(batches.len(), 10usize.div_ceil(per_packet));
        let total: usize = batches.iter().map(|(_, sets)| sets[0].len()).sum();
        assert_eq!(total, 10);
        for (keys, _) in &batches {
            assert_eq!(keys, &vec![vec![1; 20]]);
        }
    }

    #[test]
    fn store_drops_trailing_key_without_values() {
        let keys = vec![vec![1; 4], vec![2; 4]];
        let per_value = value_wire_size(&value(100));
        // Room for the first key's value and the second key, not its value.
        let space = key_cost(&keys[0]) as usize + per_value + key_cost(&keys[1]) as usize + 1;
        let sets = vec![vec![value(100)], vec![value(100)]];
        let batches = pack_store(&keys, &sets, space);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, vec![vec![1; 4]]);
        assert_eq!(batches[1].0, vec![vec![2; 4]]);
    }

    #[test]
    fn store_without_values_sends_nothing() {
        let batches = pack_store(&[vec![1; 4]], &[Vec::new()], 1300);
        assert!(batches.is_empty());
    }

    #[test]
    fn query_store_repeats_prefix_across_packets() {
        let suffixes: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i; 4]).collect();
        let keys = vec![(vec![9; 2], suffixes)];
        // One packet holds the prefix plus 10 suffixes.
        let space = 3 + 2 + 10 * 4;
        let batches = pack_query_store(6, &keys, space);
        assert_eq!(batches.len(), 10);
        for batch in &batches {
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].0, vec![9; 2]);
            assert_eq!(batch[0].1.len(), 10);
        }
        let flat: Vec<_> = batches.iter().flat_map(|b| b[0].1.clone()).collect();
        assert_eq!(flat, keys[0].1);
    }

    #[test]
    fn query_store_packs_many_prefixes() {
        let keys: Vec<_> = (0..3u8).map(|p| (vec![p], vec![vec![p; 3], vec![p; 3]])).collect();
        let batches = pack_query_store(4, &keys, 1300);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn peer_error_from_reply() {
        let addr: SocketAddr = "203.0.113.9:1".parse().unwrap();
        assert_eq!(PeerError::from(ErrorReply::OriginatorAddressWrong(addr)), PeerError::OriginatorAddressWrong(addr));
        assert_eq!(PeerError::from(ErrorReply::Other(7)), PeerError::Other(7));
    }

    #[test]
    fn connection_ids_have_high_bit() {
        for _ in 0..32 {
            assert_ne!(new_connection_id() & CONNECTION_ID_HIGH_BIT, 0);
        }
    }
}
