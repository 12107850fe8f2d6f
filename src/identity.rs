//! # Contact Identity
//!
//! Node IDs are not chosen by nodes. Each ID is the SHA-1 of a key derived
//! from the node's address and port, with later protocol versions masking the
//! address more coarsely so one IP range can only occupy a bounded number of
//! IDs.
//!
//! | Version | Masked key |
//! |---------|------------|
//! | `>= RESTRICT_ID3`, IPv4 | prefix-folded integer of the address, `port % 5` |
//! | `>= RESTRICT_ID3`, IPv6 | `ip:(port % 8)` |
//! | `>= RESTRICT_ID_PORTS2` | `ip:(port % 8)` |
//! | `>= RESTRICT_ID_PORTS` | `ip:(port % 1999)` |
//! | older | `ip:port` |
//!
//! Derivations are cached in a bounded LRU keyed by the masked key, so equal
//! keys always map to the same [`NodeId`] within a process.
//!
//! A [`Contact`] is shared: every history and in-flight RPC holding it sees
//! updates made when replies arrive.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tracing::trace;

use crate::lock;
use crate::version::{
    PROTOCOL_VERSION_RESTRICT_ID3, PROTOCOL_VERSION_RESTRICT_ID_PORTS,
    PROTOCOL_VERSION_RESTRICT_ID_PORTS2,
};
use crate::wire::{ContactInfo, NetworkPosition};

/// Length of a node ID in bytes (SHA-1 output).
pub const NODE_ID_LEN: usize = 20;

/// Capacity of the ID derivation cache.
pub const NODE_ID_CACHE_SIZE: usize = 128;

/// Generic flag: the sender's DHT is sleeping and should not be routed to.
pub const GF_DHT_SLEEPING: u8 = 0x01;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ============================================================================
// Node ID
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; NODE_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance, the Kademlia metric.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Textual host form used in ID keys: dotted IPv4, or all eight IPv6
/// groups in lowercase hex with no zero compression.
fn host_text(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6.segments().iter().map(|g| format!("{:x}", g)).collect::<Vec<_>>().join(":"),
    }
}

/// Masked key for `addr` under the rules of `version`.
pub fn id_key(addr: &SocketAddr, version: u8) -> String {
    let port = addr.port() as u64;
    let host = host_text(addr.ip());
    if version >= PROTOCOL_VERSION_RESTRICT_ID3 {
        match addr.ip() {
            IpAddr::V4(ip) => {
                let [b0, b1, b2, b3] = ip.octets().map(u64::from);
                let mut r = port % 5;
                r = ((b3 << 8) & 0xff00 | r) % 50;
                r = ((b2 << 16) & 0xff_0000 | r) % 2500;
                r |= (b1 << 24) & 0xff00_0000;
                r |= (b0 << 32) & 0xff_0000_0000;
                r.to_string()
            }
            IpAddr::V6(_) => format!("{}:{}", host, port % 8),
        }
    } else if version >= PROTOCOL_VERSION_RESTRICT_ID_PORTS2 {
        format!("{}:{}", host, port % 8)
    } else if version >= PROTOCOL_VERSION_RESTRICT_ID_PORTS {
        format!("{}:{}", host, port % 1999)
    } else {
        format!("{}:{}", host, port)
    }
}

fn hash_key(key: &str) -> NodeId {
    let mut hasher = sha1::Sha1::new();
    hasher.update(key.as_bytes());
    NodeId(hasher.digest().bytes())
}

/// Bounded cache of masked key to derived ID.
pub struct NodeIdCache {
    cache: Mutex<LruCache<String, NodeId>>,
}

impl NodeIdCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { cache: Mutex::new(LruCache::new(capacity)) }
    }

    /// Derive (or recall) the node ID for an address speaking `version`.
    pub fn node_id_for(&self, addr: &SocketAddr, version: u8) -> NodeId {
        let key = id_key(addr, version);
        let mut cache = lock(&self.cache);
        if let Some(id) = cache.get(&key) {
            return *id;
        }
        let id = hash_key(&key);
        cache.put(key, id);
        id
    }

    pub fn len(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NodeIdCache {
    fn default() -> Self {
        Self::new(NODE_ID_CACHE_SIZE)
    }
}

/// Whether `ip` may serve as a node's public address.
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            !(ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_unspecified())
        }
        IpAddr::V6(ip) => {
            !(ip.is_loopback()
                || ip.is_unspecified()
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80)
        }
    }
}

// ============================================================================
// Node Status
// ============================================================================

/// Routing hint a node reports about itself in find-node exchanges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeStatus(pub u32);

impl NodeStatus {
    pub const UNKNOWN: NodeStatus = NodeStatus(0xffff_ffff);
    pub const ROUTABLE: NodeStatus = NodeStatus(0x0000_0001);
    /// Reachability not established, or a bootstrap node that takes no
    /// routing traffic.
    pub const NONE: NodeStatus = NodeStatus(0);

    pub fn is_routable(self) -> bool {
        self != NodeStatus::UNKNOWN && (self.0 & NodeStatus::ROUTABLE.0) != 0
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        NodeStatus::UNKNOWN
    }
}

// ============================================================================
// Contact
// ============================================================================

/// Mutable part of a contact, refreshed by every exchange.
#[derive(Clone, Debug)]
pub struct ContactState {
    pub protocol_version: u8,
    pub instance_id: u32,
    /// Local clock minus remote clock, milliseconds.
    pub skew: i64,
    pub generic_flags: u8,
    pub generic_flags2: u8,
    pub node_status: NodeStatus,
    /// Anti-spoof token issued by this contact, echoed on stores.
    pub random_id: u32,
    pub network_positions: Vec<NetworkPosition>,
    pub last_alive: Option<Instant>,
    pub fail_count: u32,
}

struct ContactInner {
    transport_addr: SocketAddr,
    external_addr: SocketAddr,
    id: NodeId,
    id_matches: bool,
    state: Mutex<ContactState>,
}

/// A remote DHT node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Contact {
    inner: Arc<ContactInner>,
}

impl Contact {
    /// Build a contact heard at `transport_addr` claiming `external_addr`.
    /// The ID derives from the claimed address; it matches only if the
    /// observed address masks to the same key.
    pub fn new(
        ids: &NodeIdCache,
        transport_addr: SocketAddr,
        external_addr: SocketAddr,
        protocol_version: u8,
        instance_id: u32,
        skew: i64,
    ) -> Self {
        let id = ids.node_id_for(&external_addr, protocol_version);
        let id_matches =
            transport_addr == external_addr || ids.node_id_for(&transport_addr, protocol_version) == id;
        Self {
            inner: Arc::new(ContactInner {
                transport_addr,
                external_addr,
                id,
                id_matches,
                state: Mutex::new(ContactState {
                    protocol_version,
                    instance_id,
                    skew,
                    generic_flags: 0,
                    generic_flags2: 0,
                    node_status: NodeStatus::UNKNOWN,
                    random_id: 0,
                    network_positions: Vec::new(),
                    last_alive: None,
                    fail_count: 0,
                }),
            }),
        }
    }

    /// Contact known only by address, e.g. one listed in a find-node reply.
    pub fn from_info(ids: &NodeIdCache, info: &ContactInfo) -> Self {
        Self::new(ids, info.address, info.address, info.version, 0, 0)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Address packets are sent to.
    pub fn transport_addr(&self) -> SocketAddr {
        self.inner.transport_addr
    }

    /// Address the node claims as its own.
    pub fn external_addr(&self) -> SocketAddr {
        self.inner.external_addr
    }

    pub fn info(&self) -> ContactInfo {
        ContactInfo { version: self.protocol_version(), address: self.inner.external_addr }
    }

    pub fn state(&self) -> ContactState {
        lock(&self.inner.state).clone()
    }

    pub fn protocol_version(&self) -> u8 {
        lock(&self.inner.state).protocol_version
    }

    pub fn instance_id(&self) -> u32 {
        lock(&self.inner.state).instance_id
    }

    pub fn skew(&self) -> i64 {
        lock(&self.inner.state).skew
    }

    pub fn set_skew(&self, skew: i64) {
        lock(&self.inner.state).skew = skew;
    }

    pub fn generic_flags(&self) -> u8 {
        lock(&self.inner.state).generic_flags
    }

    pub fn set_generic_flags(&self, flags: u8, flags2: u8) {
        let mut state = lock(&self.inner.state);
        state.generic_flags = flags;
        state.generic_flags2 = flags2;
    }

    pub fn is_sleeping(&self) -> bool {
        self.generic_flags() & GF_DHT_SLEEPING != 0
    }

    pub fn node_status(&self) -> NodeStatus {
        lock(&self.inner.state).node_status
    }

    pub fn set_node_status(&self, status: NodeStatus) {
        lock(&self.inner.state).node_status = status;
    }

    pub fn random_id(&self) -> u32 {
        lock(&self.inner.state).random_id
    }

    pub fn set_random_id(&self, random_id: u32) {
        lock(&self.inner.state).random_id = random_id;
    }

    pub fn network_positions(&self) -> Vec<NetworkPosition> {
        lock(&self.inner.state).network_positions.clone()
    }

    pub fn set_network_positions(&self, positions: Vec<NetworkPosition>) {
        lock(&self.inner.state).network_positions = positions;
    }

    /// Record the instance id and version a packet declared. Versions only
    /// move up; a restart shows up as a new instance id.
    pub fn set_instance_id_and_version(&self, instance_id: u32, version: u8) {
        let mut state = lock(&self.inner.state);
        if state.instance_id != instance_id {
            trace!(
                contact = %self.inner.transport_addr,
                old = state.instance_id,
                new = instance_id,
                "contact instance id changed"
            );
            state.instance_id = instance_id;
        }
        if version > state.protocol_version {
            state.protocol_version = version;
        }
    }

    pub fn mark_alive(&self) {
        let mut state = lock(&self.inner.state);
        state.last_alive = Some(Instant::now());
        state.fail_count = 0;
    }

    pub fn has_been_alive(&self) -> bool {
        lock(&self.inner.state).last_alive.is_some()
    }

    /// Count a failed exchange, returning the consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        let mut state = lock(&self.inner.state);
        state.fail_count = state.fail_count.saturating_add(1);
        state.fail_count
    }

    /// True when the observed address derives the claimed ID.
    pub fn address_matches_id(&self) -> bool {
        self.inner.id_matches
    }

    /// Usable as a routing contact: ID consistent with its address and the
    /// address is public.
    pub fn is_valid(&self) -> bool {
        self.address_matches_id() && is_public_ip(&self.inner.external_addr.ip())
    }

    /// Same node (ID and address), regardless of instance.
    pub fn same_node(&self, other: &Contact) -> bool {
        self.inner.id == other.inner.id && self.inner.transport_addr == other.inner.transport_addr
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other)
    }
}

impl Eq for Contact {}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Contact")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport_addr)
            .field("external", &self.inner.external_addr)
            .field("version", &state.protocol_version)
            .field("instance", &state.instance_id)
            .finish()
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.transport_addr, &self.inner.id.to_hex()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::PROTOCOL_VERSION_CURRENT;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn derivation_is_idempotent() {
        let cache = NodeIdCache::default();
        let a = cache.node_id_for(&addr("203.0.113.5:6881"), PROTOCOL_VERSION_CURRENT);
        let b = cache.node_id_for(&addr("203.0.113.5:6881"), PROTOCOL_VERSION_CURRENT);
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);

        // a fresh cache derives the same value
        let other = NodeIdCache::new(4);
        assert_eq!(other.node_id_for(&addr("203.0.113.5:6881"), PROTOCOL_VERSION_CURRENT), a);
    }

    #[test]
    fn masking_by_version() {
        let a = addr("203.0.113.5:6881");
        assert_eq!(id_key(&a, PROTOCOL_VERSION_RESTRICT_ID_PORTS - 1), "203.0.113.5:6881");
        assert_eq!(id_key(&a, PROTOCOL_VERSION_RESTRICT_ID_PORTS), format!("203.0.113.5:{}", 6881 % 1999));
        assert_eq!(id_key(&a, PROTOCOL_VERSION_RESTRICT_ID_PORTS2), format!("203.0.113.5:{}", 6881 % 8));

        let v6 = addr("[2001:db8::1]:6881");
        assert_eq!(id_key(&v6, PROTOCOL_VERSION_RESTRICT_ID3), "2001:db8:0:0:0:0:0:1:1");
    }

    #[test]
    fn ipv6_keys_spell_out_every_group() {
        let v6 = addr("[2001:db8::abcd:0:1]:6881");
        let full = "2001:db8:0:0:0:abcd:0:1";
        assert_eq!(id_key(&v6, PROTOCOL_VERSION_RESTRICT_ID_PORTS - 1), format!("{}:6881", full));
        assert_eq!(id_key(&v6, PROTOCOL_VERSION_RESTRICT_ID_PORTS), format!("{}:{}", full, 6881 % 1999));
        assert_eq!(id_key(&v6, PROTOCOL_VERSION_RESTRICT_ID_PORTS2), format!("{}:{}", full, 6881 % 8));
        assert_eq!(id_key(&v6, PROTOCOL_VERSION_RESTRICT_ID3), format!("{}:{}", full, 6881 % 8));

        // the ID is the SHA-1 of that uncompressed key
        let mut h = sha1::Sha1::new();
        h.update(format!("{}:1", full).as_bytes());
        let cache = NodeIdCache::default();
        assert_eq!(cache.node_id_for(&v6, PROTOCOL_VERSION_RESTRICT_ID3).as_bytes(), &h.digest().bytes());
    }

    #[test]
    fn restrict_id3_folds_low_octets() {
        let a = addr("203.0.113.5:6881");
        let mut r: u64 = 6881 % 5;
        r = ((5u64 << 8) | r) % 50;
        r = ((113u64 << 16) | r) % 2500;
        r |= 0u64 << 24;
        r |= 203u64 << 32;
        assert_eq!(id_key(&a, PROTOCOL_VERSION_RESTRICT_ID3), r.to_string());

        // ports equal mod 5 on the same address share an ID
        let cache = NodeIdCache::default();
        assert_eq!(
            cache.node_id_for(&addr("203.0.113.5:6881"), PROTOCOL_VERSION_RESTRICT_ID3),
            cache.node_id_for(&addr("203.0.113.5:6886"), PROTOCOL_VERSION_RESTRICT_ID3),
        );
    }

    #[test]
    fn id_is_sha1_of_key() {
        let cache = NodeIdCache::default();
        let id = cache.node_id_for(&addr("1.2.3.4:5"), 10);
        // SHA-1("1.2.3.4:5")
        let mut h = sha1::Sha1::new();
        h.update(b"1.2.3.4:5");
        assert_eq!(id.as_bytes(), &h.digest().bytes());
    }

    #[test]
    fn mismatched_address_is_invalid() {
        let cache = NodeIdCache::default();
        let honest = Contact::new(
            &cache,
            addr("203.0.113.5:6881"),
            addr("203.0.113.5:6881"),
            PROTOCOL_VERSION_CURRENT,
            1,
            0,
        );
        assert!(honest.is_valid());

        let liar = Contact::new(
            &cache,
            addr("198.51.100.9:6881"),
            addr("203.0.113.5:6881"),
            PROTOCOL_VERSION_CURRENT,
            1,
            0,
        );
        assert!(!liar.address_matches_id());
        assert!(!liar.is_valid());
    }

    #[test]
    fn private_address_is_invalid() {
        let cache = NodeIdCache::default();
        for a in ["192.168.1.10:6881", "127.0.0.1:6881", "169.254.0.3:6881", "[fe80::1]:6881", "[fd00::1]:1"] {
            let c = Contact::new(&cache, addr(a), addr(a), PROTOCOL_VERSION_CURRENT, 0, 0);
            assert!(c.address_matches_id());
            assert!(!c.is_valid(), "{} should be invalid", a);
        }
    }

    #[test]
    fn version_never_downgrades() {
        let cache = NodeIdCache::default();
        let c = Contact::new(&cache, addr("203.0.113.5:1"), addr("203.0.113.5:1"), 40, 7, 0);
        c.set_instance_id_and_version(7, 30);
        assert_eq!(c.protocol_version(), 40);
        c.set_instance_id_and_version(8, 52);
        assert_eq!(c.protocol_version(), 52);
        assert_eq!(c.instance_id(), 8);
    }

    #[test]
    fn clones_share_state() {
        let cache = NodeIdCache::default();
        let c = Contact::new(&cache, addr("203.0.113.5:1"), addr("203.0.113.5:1"), 50, 0, 0);
        let d = c.clone();
        d.set_random_id(99);
        d.mark_alive();
        assert_eq!(c.random_id(), 99);
        assert!(c.has_been_alive());
        assert_eq!(c.record_failure(), 1);
        assert_eq!(d.record_failure(), 2);
        c.mark_alive();
        assert_eq!(d.state().fail_count, 0);
    }

    #[test]
    fn node_status_routable_bit() {
        assert!(NodeStatus::ROUTABLE.is_routable());
        assert!(!NodeStatus::UNKNOWN.is_routable());
        assert!(!NodeStatus::NONE.is_routable());
    }
}
