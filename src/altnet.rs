//! # Alternate-Network Gossip
//!
//! Nodes on the main DHT also learn contacts for secondary overlays (mainline
//! DHT, I2P, Tor, the v4/v6 twin of this DHT). A ping advertises how many more
//! contacts of each network the sender wants; the reply piggybacks a few.
//!
//! | Type | Role |
//! |------|------|
//! | [`AlternativeContact`] | Overlay contact with an opaque bencoded property map |
//! | [`AltNetworkCache`] | Capped, ordered, id-deduplicated set for one network |
//! | [`AltNetworks`] | Per-transport caches plus locally registered providers |
//! | [`AltNetworkRegistry`] | Application-owned registry linking providers and transports |
//!
//! Caches are ordered most recently alive first with the id as tie-break.
//! Inserting beyond the cap evicts from the tail, so the cap is never exceeded.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use serde_bytes::ByteBuf;
use tracing::trace;

use crate::lock;
use crate::protocols::AltContactProvider;
use crate::wire::{DecodeError, EncodeError};

/// Contacts seen within this many seconds count as live.
pub const LIVE_AGE_SECS: u64 = 20 * 60;

/// Per-network cap for public overlays.
pub const MAX_CONTACTS_PUBLIC: usize = 64;

/// Anonymity networks carry bulky addresses, keep fewer.
pub const MAX_CONTACTS_ANONYMOUS: usize = 16;

/// Most contacts requested from, or sent to, a peer for an anonymity network.
pub const MAX_ANONYMOUS_PER_PING: usize = 2;

/// Maximum number of (network, count) pairs in one request.
pub const MAX_ALT_REQUESTS: usize = 16;

/// Maximum alternate contacts in one reply.
pub const MAX_ALT_CONTACTS: usize = 64;

/// Bencoded property maps are capped at this many bytes.
pub const MAX_PROPERTIES_SIZE: usize = 65535;

/// Property key holding the textual IP address.
pub const PROP_ADDRESS: &str = "a";

/// Property key holding the decimal port.
pub const PROP_PORT: &str = "p";

/// Opaque property map of an alternate contact.
pub type ContactProperties = BTreeMap<String, ByteBuf>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AltNetworkType {
    MainlineV4,
    MainlineV6,
    I2p,
    Tor,
    BiglybtV4,
    BiglybtV6,
}

impl AltNetworkType {
    pub const ALL: [AltNetworkType; 6] = [
        AltNetworkType::MainlineV4,
        AltNetworkType::MainlineV6,
        AltNetworkType::I2p,
        AltNetworkType::Tor,
        AltNetworkType::BiglybtV4,
        AltNetworkType::BiglybtV6,
    ];

    pub fn code(self) -> u8 {
        match self {
            AltNetworkType::MainlineV4 => 1,
            AltNetworkType::MainlineV6 => 2,
            AltNetworkType::I2p => 3,
            AltNetworkType::Tor => 4,
            AltNetworkType::BiglybtV4 => 5,
            AltNetworkType::BiglybtV6 => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.code() == code)
    }

    pub fn is_anonymous(self) -> bool {
        matches!(self, AltNetworkType::I2p | AltNetworkType::Tor)
    }

    pub fn max_contacts(self) -> usize {
        if self.is_anonymous() {
            MAX_CONTACTS_ANONYMOUS
        } else {
            MAX_CONTACTS_PUBLIC
        }
    }

    /// Per-ping request/response cap.
    fn per_ping_cap(self, count: usize) -> usize {
        if self.is_anonymous() {
            count.min(MAX_ANONYMOUS_PER_PING)
        } else {
            count
        }
    }
}

impl fmt::Display for AltNetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AltNetworkType::MainlineV4 => "mainline-v4",
            AltNetworkType::MainlineV6 => "mainline-v6",
            AltNetworkType::I2p => "i2p",
            AltNetworkType::Tor => "tor",
            AltNetworkType::BiglybtV4 => "biglybt-v4",
            AltNetworkType::BiglybtV6 => "biglybt-v6",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Alternative Contact
// ============================================================================

/// Contact on a secondary overlay. Identified by a hash of its encoded
/// properties, so two peers gossiping the same contact agree on its id.
#[derive(Clone, Debug)]
pub struct AlternativeContact {
    network: AltNetworkType,
    version: u8,
    /// Unix seconds.
    last_alive: u64,
    properties: ContactProperties,
    encoded: Vec<u8>,
    id: u32,
}

impl AlternativeContact {
    /// Contact seen alive now.
    pub fn new(
        network: AltNetworkType,
        version: u8,
        properties: ContactProperties,
    ) -> Result<Self, EncodeError> {
        Self::with_age(network, version, 0, properties)
    }

    pub fn with_age(
        network: AltNetworkType,
        version: u8,
        age_secs: u16,
        properties: ContactProperties,
    ) -> Result<Self, EncodeError> {
        let encoded = bendy::serde::to_bytes(&properties)
            .map_err(|e| EncodeError::Properties(e.to_string()))?;
        if encoded.len() > MAX_PROPERTIES_SIZE {
            return Err(EncodeError::LengthExceeded { len: encoded.len(), max: MAX_PROPERTIES_SIZE });
        }
        Ok(Self {
            network,
            version,
            last_alive: alive_at_age(age_secs),
            id: contact_id(&encoded),
            properties,
            encoded,
        })
    }

    /// Rebuild a contact received on the wire.
    pub fn from_wire(network: u8, version: u8, age_secs: u16, encoded: Vec<u8>) -> Result<Self, DecodeError> {
        let network = AltNetworkType::from_code(network)
            .ok_or_else(|| DecodeError::Properties(format!("unknown network {}", network)))?;
        let properties: ContactProperties = bendy::serde::from_bytes(&encoded)
            .map_err(|e| DecodeError::Properties(e.to_string()))?;
        Ok(Self {
            network,
            version,
            last_alive: alive_at_age(age_secs),
            id: contact_id(&encoded),
            properties,
            encoded,
        })
    }

    /// Contact for a plain socket address, published as `{a, p}` properties.
    pub fn for_socket_addr(network: AltNetworkType, version: u8, addr: SocketAddr) -> Result<Self, EncodeError> {
        let mut properties = ContactProperties::new();
        properties.insert(PROP_ADDRESS.into(), ByteBuf::from(addr.ip().to_string().into_bytes()));
        properties.insert(PROP_PORT.into(), ByteBuf::from(addr.port().to_string().into_bytes()));
        Self::new(network, version, properties)
    }

    pub fn network(&self) -> AltNetworkType {
        self.network
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn properties(&self) -> &ContactProperties {
        &self.properties
    }

    pub fn encoded_properties(&self) -> &[u8] {
        &self.encoded
    }

    /// Unix seconds when last seen alive.
    pub fn last_alive(&self) -> u64 {
        self.last_alive
    }

    /// Seconds since last seen alive, saturating at the wire field's range.
    pub fn age_secs(&self) -> u16 {
        unix_now().saturating_sub(self.last_alive).min(u16::MAX as u64) as u16
    }

    pub fn is_live(&self) -> bool {
        unix_now().saturating_sub(self.last_alive) <= LIVE_AGE_SECS
    }

    /// Socket address from `{a, p}` properties, when present.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = std::str::from_utf8(self.properties.get(PROP_ADDRESS)?).ok()?.parse().ok()?;
        let port: u16 = std::str::from_utf8(self.properties.get(PROP_PORT)?).ok()?.parse().ok()?;
        Some(SocketAddr::new(ip, port))
    }

    /// Most recently alive first, id ascending on ties.
    fn precedes(&self, other: &Self) -> std::cmp::Ordering {
        other.last_alive.cmp(&self.last_alive).then(self.id.cmp(&other.id))
    }
}

impl PartialEq for AlternativeContact {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network && self.id == other.id
    }
}

impl Eq for AlternativeContact {}

fn contact_id(encoded: &[u8]) -> u32 {
    let hash = blake3::hash(encoded);
    let b = hash.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn alive_at_age(age_secs: u16) -> u64 {
    unix_now().saturating_sub(age_secs as u64)
}

// ============================================================================
// Per-Network Cache
// ============================================================================

/// Bounded contact set for one overlay network.
#[derive(Debug)]
pub struct AltNetworkCache {
    network: AltNetworkType,
    max: usize,
    contacts: Vec<AlternativeContact>,
}

impl AltNetworkCache {
    pub fn new(network: AltNetworkType) -> Self {
        Self::with_capacity(network, network.max_contacts())
    }

    pub fn with_capacity(network: AltNetworkType, max: usize) -> Self {
        Self { network, max, contacts: Vec::with_capacity(max) }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// How many more contacts would fill the cache.
    pub fn required_contact_count(&self, live_only: bool) -> usize {
        let have = if live_only {
            self.contacts.iter().filter(|c| c.is_live()).count()
        } else {
            self.contacts.len()
        };
        self.max.saturating_sub(have)
    }

    /// Up to `max` contacts in priority order.
    pub fn get_contacts(&self, max: usize, live_only: bool) -> Vec<AlternativeContact> {
        self.contacts
            .iter()
            .filter(|c| !live_only || c.is_live())
            .take(max)
            .cloned()
            .collect()
    }

    /// Contacts a local provider offered for sending to peers.
    pub fn add_contacts_for_send(&mut self, contacts: Vec<AlternativeContact>) {
        for contact in contacts {
            self.insert(contact);
        }
    }

    /// Contact received in a peer's ping reply.
    pub fn add_contact_from_reply(&mut self, contact: AlternativeContact) {
        self.insert(contact);
    }

    fn insert(&mut self, contact: AlternativeContact) {
        if contact.network != self.network {
            return;
        }
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            if self.contacts[pos].last_alive >= contact.last_alive {
                return;
            }
            self.contacts.remove(pos);
        }
        let pos = self
            .contacts
            .binary_search_by(|probe| probe.precedes(&contact))
            .unwrap_or_else(|p| p);
        self.contacts.insert(pos, contact);
        while self.contacts.len() > self.max {
            if let Some(evicted) = self.contacts.pop() {
                trace!(network = %self.network, id = evicted.id, "evicted alternate contact");
            }
        }
    }
}

// ============================================================================
// Per-Transport State
// ============================================================================

/// A transport's alternate-network caches and the providers that feed them.
pub struct AltNetworks {
    states: Mutex<HashMap<AltNetworkType, AltNetworkCache>>,
    providers: Mutex<Arc<HashMap<AltNetworkType, Arc<dyn AltContactProvider>>>>,
}

impl AltNetworks {
    pub fn new(networks: &[AltNetworkType]) -> Self {
        let states = networks.iter().map(|n| (*n, AltNetworkCache::new(*n))).collect();
        Self {
            states: Mutex::new(states),
            providers: Mutex::new(Arc::new(HashMap::new())),
        }
    }

    pub fn networks(&self) -> Vec<AltNetworkType> {
        let mut nets: Vec<_> = lock(&self.states).keys().copied().collect();
        nets.sort();
        nets
    }

    /// Providers are swapped copy-on-write so readers never hold the lock
    /// while calling into one.
    pub fn register_provider(&self, provider: Arc<dyn AltContactProvider>) {
        let mut guard = lock(&self.providers);
        let mut next = HashMap::clone(&guard);
        next.insert(provider.network(), provider);
        *guard = Arc::new(next);
    }

    pub fn unregister_provider(&self, provider: &Arc<dyn AltContactProvider>) {
        let mut guard = lock(&self.providers);
        let mut next = HashMap::clone(&guard);
        next.retain(|_, p| !same_provider(p, provider));
        *guard = Arc::new(next);
    }

    fn providers(&self) -> Arc<HashMap<AltNetworkType, Arc<dyn AltContactProvider>>> {
        Arc::clone(&lock(&self.providers))
    }

    pub fn get_contacts(&self, network: AltNetworkType, max: usize, live_only: bool) -> Vec<AlternativeContact> {
        lock(&self.states)
            .get(&network)
            .map(|cache| cache.get_contacts(max, live_only))
            .unwrap_or_default()
    }

    /// Unmet live demand across all networks.
    pub fn total_required(&self) -> usize {
        lock(&self.states).values().map(|c| c.required_contact_count(true)).sum()
    }

    /// (network, count) pairs to attach to an outgoing ping.
    pub fn build_request(&self) -> Vec<(u8, u8)> {
        let states = lock(&self.states);
        let mut wanted: Vec<(u8, u8)> = states
            .values()
            .filter_map(|cache| {
                let req = cache.network.per_ping_cap(cache.required_contact_count(false));
                (req > 0).then(|| (cache.network.code(), req.min(u8::MAX as usize) as u8))
            })
            .collect();
        wanted.sort();
        wanted.truncate(MAX_ALT_REQUESTS);
        wanted
    }

    /// Contacts to return for a peer's request, topping up from the local
    /// provider first.
    pub fn build_reply(&self, requested: &[(u8, u8)]) -> Vec<AlternativeContact> {
        let providers = self.providers();
        let mut out = Vec::new();
        for &(code, count) in requested {
            if count == 0 {
                continue;
            }
            let Some(network) = AltNetworkType::from_code(code) else {
                continue;
            };
            let wanted = match lock(&self.states).get(&network) {
                Some(cache) => cache.required_contact_count(false),
                None => continue,
            };
            if wanted > 0 {
                if let Some(provider) = providers.get(&network) {
                    let fresh = provider.contacts(wanted);
                    if let Some(cache) = lock(&self.states).get_mut(&network) {
                        cache.add_contacts_for_send(fresh);
                    }
                }
            }
            let count = network.per_ping_cap(count as usize);
            out.extend(self.get_contacts(network, count, true));
        }
        out.truncate(MAX_ALT_CONTACTS);
        out
    }

    /// Absorb contacts piggybacked on a ping reply.
    pub fn receive(&self, contacts: Vec<AlternativeContact>) {
        let mut states = lock(&self.states);
        for contact in contacts {
            if let Some(cache) = states.get_mut(&contact.network()) {
                cache.add_contact_from_reply(contact);
            }
        }
    }
}

fn same_provider(a: &Arc<dyn AltContactProvider>, b: &Arc<dyn AltContactProvider>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ============================================================================
// Registry
// ============================================================================

/// Links application-level providers to every live transport and answers
/// merged queries across them. Owned by the application context.
#[derive(Default)]
pub struct AltNetworkRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    providers: Vec<Arc<dyn AltContactProvider>>,
    transports: Vec<Weak<AltNetworks>>,
}

impl AltNetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a transport's caches; it immediately receives every provider.
    pub fn register_transport(&self, networks: &Arc<AltNetworks>) {
        let mut inner = lock(&self.inner);
        inner.transports.retain(|w| w.strong_count() > 0);
        for provider in &inner.providers {
            networks.register_provider(Arc::clone(provider));
        }
        inner.transports.push(Arc::downgrade(networks));
    }

    pub fn unregister_transport(&self, networks: &Arc<AltNetworks>) {
        let target = Arc::as_ptr(networks);
        lock(&self.inner)
            .transports
            .retain(|w| w.strong_count() > 0 && w.as_ptr() != target);
    }

    pub fn register_provider(&self, provider: Arc<dyn AltContactProvider>) {
        let mut inner = lock(&self.inner);
        for transport in inner.transports.iter().filter_map(Weak::upgrade) {
            transport.register_provider(Arc::clone(&provider));
        }
        inner.providers.push(provider);
    }

    pub fn unregister_provider(&self, provider: &Arc<dyn AltContactProvider>) {
        let mut inner = lock(&self.inner);
        inner.providers.retain(|p| !same_provider(p, provider));
        for transport in inner.transports.iter().filter_map(Weak::upgrade) {
            transport.unregister_provider(provider);
        }
    }

    pub fn provider_for(&self, network: AltNetworkType) -> Option<Arc<dyn AltContactProvider>> {
        lock(&self.inner).providers.iter().find(|p| p.network() == network).cloned()
    }

    /// Best `max` contacts for `network` across providers and transports,
    /// most recently alive first, one per id.
    pub fn alternative_contacts(&self, network: AltNetworkType, max: usize) -> Vec<AlternativeContact> {
        if max == 0 {
            return Vec::new();
        }
        let (providers, transports) = {
            let inner = lock(&self.inner);
            let transports: Vec<_> = inner.transports.iter().filter_map(Weak::upgrade).collect();
            (inner.providers.clone(), transports)
        };

        let mut merged: Vec<AlternativeContact> = Vec::new();
        for provider in providers.iter().filter(|p| p.network() == network) {
            merged.extend(provider.contacts(max));
        }
        for transport in &transports {
            merged.extend(transport.get_contacts(network, max, false));
        }
        merged.sort_by(|a, b| a.precedes(b));

        let mut seen = std::collections::HashSet::new();
        merged.retain(|c| seen.insert(c.id));
        merged.truncate(max);
        merged
    }

    /// Random contact from the merged set, used by callers bootstrapping an
    /// overlay.
    pub fn random_contact(&self, network: AltNetworkType) -> Option<AlternativeContact> {
        let contacts = self.alternative_contacts(network, network.max_contacts());
        contacts.choose(&mut rand::thread_rng()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(network: AltNetworkType, port: u16, age: u16) -> AlternativeContact {
        let mut props = ContactProperties::new();
        props.insert(PROP_ADDRESS.into(), ByteBuf::from(b"198.51.100.7".to_vec()));
        props.insert(PROP_PORT.into(), ByteBuf::from(port.to_string().into_bytes()));
        AlternativeContact::with_age(network, 1, age, props).unwrap()
    }

    struct FixedProvider {
        network: AltNetworkType,
        contacts: Vec<AlternativeContact>,
    }

    impl AltContactProvider for FixedProvider {
        fn network(&self) -> AltNetworkType {
            self.network
        }

        fn contacts(&self, max: usize) -> Vec<AlternativeContact> {
            self.contacts.iter().take(max).cloned().collect()
        }
    }

    #[test]
    fn network_codes_round_trip() {
        for net in AltNetworkType::ALL {
            assert_eq!(AltNetworkType::from_code(net.code()), Some(net));
        }
        assert_eq!(AltNetworkType::from_code(0), None);
        assert!(AltNetworkType::Tor.max_contacts() < AltNetworkType::MainlineV4.max_contacts());
    }

    #[test]
    fn id_is_hash_of_properties() {
        let a = contact(AltNetworkType::MainlineV4, 1000, 0);
        let b = contact(AltNetworkType::MainlineV4, 1000, 500);
        let c = contact(AltNetworkType::MainlineV4, 1001, 0);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());

        let wire = AlternativeContact::from_wire(
            a.network().code(),
            a.version(),
            a.age_secs(),
            a.encoded_properties().to_vec(),
        )
        .unwrap();
        assert_eq!(wire.id(), a.id());
        assert_eq!(wire.socket_addr(), Some("198.51.100.7:1000".parse().unwrap()));
    }

    #[test]
    fn garbage_properties_rejected() {
        let err = AlternativeContact::from_wire(1, 1, 0, b"not bencode".to_vec()).unwrap_err();
        assert!(matches!(err, DecodeError::Properties(_)));
    }

    #[test]
    fn cache_never_exceeds_cap_and_evicts_oldest() {
        let mut cache = AltNetworkCache::with_capacity(AltNetworkType::MainlineV4, 4);
        for i in 0..4u16 {
            cache.add_contact_from_reply(contact(AltNetworkType::MainlineV4, 2000 + i, 100 + i));
        }
        assert_eq!(cache.len(), 4);

        // newer than everything present, pushes out the oldest (age 103)
        cache.add_contact_from_reply(contact(AltNetworkType::MainlineV4, 3000, 1));
        assert_eq!(cache.len(), 4);
        let ports: Vec<_> = cache
            .get_contacts(10, false)
            .iter()
            .map(|c| c.socket_addr().unwrap().port())
            .collect();
        assert_eq!(ports, vec![3000, 2000, 2001, 2002]);

        // older than everything present, dropped on insert
        cache.add_contact_from_reply(contact(AltNetworkType::MainlineV4, 4000, 5000));
        assert_eq!(cache.len(), 4);
        assert!(cache.get_contacts(10, false).iter().all(|c| c.socket_addr().unwrap().port() != 4000));
    }

    #[test]
    fn cache_deduplicates_by_id() {
        let mut cache = AltNetworkCache::new(AltNetworkType::MainlineV4);
        cache.add_contact_from_reply(contact(AltNetworkType::MainlineV4, 2000, 300));
        cache.add_contact_from_reply(contact(AltNetworkType::MainlineV4, 2000, 10));
        cache.add_contact_from_reply(contact(AltNetworkType::MainlineV4, 2000, 600));
        assert_eq!(cache.len(), 1);
        assert!(cache.get_contacts(1, false)[0].age_secs() <= 11);
    }

    #[test]
    fn cache_ignores_other_networks() {
        let mut cache = AltNetworkCache::new(AltNetworkType::MainlineV4);
        cache.add_contact_from_reply(contact(AltNetworkType::Tor, 1, 0));
        assert!(cache.is_empty());
    }

    #[test]
    fn live_filter() {
        let mut cache = AltNetworkCache::new(AltNetworkType::MainlineV6);
        cache.add_contact_from_reply(contact(AltNetworkType::MainlineV6, 1, 0));
        cache.add_contact_from_reply(contact(AltNetworkType::MainlineV6, 2, u16::MAX));
        assert_eq!(cache.get_contacts(10, true).len(), 1);
        assert_eq!(cache.required_contact_count(true), MAX_CONTACTS_PUBLIC - 1);
        assert_eq!(cache.required_contact_count(false), MAX_CONTACTS_PUBLIC - 2);
    }

    #[test]
    fn request_caps_anonymous_networks() {
        let nets = AltNetworks::new(&[AltNetworkType::Tor, AltNetworkType::MainlineV4]);
        let request = nets.build_request();
        assert_eq!(
            request,
            vec![
                (AltNetworkType::MainlineV4.code(), MAX_CONTACTS_PUBLIC as u8),
                (AltNetworkType::Tor.code(), 2),
            ]
        );
    }

    #[test]
    fn reply_fills_from_provider_first() {
        let nets = AltNetworks::new(&[AltNetworkType::MainlineV4, AltNetworkType::I2p]);
        let provider: Arc<dyn AltContactProvider> = Arc::new(FixedProvider {
            network: AltNetworkType::MainlineV4,
            contacts: (0..3).map(|i| contact(AltNetworkType::MainlineV4, 100 + i, 0)).collect(),
        });
        nets.register_provider(provider);
        nets.receive((0..5).map(|i| contact(AltNetworkType::I2p, 900 + i, 0)).collect());

        let reply = nets.build_reply(&[(AltNetworkType::MainlineV4.code(), 10), (AltNetworkType::I2p.code(), 10)]);
        let mainline = reply.iter().filter(|c| c.network() == AltNetworkType::MainlineV4).count();
        let i2p = reply.iter().filter(|c| c.network() == AltNetworkType::I2p).count();
        assert_eq!(mainline, 3);
        assert_eq!(i2p, MAX_ANONYMOUS_PER_PING);
    }

    #[test]
    fn registry_merges_and_deduplicates() {
        let registry = AltNetworkRegistry::new();
        let a = Arc::new(AltNetworks::new(&[AltNetworkType::MainlineV4]));
        let b = Arc::new(AltNetworks::new(&[AltNetworkType::MainlineV4]));
        registry.register_transport(&a);
        registry.register_transport(&b);

        a.receive(vec![contact(AltNetworkType::MainlineV4, 1, 50), contact(AltNetworkType::MainlineV4, 2, 10)]);
        b.receive(vec![contact(AltNetworkType::MainlineV4, 2, 10), contact(AltNetworkType::MainlineV4, 3, 5)]);

        let merged = registry.alternative_contacts(AltNetworkType::MainlineV4, 10);
        let ports: Vec<_> = merged.iter().map(|c| c.socket_addr().unwrap().port()).collect();
        assert_eq!(ports, vec![3, 2, 1]);

        assert_eq!(registry.alternative_contacts(AltNetworkType::MainlineV4, 2).len(), 2);
        assert!(registry.alternative_contacts(AltNetworkType::MainlineV4, 0).is_empty());

        registry.unregister_transport(&b);
        assert_eq!(registry.alternative_contacts(AltNetworkType::MainlineV4, 10).len(), 2);
    }

    #[test]
    fn registry_pushes_providers_to_transports() {
        let registry = AltNetworkRegistry::new();
        let early = Arc::new(AltNetworks::new(&[AltNetworkType::Tor]));
        registry.register_transport(&early);

        let provider: Arc<dyn AltContactProvider> = Arc::new(FixedProvider {
            network: AltNetworkType::Tor,
            contacts: vec![contact(AltNetworkType::Tor, 7, 0)],
        });
        registry.register_provider(Arc::clone(&provider));

        let late = Arc::new(AltNetworks::new(&[AltNetworkType::Tor]));
        registry.register_transport(&late);

        for nets in [&early, &late] {
            let reply = nets.build_reply(&[(AltNetworkType::Tor.code(), 1)]);
            assert_eq!(reply.len(), 1);
        }
        assert!(registry.provider_for(AltNetworkType::Tor).is_some());

        registry.unregister_provider(&provider);
        assert!(registry.provider_for(AltNetworkType::Tor).is_none());
        assert!(registry.random_contact(AltNetworkType::Tor).is_some());
    }
}
