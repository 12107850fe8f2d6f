//! In-memory datagram network for driving transports without sockets.
//!
//! Endpoints register by address. A NAT mapping rewrites an endpoint's
//! source address on the way out and routes replies back in. Blackholed
//! endpoints silently lose everything sent to them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use dhtudp::{
    Contact, DataPacket, DatagramChannel, DhtTransport, FindValueResult, FullStats, NetworkId, Priority,
    QueryStoreResult, RequestHandler, StoreResult, TransportConfig, TransportValue, PROTOCOL_VERSION_CURRENT,
};

type Inbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

#[derive(Default)]
struct NetState {
    endpoints: HashMap<SocketAddr, Inbox>,
    /// Private address to the public address peers see.
    nat: HashMap<SocketAddr, SocketAddr>,
    blackholed: HashSet<SocketAddr>,
}

#[derive(Clone, Default)]
pub struct MemNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, addr: SocketAddr) -> Arc<MemChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().endpoints.insert(addr, tx);
        Arc::new(MemChannel { addr, network: self.clone(), rx: tokio::sync::Mutex::new(rx) })
    }

    pub fn set_nat(&self, private: SocketAddr, public: SocketAddr) {
        self.state.lock().unwrap().nat.insert(private, public);
    }

    pub fn blackhole(&self, addr: SocketAddr) {
        self.state.lock().unwrap().blackholed.insert(addr);
    }

    /// Drop the endpoint; its receiver sees the channel close.
    pub fn disconnect(&self, addr: SocketAddr) {
        self.state.lock().unwrap().endpoints.remove(&addr);
    }

    /// Deliver a raw datagram as if sent from `from`.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, datagram: Vec<u8>) {
        let state = self.state.lock().unwrap();
        if let Some(inbox) = state.endpoints.get(&to) {
            let _ = inbox.send((datagram, from));
        }
    }

    fn route(&self, from: SocketAddr, to: SocketAddr, datagram: Vec<u8>) {
        let state = self.state.lock().unwrap();
        let source = state.nat.get(&from).copied().unwrap_or(from);
        let target = state
            .nat
            .iter()
            .find(|(_, public)| **public == to)
            .map(|(private, _)| *private)
            .unwrap_or(to);
        if state.blackholed.contains(&target) {
            return;
        }
        if let Some(inbox) = state.endpoints.get(&target) {
            let _ = inbox.send((datagram, source));
        }
    }
}

pub struct MemChannel {
    addr: SocketAddr,
    network: MemNetwork,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

#[async_trait]
impl DatagramChannel for MemChannel {
    async fn send_to(&self, datagram: Vec<u8>, to: SocketAddr, _priority: Priority) -> io::Result<()> {
        self.network.route(self.addr, to, datagram);
        Ok(())
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "endpoint disconnected"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Handler with scripted answers that records what it was asked.
#[derive(Default)]
pub struct TestHandler {
    pub pings: AtomicUsize,
    pub find_nodes: AtomicUsize,
    pub store_calls: AtomicUsize,
    pub stored_values: AtomicUsize,
    pub removed: Mutex<Vec<SocketAddr>>,
    pub key_blocks: Mutex<Vec<Vec<u8>>>,
    pub data: Mutex<Vec<DataPacket>>,
    pub find_node_answer: Mutex<Vec<Contact>>,
    pub find_value_answer: Mutex<Option<FindValueResult>>,
    pub store_answer: Mutex<Option<StoreResult>>,
}

impl TestHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RequestHandler for TestHandler {
    fn contact_imported(&self, _contact: &Contact, _is_bootstrap: bool) {}

    fn contact_removed(&self, contact: &Contact) {
        self.removed.lock().unwrap().push(contact.transport_addr());
    }

    async fn ping_request(&self, _from: &Contact) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }

    async fn find_node_request(&self, _from: &Contact, _id: &[u8]) -> Vec<Contact> {
        self.find_nodes.fetch_add(1, Ordering::SeqCst);
        self.find_node_answer.lock().unwrap().clone()
    }

    async fn find_value_request(&self, _from: &Contact, _key: &[u8], _max: u8, _flags: u8) -> FindValueResult {
        self.find_value_answer
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(FindValueResult::Contacts(Vec::new()))
    }

    async fn store_request(&self, _from: &Contact, keys: &[Vec<u8>], values: &[Vec<TransportValue>]) -> StoreResult {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        self.stored_values.fetch_add(values.iter().map(Vec::len).sum(), Ordering::SeqCst);
        self.store_answer
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| StoreResult::Stored(vec![1; keys.len()]))
    }

    async fn query_store_request(
        &self,
        _from: &Contact,
        header_length: u8,
        keys: &[(Vec<u8>, Vec<Vec<u8>>)],
    ) -> QueryStoreResult {
        let entries = keys
            .iter()
            .flat_map(|(prefix, suffixes)| {
                suffixes.iter().map(move |s| (s.first() == Some(&1)).then(|| [prefix.clone(), s.clone()].concat()))
            })
            .collect();
        QueryStoreResult { header_size: header_length, entries }
    }

    async fn key_block_request(&self, _from: &Contact, request: &[u8], _signature: &[u8]) -> bool {
        self.key_blocks.lock().unwrap().push(request.to_vec());
        true
    }

    async fn stats_request(&self, _from: &Contact) -> FullStats {
        FullStats::default()
    }

    fn data_request(&self, _from: &Contact, packet: DataPacket) {
        self.data.lock().unwrap().push(packet);
    }
}

// ============================================================================
// Nodes
// ============================================================================

pub struct TestNode {
    pub transport: DhtTransport,
    pub handler: Arc<TestHandler>,
    pub addr: SocketAddr,
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn config() -> TransportConfig {
    TransportConfig {
        network: NetworkId::BIGLYBT_MAIN,
        request_timeout: Duration::from_secs(2),
        send_delay: Duration::ZERO,
        ..Default::default()
    }
}

/// Start a node whose external address is its bound address.
pub async fn node(network: &MemNetwork, at: &str) -> TestNode {
    let addr = addr(at);
    let config = TransportConfig { bind_address: Some(addr.ip()), port: addr.port(), ..config() };
    node_with(network, addr, config).await
}

pub async fn node_with(network: &MemNetwork, addr: SocketAddr, config: TransportConfig) -> TestNode {
    let handler = TestHandler::new();
    let transport = DhtTransport::builder(config, network.endpoint(addr))
        .start(handler.clone())
        .await
        .expect("transport start");
    TestNode { transport, handler, addr }
}

impl TestNode {
    /// `other` as a contact in this node's view.
    pub fn contact_for(&self, other: &TestNode) -> Contact {
        self.transport.import_contact(other.addr, PROTOCOL_VERSION_CURRENT, false)
    }
}

/// Poll `cond` until it holds, advancing (paused) time between checks.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}
