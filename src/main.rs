use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use dhtudp::{
    Contact, DataPacket, DhtTransport, FindValueResult, FullStats, NetworkId, QueryStoreResult, RequestHandler,
    StoreResult, TransportConfig, TransportListener, TransportValue, UdpChannel, PROTOCOL_VERSION_CURRENT,
};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    version: u8,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, version) = match s.rsplit_once('/') {
            Some((addr, v)) => (addr, v.parse().context("invalid protocol version")?),
            None => (s, PROTOCOL_VERSION_CURRENT),
        };
        let addr: SocketAddr = addr_part.parse().context("invalid socket address (format: IP:PORT[/VERSION])")?;
        Ok(BootstrapPeer { addr, version })
    }
}

#[derive(Parser, Debug)]
#[command(name = "dhtudp")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, default_value_t = default_port())]
    port: u16,

    /// External address, skipping triangulation.
    #[arg(long)]
    explicit_ip: Option<IpAddr>,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// DHT network number.
    #[arg(short, long, default_value_t = 4)]
    network: u32,

    /// Answer only self-lookups, stats and query-store requests.
    #[arg(long)]
    bootstrap_node: bool,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

fn default_port() -> u16 {
    TransportConfig::default().port
}

/// Handler for a node with no routing table or storage of its own: it
/// answers every request with nothing and logs what it saw.
struct LoggingHandler;

#[async_trait]
impl RequestHandler for LoggingHandler {
    fn contact_imported(&self, contact: &Contact, is_bootstrap: bool) {
        debug!(contact = %contact, is_bootstrap, "contact imported");
    }

    fn contact_removed(&self, contact: &Contact) {
        debug!(contact = %contact, "contact removed");
    }

    async fn ping_request(&self, from: &Contact) {
        debug!(from = %from, "ping");
    }

    async fn find_node_request(&self, from: &Contact, id: &[u8]) -> Vec<Contact> {
        debug!(from = %from, id = %hex::encode(id), "find node");
        Vec::new()
    }

    async fn find_value_request(&self, from: &Contact, key: &[u8], _max_values: u8, _flags: u8) -> FindValueResult {
        debug!(from = %from, key = %hex::encode(key), "find value");
        FindValueResult::Contacts(Vec::new())
    }

    async fn store_request(&self, from: &Contact, keys: &[Vec<u8>], _values: &[Vec<TransportValue>]) -> StoreResult {
        debug!(from = %from, keys = keys.len(), "store ignored, no storage");
        StoreResult::Stored(vec![0; keys.len()])
    }

    async fn query_store_request(
        &self,
        from: &Contact,
        header_length: u8,
        keys: &[(Vec<u8>, Vec<Vec<u8>>)],
    ) -> QueryStoreResult {
        debug!(from = %from, prefixes = keys.len(), "query store");
        let suffixes = keys.iter().map(|(_, s)| s.len()).sum();
        QueryStoreResult { header_size: header_length, entries: vec![None; suffixes] }
    }

    async fn key_block_request(&self, from: &Contact, _request: &[u8], _signature: &[u8]) -> bool {
        debug!(from = %from, "key block ignored");
        false
    }

    async fn stats_request(&self, _from: &Contact) -> FullStats {
        FullStats::default()
    }

    fn data_request(&self, from: &Contact, packet: DataPacket) {
        debug!(from = %from, packet_type = packet.packet_type, "data packet");
    }
}

struct LoggingListener;

impl TransportListener for LoggingListener {
    fn local_contact_changed(&self, local: &Contact) {
        info!(contact = %local, "local contact changed");
    }

    fn reachability_changed(&self, reachable: bool) {
        info!(reachable, "reachability changed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = TransportConfig {
        network: NetworkId(args.network),
        port: args.port,
        bind_address: (!args.bind.is_unspecified()).then_some(args.bind),
        explicit_ip: args.explicit_ip,
        bootstrap_node: args.bootstrap_node,
        ..Default::default()
    };

    let bind = SocketAddr::new(args.bind, args.port);
    let channel = UdpChannel::bind(bind, config.send_delay)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;

    let transport = DhtTransport::builder(config, Arc::new(channel))
        .listener(Arc::new(LoggingListener))
        .start(Arc::new(LoggingHandler))
        .await
        .context("failed to start transport")?;
    info!(contact = %transport.local_contact(), "local contact");

    for peer in &args.bootstrap {
        let contact = transport.import_contact(peer.addr, peer.version, true);
        match transport.ping(&contact).await {
            Ok(rtt) => info!(peer = %peer.addr, rtt_ms = rtt.as_millis() as u64, "bootstrap peer answered"),
            Err(e) => warn!(peer = %peer.addr, error = %e, "bootstrap ping failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = interval.tick() => {
                let snapshot = transport.stats();
                info!(
                    reachable = transport.is_reachable(),
                    routable_pct = transport.routable_percentage(),
                    recent_contacts = transport.recent_contacts().len(),
                    packets_sent = snapshot.packets_sent,
                    packets_received = snapshot.packets_received,
                    incoming_requests = snapshot.incoming_requests,
                    aliens = snapshot.aliens,
                    skew_ms = snapshot.average_skew_ms,
                    "telemetry snapshot"
                );
            }
        }
    }

    transport.shutdown();
    Ok(())
}
