//! # dhtudp - Kademlia DHT UDP Transport
//!
//! The transport and RPC layer of a Kademlia DHT speaking the Vuze/BiglyBT
//! UDP wire protocol:
//!
//! - **Wire**: big-endian codec for requests, replies and their payloads,
//!   gated field-by-field on the negotiated protocol version
//! - **RPC**: request/reply matching, timeouts, multi-packet store,
//!   query-store and find-value continuation
//! - **Identity**: node IDs derived from the external address, with spoof
//!   detection on every inbound request
//! - **NAT**: external address triangulation and guarded address changes
//! - **Stats**: per-RPC counters, reachability and routable estimates
//! - **Alternate contacts**: gossip of contacts for other networks
//!
//! ## Architecture
//!
//! A single receive loop classifies datagrams: DHT requests are dispatched to
//! a [`RequestHandler`] on their own tasks, replies complete pending RPC
//! futures, and anything else goes to an optional foreign sink so another
//! protocol can share the socket. Routing tables and storage live above this
//! crate, behind [`RequestHandler`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `transport` | [`DhtTransport`] handle, receive loop, inbound dispatch |
//! | `rpc` | Outbound RPCs, pending table, packet packing |
//! | `messages` | Request/reply types and their encoding |
//! | `wire` | Primitive codec, values, contacts, stats |
//! | `identity` | Node IDs, [`Contact`], node status |
//! | `nat` | External address resolution and change guard |
//! | `stats` | Counters, reachability, contact histories |
//! | `netpos` | Vivaldi network positions |
//! | `altnet` | Alternate-network contact caches |
//! | `filter` | IP filter and bad-address guard |
//! | `socket` | Prioritised UDP [`DatagramChannel`] |
//! | `protocols` | Trait seams to the layers above and below |
//! | `config` | [`TransportConfig`] |
//! | `version` | Protocol versions, networks, vendor IDs |

use std::sync::{Mutex, MutexGuard};

mod altnet;
mod config;
mod filter;
mod identity;
mod messages;
mod nat;
mod netpos;
mod protocols;
mod rpc;
mod socket;
mod stats;
mod transport;
mod version;
mod wire;

pub use altnet::{AltNetworkRegistry, AltNetworkType, AltNetworks, AlternativeContact};
pub use config::TransportConfig;
pub use filter::AddressRejected;
pub use identity::{is_public_ip, Contact, NodeId, NodeStatus, NODE_ID_LEN};
pub use messages::{DataPacket, StatsReply, STATS_TYPE_NP_VER2, STATS_TYPE_ORIGINAL};
pub use netpos::VivaldiPosition;
pub use protocols::{
    AltContactProvider, DatagramChannel, FindValueResult, IpFilter, Priority, PublicAddressSource,
    QueryStoreResult, RequestHandler, StoreResult, TransportListener, UploadStatsSource,
};
pub use rpc::{FindValueResponse, FindValueStream, PeerError, RpcError};
pub use socket::UdpChannel;
pub use stats::StatsSnapshot;
pub use transport::{DhtTransport, TransportBuilder, FOREIGN_SINK_CAPACITY};
pub use version::{NetworkId, PROTOCOL_VERSION_CURRENT};
pub use wire::{ContactInfo, DecodeError, EncodeError, FullStats, NetworkPosition, TransportValue, UploadStats};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
