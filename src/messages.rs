//! # Packets
//!
//! Every datagram is a header plus a payload. Decoding happens in two stages:
//! the header is read first, which fixes the protocol version every later
//! field depends on, then the payload is read for the header's action.
//! Both stages produce immutable values; nothing is patched after decode.
//!
//! ## Actions
//!
//! | Action | Request | Reply |
//! |--------|---------|-------|
//! | ping | 1024 | 1025 |
//! | store | 1026 | 1027 |
//! | find-node | 1028 | 1029 |
//! | find-value | 1030 | 1031 |
//! | stats | 1034 | 1033 |
//! | data | 1035 | (none) |
//! | key-block | 1036 | 1037 |
//! | query-store | 1038 | 1039 |
//! | error | | 1032 |
//!
//! ## Headers
//!
//! ```text
//! request := connection_id(8, high bit set) action(4) transaction_id(4) version(1)
//!            [vendor(1) >=14] [network(4) >=9] [originator_version(1) >=9]
//!            originator_address instance_id(4) time(8) [flags(1) >=51] [flags2(1) >=53]
//! reply   := action(4) transaction_id(4) connection_id(8) version(1)
//!            [vendor(1) >=14] [network(4) >=9] target_instance_id(4)
//!            [flags(1) >=51] [flags2(1) >=53] [processing_time(2) >=54]
//! ```
//!
//! A request's first eight bytes carry the high bit, a reply's first four bytes
//! are an action code. That is how DHT traffic is told apart from the
//! protocol sharing the socket (see [`classify`]).
//!
//! Decoders stop after the fields they know; trailing bytes from newer
//! senders are ignored.

use std::net::SocketAddr;

use crate::altnet::{AlternativeContact, MAX_ALT_CONTACTS, MAX_ALT_REQUESTS, MAX_PROPERTIES_SIZE};
use crate::version::{
    NetworkId, PROTOCOL_VERSION_ALT_CONTACTS, PROTOCOL_VERSION_ANTI_SPOOF, PROTOCOL_VERSION_BBT_UPLOAD_STATS,
    PROTOCOL_VERSION_DIV_AND_CONT, PROTOCOL_VERSION_FIX_ORIGINATOR, PROTOCOL_VERSION_GENERIC_NETPOS,
    PROTOCOL_VERSION_MORE_NODE_STATUS, PROTOCOL_VERSION_NETWORKS, PROTOCOL_VERSION_PACKET_FLAGS,
    PROTOCOL_VERSION_PACKET_FLAGS2, PROTOCOL_VERSION_PROC_TIME, PROTOCOL_VERSION_SIZE_ESTIMATE,
    PROTOCOL_VERSION_VENDOR_ID, PROTOCOL_VERSION_VIVALDI_FINDVALUE, PROTOCOL_VERSION_XFER_STATUS,
    VENDOR_ID_NONE,
};
use crate::wire::{
    ContactInfo, DecodeError, EncodeError, FullStats, NetworkPosition, Reader, TransportValue, UploadStats,
    Writer, MAX_KEY_SIZE, MAX_PACKET_SIZE,
};

pub const ACT_REQUEST_PING: u32 = 1024;
pub const ACT_REPLY_PING: u32 = 1025;
pub const ACT_REQUEST_STORE: u32 = 1026;
pub const ACT_REPLY_STORE: u32 = 1027;
pub const ACT_REQUEST_FIND_NODE: u32 = 1028;
pub const ACT_REPLY_FIND_NODE: u32 = 1029;
pub const ACT_REQUEST_FIND_VALUE: u32 = 1030;
pub const ACT_REPLY_FIND_VALUE: u32 = 1031;
pub const ACT_REPLY_ERROR: u32 = 1032;
pub const ACT_REPLY_STATS: u32 = 1033;
pub const ACT_REQUEST_STATS: u32 = 1034;
pub const ACT_DATA: u32 = 1035;
pub const ACT_REQUEST_KEY_BLOCK: u32 = 1036;
pub const ACT_REPLY_KEY_BLOCK: u32 = 1037;
pub const ACT_REQUEST_QUERY_STORE: u32 = 1038;
pub const ACT_REPLY_QUERY_STORE: u32 = 1039;

/// Error reply types.
pub const ET_ORIGINATOR_ADDRESS_WRONG: u32 = 1;
pub const ET_KEY_BLOCKED: u32 = 2;

/// Stats request types.
pub const STATS_TYPE_ORIGINAL: u32 = 1;
pub const STATS_TYPE_NP_VER2: u32 = 2;

/// Set on every connection id this protocol issues.
pub const CONNECTION_ID_HIGH_BIT: u64 = 1 << 63;

pub const MAX_STORE_KEYS: usize = 255;
pub const MAX_STORE_KEY_SIZE: usize = 255;
pub const MAX_DIVERSIFICATIONS: usize = 255;
pub const MAX_QUERY_PREFIX_SIZE: usize = 255;
pub const MAX_QUERY_PREFIXES: usize = 65535;
pub const MAX_QUERY_SUFFIXES: usize = 65535;
pub const MAX_KEY_BLOCK_REQUEST_SIZE: usize = 255;
pub const MAX_KEY_BLOCK_SIGNATURE_SIZE: usize = 65535;
pub const MAX_DATA_TRANSFER_KEY_SIZE: usize = 64;
pub const MAX_DATA_REQUEST_KEY_SIZE: usize = 255;
pub const MAX_DATA_SIZE: usize = 65535;
pub const MAX_NP_STATS_SIZE: usize = 65535;

const REQUEST_ACTIONS: [u32; 8] = [
    ACT_REQUEST_PING,
    ACT_REQUEST_STORE,
    ACT_REQUEST_FIND_NODE,
    ACT_REQUEST_FIND_VALUE,
    ACT_REQUEST_STATS,
    ACT_DATA,
    ACT_REQUEST_KEY_BLOCK,
    ACT_REQUEST_QUERY_STORE,
];

const REPLY_ACTIONS: [u32; 8] = [
    ACT_REPLY_PING,
    ACT_REPLY_STORE,
    ACT_REPLY_FIND_NODE,
    ACT_REPLY_FIND_VALUE,
    ACT_REPLY_ERROR,
    ACT_REPLY_STATS,
    ACT_REPLY_KEY_BLOCK,
    ACT_REPLY_QUERY_STORE,
];

pub fn is_request_action(action: u32) -> bool {
    REQUEST_ACTIONS.contains(&action)
}

pub fn is_reply_action(action: u32) -> bool {
    REPLY_ACTIONS.contains(&action)
}

/// What a received datagram is, judged from its leading bytes alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatagramKind {
    Request,
    Reply,
    /// Belongs to the protocol sharing the socket.
    Foreign,
}

pub fn classify(datagram: &[u8]) -> DatagramKind {
    if datagram.len() >= 12 && datagram[0] & 0x80 != 0 {
        let action = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
        if is_request_action(action) {
            return DatagramKind::Request;
        }
    }
    if datagram.len() >= 4 {
        let action = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        if is_reply_action(action) {
            return DatagramKind::Reply;
        }
    }
    DatagramKind::Foreign
}

// ============================================================================
// Headers
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub connection_id: u64,
    pub transaction_id: u32,
    pub protocol_version: u8,
    pub vendor_id: u8,
    pub network: NetworkId,
    pub originator_version: u8,
    pub originator_address: SocketAddr,
    pub originator_instance_id: u32,
    /// Sender's clock in milliseconds, for skew estimation.
    pub originator_time: i64,
    pub flags: u8,
    pub flags2: u8,
}

impl RequestHeader {
    fn encode(&self, action: u32, w: &mut Writer) -> Result<(), EncodeError> {
        let v = self.protocol_version;
        w.write_u64(self.connection_id | CONNECTION_ID_HIGH_BIT);
        w.write_u32(action);
        w.write_u32(self.transaction_id);
        w.write_u8(v);
        if v >= PROTOCOL_VERSION_VENDOR_ID {
            w.write_u8(self.vendor_id);
        }
        if v >= PROTOCOL_VERSION_NETWORKS {
            w.write_u32(self.network.0);
        }
        if v >= PROTOCOL_VERSION_FIX_ORIGINATOR {
            w.write_u8(self.originator_version);
        }
        w.write_address(&self.originator_address)?;
        w.write_u32(self.originator_instance_id);
        w.write_i64(self.originator_time);
        if v >= PROTOCOL_VERSION_PACKET_FLAGS {
            w.write_u8(self.flags);
        }
        if v >= PROTOCOL_VERSION_PACKET_FLAGS2 {
            w.write_u8(self.flags2);
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> Result<(u32, Self), DecodeError> {
        let connection_id = r.read_u64()?;
        let action = r.read_u32()?;
        if !is_request_action(action) {
            return Err(DecodeError::UnknownAction(action));
        }
        let transaction_id = r.read_u32()?;
        let protocol_version = r.read_u8()?;
        let vendor_id = if protocol_version >= PROTOCOL_VERSION_VENDOR_ID { r.read_u8()? } else { VENDOR_ID_NONE };
        let network =
            if protocol_version >= PROTOCOL_VERSION_NETWORKS { NetworkId(r.read_u32()?) } else { NetworkId::AZ_MAIN };
        check_version(protocol_version, network)?;
        let originator_version =
            if protocol_version >= PROTOCOL_VERSION_FIX_ORIGINATOR { r.read_u8()? } else { protocol_version };
        let originator_address = r.read_address()?;
        let originator_instance_id = r.read_u32()?;
        let originator_time = r.read_i64()?;
        let flags = if protocol_version >= PROTOCOL_VERSION_PACKET_FLAGS { r.read_u8()? } else { 0 };
        let flags2 = if protocol_version >= PROTOCOL_VERSION_PACKET_FLAGS2 { r.read_u8()? } else { 0 };
        Ok((
            action,
            Self {
                connection_id,
                transaction_id,
                protocol_version,
                vendor_id,
                network,
                originator_version,
                originator_address,
                originator_instance_id,
                originator_time,
                flags,
                flags2,
            },
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyHeader {
    pub transaction_id: u32,
    pub connection_id: u64,
    pub protocol_version: u8,
    pub vendor_id: u8,
    pub network: NetworkId,
    /// Responder's instance id.
    pub target_instance_id: u32,
    pub flags: u8,
    pub flags2: u8,
    /// Milliseconds the responder spent before replying.
    pub processing_time: u16,
}

impl ReplyHeader {
    fn encode(&self, action: u32, w: &mut Writer) {
        let v = self.protocol_version;
        w.write_u32(action);
        w.write_u32(self.transaction_id);
        w.write_u64(self.connection_id);
        w.write_u8(v);
        if v >= PROTOCOL_VERSION_VENDOR_ID {
            w.write_u8(self.vendor_id);
        }
        if v >= PROTOCOL_VERSION_NETWORKS {
            w.write_u32(self.network.0);
        }
        w.write_u32(self.target_instance_id);
        if v >= PROTOCOL_VERSION_PACKET_FLAGS {
            w.write_u8(self.flags);
        }
        if v >= PROTOCOL_VERSION_PACKET_FLAGS2 {
            w.write_u8(self.flags2);
        }
        if v >= PROTOCOL_VERSION_PROC_TIME {
            w.write_u16(self.processing_time);
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<(u32, Self), DecodeError> {
        let action = r.read_u32()?;
        if !is_reply_action(action) {
            return Err(DecodeError::UnknownAction(action));
        }
        let transaction_id = r.read_u32()?;
        let connection_id = r.read_u64()?;
        let protocol_version = r.read_u8()?;
        let vendor_id = if protocol_version >= PROTOCOL_VERSION_VENDOR_ID { r.read_u8()? } else { VENDOR_ID_NONE };
        let network =
            if protocol_version >= PROTOCOL_VERSION_NETWORKS { NetworkId(r.read_u32()?) } else { NetworkId::AZ_MAIN };
        check_version(protocol_version, network)?;
        let target_instance_id = r.read_u32()?;
        let flags = if protocol_version >= PROTOCOL_VERSION_PACKET_FLAGS { r.read_u8()? } else { 0 };
        let flags2 = if protocol_version >= PROTOCOL_VERSION_PACKET_FLAGS2 { r.read_u8()? } else { 0 };
        let processing_time = if protocol_version >= PROTOCOL_VERSION_PROC_TIME { r.read_u16()? } else { 0 };
        Ok((
            action,
            Self {
                transaction_id,
                connection_id,
                protocol_version,
                vendor_id,
                network,
                target_instance_id,
                flags,
                flags2,
                processing_time,
            },
        ))
    }
}

fn check_version(version: u8, network: NetworkId) -> Result<(), DecodeError> {
    let minimum = network.min_protocol_version();
    if version < minimum {
        return Err(DecodeError::VersionTooLow { version, minimum, network: network.0 });
    }
    Ok(())
}

// ============================================================================
// Payloads
// ============================================================================

/// Transfer-protocol chunk. Carried one-way; the transfer layer pairs
/// requests and replies itself by `packet_type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    pub packet_type: u8,
    pub transfer_key: Vec<u8>,
    pub request_key: Vec<u8>,
    pub data: Vec<u8>,
    pub start_position: u32,
    pub length: u32,
    pub total_length: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Ping {
        /// (network, count) pairs asked of the responder.
        alt_request: Vec<(u8, u8)>,
        upload_stats: Option<UploadStats>,
    },
    Store {
        /// Anti-spoof token echoed back from an earlier find-node reply.
        random_id: u32,
        keys: Vec<Vec<u8>>,
        value_sets: Vec<Vec<TransportValue>>,
    },
    FindNode {
        id: Vec<u8>,
        node_status: u32,
        estimated_dht_size: u32,
        upload_stats: Option<UploadStats>,
    },
    FindValue {
        key: Vec<u8>,
        flags: u8,
        max_values: u8,
    },
    Stats {
        stats_type: u32,
    },
    Data(DataPacket),
    KeyBlock {
        random_id: u32,
        request: Vec<u8>,
        signature: Vec<u8>,
    },
    QueryStore {
        header_length: u8,
        /// Shared prefix with the suffixes completing it to `header_length`.
        keys: Vec<(Vec<u8>, Vec<Vec<u8>>)>,
    },
}

impl RequestBody {
    pub fn action(&self) -> u32 {
        match self {
            RequestBody::Ping { .. } => ACT_REQUEST_PING,
            RequestBody::Store { .. } => ACT_REQUEST_STORE,
            RequestBody::FindNode { .. } => ACT_REQUEST_FIND_NODE,
            RequestBody::FindValue { .. } => ACT_REQUEST_FIND_VALUE,
            RequestBody::Stats { .. } => ACT_REQUEST_STATS,
            RequestBody::Data(_) => ACT_DATA,
            RequestBody::KeyBlock { .. } => ACT_REQUEST_KEY_BLOCK,
            RequestBody::QueryStore { .. } => ACT_REQUEST_QUERY_STORE,
        }
    }

    fn encode(&self, v: u8, w: &mut Writer) -> Result<(), EncodeError> {
        match self {
            RequestBody::Ping { alt_request, upload_stats } => {
                if v >= PROTOCOL_VERSION_ALT_CONTACTS {
                    w.write_length(alt_request.len(), MAX_ALT_REQUESTS)?;
                    for (network, count) in alt_request {
                        w.write_u8(*network);
                        w.write_u8(*count);
                    }
                }
                if v >= PROTOCOL_VERSION_BBT_UPLOAD_STATS {
                    w.write_upload_stats(upload_stats.as_ref());
                }
            }
            RequestBody::Store { random_id, keys, value_sets } => {
                if v >= PROTOCOL_VERSION_ANTI_SPOOF {
                    w.write_u32(*random_id);
                }
                w.write_length(keys.len(), MAX_STORE_KEYS)?;
                for key in keys {
                    w.write_bytes(key, MAX_STORE_KEY_SIZE)?;
                }
                w.write_length(value_sets.len(), MAX_STORE_KEYS)?;
                for values in value_sets {
                    w.write_values(v, values)?;
                }
            }
            RequestBody::FindNode { id, node_status, estimated_dht_size, upload_stats } => {
                w.write_bytes(id, MAX_KEY_SIZE)?;
                if v >= PROTOCOL_VERSION_MORE_NODE_STATUS {
                    w.write_u32(*node_status);
                    w.write_u32(*estimated_dht_size);
                }
                if v >= PROTOCOL_VERSION_BBT_UPLOAD_STATS {
                    w.write_upload_stats(upload_stats.as_ref());
                }
            }
            RequestBody::FindValue { key, flags, max_values } => {
                w.write_bytes(key, MAX_KEY_SIZE)?;
                w.write_u8(*flags);
                w.write_u8(*max_values);
            }
            RequestBody::Stats { stats_type } => {
                if v >= PROTOCOL_VERSION_GENERIC_NETPOS {
                    w.write_u32(*stats_type);
                }
            }
            RequestBody::Data(data) => {
                w.write_u8(data.packet_type);
                w.write_bytes(&data.transfer_key, MAX_DATA_TRANSFER_KEY_SIZE)?;
                w.write_bytes(&data.request_key, MAX_DATA_REQUEST_KEY_SIZE)?;
                w.write_bytes(&data.data, MAX_DATA_SIZE)?;
                w.write_u32(data.start_position);
                w.write_u32(data.length);
                w.write_u32(data.total_length);
            }
            RequestBody::KeyBlock { random_id, request, signature } => {
                if v >= PROTOCOL_VERSION_ANTI_SPOOF {
                    w.write_u32(*random_id);
                }
                w.write_bytes(request, MAX_KEY_BLOCK_REQUEST_SIZE)?;
                w.write_bytes(signature, MAX_KEY_BLOCK_SIGNATURE_SIZE)?;
            }
            RequestBody::QueryStore { header_length, keys } => {
                w.write_u8(*header_length);
                w.write_length(keys.len(), MAX_QUERY_PREFIXES)?;
                for (prefix, suffixes) in keys {
                    let suffix_len = (*header_length as usize)
                        .checked_sub(prefix.len())
                        .ok_or(EncodeError::LengthExceeded { len: prefix.len(), max: *header_length as usize })?;
                    w.write_bytes(prefix, MAX_QUERY_PREFIX_SIZE)?;
                    w.write_length(suffixes.len(), MAX_QUERY_SUFFIXES)?;
                    for suffix in suffixes {
                        if suffix.len() != suffix_len {
                            return Err(EncodeError::LengthExceeded { len: suffix.len(), max: suffix_len });
                        }
                        w.write_raw(suffix);
                    }
                }
            }
        }
        Ok(())
    }

    fn decode(action: u32, v: u8, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let body = match action {
            ACT_REQUEST_PING => {
                let mut alt_request = Vec::new();
                if v >= PROTOCOL_VERSION_ALT_CONTACTS {
                    let count = r.read_length(MAX_ALT_REQUESTS)?;
                    for _ in 0..count {
                        alt_request.push((r.read_u8()?, r.read_u8()?));
                    }
                }
                let upload_stats = if v >= PROTOCOL_VERSION_BBT_UPLOAD_STATS { r.read_upload_stats()? } else { None };
                RequestBody::Ping { alt_request, upload_stats }
            }
            ACT_REQUEST_STORE => {
                let random_id = if v >= PROTOCOL_VERSION_ANTI_SPOOF { r.read_u32()? } else { 0 };
                let key_count = r.read_length(MAX_STORE_KEYS)?;
                let mut keys = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    keys.push(r.read_bytes(MAX_STORE_KEY_SIZE)?);
                }
                let set_count = r.read_length(MAX_STORE_KEYS)?;
                let mut value_sets = Vec::with_capacity(set_count);
                for _ in 0..set_count {
                    value_sets.push(r.read_values(v)?);
                }
                RequestBody::Store { random_id, keys, value_sets }
            }
            ACT_REQUEST_FIND_NODE => {
                let id = r.read_bytes(MAX_KEY_SIZE)?;
                let (node_status, estimated_dht_size) = if v >= PROTOCOL_VERSION_MORE_NODE_STATUS {
                    (r.read_u32()?, r.read_u32()?)
                } else {
                    (0, 0)
                };
                let upload_stats = if v >= PROTOCOL_VERSION_BBT_UPLOAD_STATS { r.read_upload_stats()? } else { None };
                RequestBody::FindNode { id, node_status, estimated_dht_size, upload_stats }
            }
            ACT_REQUEST_FIND_VALUE => RequestBody::FindValue {
                key: r.read_bytes(MAX_KEY_SIZE)?,
                flags: r.read_u8()?,
                max_values: r.read_u8()?,
            },
            ACT_REQUEST_STATS => RequestBody::Stats {
                stats_type: if v >= PROTOCOL_VERSION_GENERIC_NETPOS { r.read_u32()? } else { STATS_TYPE_ORIGINAL },
            },
            ACT_DATA => RequestBody::Data(DataPacket {
                packet_type: r.read_u8()?,
                transfer_key: r.read_bytes(MAX_DATA_TRANSFER_KEY_SIZE)?,
                request_key: r.read_bytes(MAX_DATA_REQUEST_KEY_SIZE)?,
                data: r.read_bytes(MAX_DATA_SIZE)?,
                start_position: r.read_u32()?,
                length: r.read_u32()?,
                total_length: r.read_u32()?,
            }),
            ACT_REQUEST_KEY_BLOCK => RequestBody::KeyBlock {
                random_id: if v >= PROTOCOL_VERSION_ANTI_SPOOF { r.read_u32()? } else { 0 },
                request: r.read_bytes(MAX_KEY_BLOCK_REQUEST_SIZE)?,
                signature: r.read_bytes(MAX_KEY_BLOCK_SIGNATURE_SIZE)?,
            },
            ACT_REQUEST_QUERY_STORE => {
                let header_length = r.read_u8()?;
                let prefix_count = r.read_length(MAX_QUERY_PREFIXES)?;
                let mut keys = Vec::with_capacity(prefix_count.min(64));
                for _ in 0..prefix_count {
                    let prefix = r.read_bytes(MAX_QUERY_PREFIX_SIZE)?;
                    let suffix_len = (header_length as usize)
                        .checked_sub(prefix.len())
                        .ok_or(DecodeError::LengthExceeded { len: prefix.len(), max: header_length as usize })?;
                    let suffix_count = r.read_length(MAX_QUERY_SUFFIXES)?;
                    let mut suffixes = Vec::with_capacity(suffix_count.min(256));
                    for _ in 0..suffix_count {
                        suffixes.push(r.read_raw(suffix_len)?.to_vec());
                    }
                    keys.push((prefix, suffixes));
                }
                RequestBody::QueryStore { header_length, keys }
            }
            other => return Err(DecodeError::UnknownAction(other)),
        };
        Ok(body)
    }
}

/// Find-value answer on the wire: values or closer contacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueReply {
    Values { values: Vec<TransportValue>, diversification: u8 },
    Contacts(Vec<ContactInfo>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatsReply {
    Full(FullStats),
    /// Any other stats type, carried as opaque bytes.
    Opaque { stats_type: u32, data: Vec<u8> },
}

/// Typed error reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorReply {
    /// The requester's claimed address differs from what the responder saw.
    OriginatorAddressWrong(SocketAddr),
    KeyBlocked { request: Vec<u8>, signature: Vec<u8> },
    Other(u32),
}

impl ErrorReply {
    pub fn error_type(&self) -> u32 {
        match self {
            ErrorReply::OriginatorAddressWrong(_) => ET_ORIGINATOR_ADDRESS_WRONG,
            ErrorReply::KeyBlocked { .. } => ET_KEY_BLOCKED,
            ErrorReply::Other(t) => *t,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReplyBody {
    Ping {
        network_positions: Vec<NetworkPosition>,
        alt_contacts: Vec<AlternativeContact>,
        upload_stats: Option<UploadStats>,
    },
    Store {
        diversifications: Vec<u8>,
    },
    FindNode {
        random_id: u32,
        node_status: u32,
        estimated_dht_size: u32,
        network_positions: Vec<NetworkPosition>,
        contacts: Vec<ContactInfo>,
        upload_stats: Option<UploadStats>,
    },
    FindValue {
        /// More sub-replies follow for the same request.
        has_continuation: bool,
        result: FindValueReply,
        network_positions: Vec<NetworkPosition>,
    },
    Stats(StatsReply),
    KeyBlock,
    QueryStore {
        random_id: u32,
        header_size: u8,
        entries: Vec<Option<Vec<u8>>>,
    },
    Error(ErrorReply),
}

impl ReplyBody {
    pub fn action(&self) -> u32 {
        match self {
            ReplyBody::Ping { .. } => ACT_REPLY_PING,
            ReplyBody::Store { .. } => ACT_REPLY_STORE,
            ReplyBody::FindNode { .. } => ACT_REPLY_FIND_NODE,
            ReplyBody::FindValue { .. } => ACT_REPLY_FIND_VALUE,
            ReplyBody::Stats(_) => ACT_REPLY_STATS,
            ReplyBody::KeyBlock => ACT_REPLY_KEY_BLOCK,
            ReplyBody::QueryStore { .. } => ACT_REPLY_QUERY_STORE,
            ReplyBody::Error(_) => ACT_REPLY_ERROR,
        }
    }

    fn encode(&self, v: u8, w: &mut Writer) -> Result<(), EncodeError> {
        match self {
            ReplyBody::Ping { network_positions, alt_contacts, upload_stats } => {
                if v >= PROTOCOL_VERSION_GENERIC_NETPOS {
                    w.write_network_positions(network_positions)?;
                }
                if v >= PROTOCOL_VERSION_ALT_CONTACTS {
                    w.write_length(alt_contacts.len(), MAX_ALT_CONTACTS)?;
                    for contact in alt_contacts {
                        w.write_u8(contact.network().code());
                        w.write_u8(contact.version());
                        w.write_u16(contact.age_secs());
                        w.write_bytes(contact.encoded_properties(), MAX_PROPERTIES_SIZE)?;
                    }
                }
                if v >= PROTOCOL_VERSION_BBT_UPLOAD_STATS {
                    w.write_upload_stats(upload_stats.as_ref());
                }
            }
            ReplyBody::Store { diversifications } => {
                if v >= PROTOCOL_VERSION_DIV_AND_CONT {
                    w.write_bytes(diversifications, MAX_DIVERSIFICATIONS)?;
                }
            }
            ReplyBody::FindNode {
                random_id,
                node_status,
                estimated_dht_size,
                network_positions,
                contacts,
                upload_stats,
            } => {
                if v >= PROTOCOL_VERSION_ANTI_SPOOF {
                    w.write_u32(*random_id);
                }
                if v >= PROTOCOL_VERSION_XFER_STATUS {
                    w.write_u32(*node_status);
                }
                if v >= PROTOCOL_VERSION_SIZE_ESTIMATE {
                    w.write_u32(*estimated_dht_size);
                }
                if v >= PROTOCOL_VERSION_GENERIC_NETPOS {
                    w.write_network_positions(network_positions)?;
                }
                w.write_contacts(contacts)?;
                if v >= PROTOCOL_VERSION_BBT_UPLOAD_STATS {
                    w.write_upload_stats(upload_stats.as_ref());
                }
            }
            ReplyBody::FindValue { has_continuation, result, network_positions } => {
                if v >= PROTOCOL_VERSION_DIV_AND_CONT {
                    w.write_bool(*has_continuation);
                }
                match result {
                    FindValueReply::Values { values, diversification } => {
                        w.write_bool(true);
                        if v >= PROTOCOL_VERSION_DIV_AND_CONT {
                            w.write_u8(*diversification);
                        }
                        w.write_values(v, values)?;
                    }
                    FindValueReply::Contacts(contacts) => {
                        w.write_bool(false);
                        w.write_contacts(contacts)?;
                    }
                }
                if v >= PROTOCOL_VERSION_VIVALDI_FINDVALUE {
                    w.write_network_positions(network_positions)?;
                }
            }
            ReplyBody::Stats(stats) => match stats {
                StatsReply::Full(full) => {
                    if v >= PROTOCOL_VERSION_GENERIC_NETPOS {
                        w.write_u32(STATS_TYPE_ORIGINAL);
                    }
                    w.write_full_stats(v, full)?;
                }
                StatsReply::Opaque { stats_type, data } => {
                    w.write_u32(*stats_type);
                    w.write_bytes(data, MAX_NP_STATS_SIZE)?;
                }
            },
            ReplyBody::KeyBlock => {}
            ReplyBody::QueryStore { random_id, header_size, entries } => {
                w.write_u32(*random_id);
                w.write_u8(*header_size);
                w.write_length(entries.len(), MAX_QUERY_SUFFIXES)?;
                let mut bitmap = vec![0u8; entries.len().div_ceil(8)];
                for (i, entry) in entries.iter().enumerate() {
                    if entry.is_some() {
                        bitmap[i / 8] |= 0x80 >> (i % 8);
                    }
                }
                w.write_raw(&bitmap);
                for entry in entries.iter().flatten() {
                    w.write_bytes(entry, MAX_QUERY_PREFIX_SIZE)?;
                }
            }
            ReplyBody::Error(error) => {
                w.write_u32(error.error_type());
                match error {
                    ErrorReply::OriginatorAddressWrong(addr) => w.write_address(addr)?,
                    ErrorReply::KeyBlocked { request, signature } => {
                        w.write_bytes(request, MAX_KEY_BLOCK_REQUEST_SIZE)?;
                        w.write_bytes(signature, MAX_KEY_BLOCK_SIGNATURE_SIZE)?;
                    }
                    ErrorReply::Other(_) => {}
                }
            }
        }
        Ok(())
    }

    fn decode(action: u32, v: u8, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let body = match action {
            ACT_REPLY_PING => {
                let network_positions =
                    if v >= PROTOCOL_VERSION_GENERIC_NETPOS { r.read_network_positions()? } else { Vec::new() };
                let mut alt_contacts = Vec::new();
                if v >= PROTOCOL_VERSION_ALT_CONTACTS {
                    let count = r.read_length(MAX_ALT_CONTACTS)?;
                    for _ in 0..count {
                        let network = r.read_u8()?;
                        let version = r.read_u8()?;
                        let age = r.read_u16()?;
                        let encoded = r.read_bytes(MAX_PROPERTIES_SIZE)?;
                        // one bad entry does not spoil the rest
                        if let Ok(contact) = AlternativeContact::from_wire(network, version, age, encoded) {
                            alt_contacts.push(contact);
                        }
                    }
                }
                let upload_stats = if v >= PROTOCOL_VERSION_BBT_UPLOAD_STATS { r.read_upload_stats()? } else { None };
                ReplyBody::Ping { network_positions, alt_contacts, upload_stats }
            }
            ACT_REPLY_STORE => ReplyBody::Store {
                diversifications: if v >= PROTOCOL_VERSION_DIV_AND_CONT {
                    r.read_bytes(MAX_DIVERSIFICATIONS)?
                } else {
                    Vec::new()
                },
            },
            ACT_REPLY_FIND_NODE => {
                let random_id = if v >= PROTOCOL_VERSION_ANTI_SPOOF { r.read_u32()? } else { 0 };
                let node_status = if v >= PROTOCOL_VERSION_XFER_STATUS { r.read_u32()? } else { 0xffff_ffff };
                let estimated_dht_size = if v >= PROTOCOL_VERSION_SIZE_ESTIMATE { r.read_u32()? } else { 0 };
                let network_positions =
                    if v >= PROTOCOL_VERSION_GENERIC_NETPOS { r.read_network_positions()? } else { Vec::new() };
                let contacts = r.read_contacts()?;
                let upload_stats = if v >= PROTOCOL_VERSION_BBT_UPLOAD_STATS { r.read_upload_stats()? } else { None };
                ReplyBody::FindNode {
                    random_id,
                    node_status,
                    estimated_dht_size,
                    network_positions,
                    contacts,
                    upload_stats,
                }
            }
            ACT_REPLY_FIND_VALUE => {
                let has_continuation = v >= PROTOCOL_VERSION_DIV_AND_CONT && r.read_bool()?;
                let result = if r.read_bool()? {
                    let diversification = if v >= PROTOCOL_VERSION_DIV_AND_CONT { r.read_u8()? } else { 0 };
                    FindValueReply::Values { values: r.read_values(v)?, diversification }
                } else {
                    FindValueReply::Contacts(r.read_contacts()?)
                };
                let network_positions =
                    if v >= PROTOCOL_VERSION_VIVALDI_FINDVALUE { r.read_network_positions()? } else { Vec::new() };
                ReplyBody::FindValue { has_continuation, result, network_positions }
            }
            ACT_REPLY_STATS => {
                let stats_type = if v >= PROTOCOL_VERSION_GENERIC_NETPOS { r.read_u32()? } else { STATS_TYPE_ORIGINAL };
                if stats_type == STATS_TYPE_ORIGINAL {
                    ReplyBody::Stats(StatsReply::Full(r.read_full_stats(v)?))
                } else {
                    ReplyBody::Stats(StatsReply::Opaque { stats_type, data: r.read_bytes(MAX_NP_STATS_SIZE)? })
                }
            }
            ACT_REPLY_KEY_BLOCK => ReplyBody::KeyBlock,
            ACT_REPLY_QUERY_STORE => {
                let random_id = r.read_u32()?;
                let header_size = r.read_u8()?;
                let count = r.read_length(MAX_QUERY_SUFFIXES)?;
                let bitmap = r.read_raw(count.div_ceil(8))?;
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    if bitmap[i / 8] & (0x80 >> (i % 8)) != 0 {
                        entries.push(Some(r.read_bytes(MAX_QUERY_PREFIX_SIZE)?));
                    } else {
                        entries.push(None);
                    }
                }
                ReplyBody::QueryStore { random_id, header_size, entries }
            }
            ACT_REPLY_ERROR => {
                let error = match r.read_u32()? {
                    ET_ORIGINATOR_ADDRESS_WRONG => ErrorReply::OriginatorAddressWrong(r.read_address()?),
                    ET_KEY_BLOCKED => ErrorReply::KeyBlocked {
                        request: r.read_bytes(MAX_KEY_BLOCK_REQUEST_SIZE)?,
                        signature: r.read_bytes(MAX_KEY_BLOCK_SIGNATURE_SIZE)?,
                    },
                    other => ErrorReply::Other(other),
                };
                ReplyBody::Error(error)
            }
            other => return Err(DecodeError::UnknownAction(other)),
        };
        Ok(body)
    }
}

// ============================================================================
// Packets
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub header: RequestHeader,
    pub body: RequestBody,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub header: ReplyHeader,
    pub body: ReplyBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Request(Request),
    Reply(Reply),
}

impl Packet {
    /// Serialize, failing if the result exceeds one datagram.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = Writer::new();
        match self {
            Packet::Request(req) => {
                req.header.encode(req.body.action(), &mut w)?;
                req.body.encode(req.header.protocol_version, &mut w)?;
            }
            Packet::Reply(reply) => {
                reply.header.encode(reply.body.action(), &mut w);
                reply.body.encode(reply.header.protocol_version, &mut w)?;
            }
        }
        if w.len() > MAX_PACKET_SIZE {
            return Err(EncodeError::PacketTooLarge { size: w.len(), max: MAX_PACKET_SIZE });
        }
        Ok(w.into_bytes())
    }
}

pub fn decode(datagram: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = Reader::new(datagram);
    match classify(datagram) {
        DatagramKind::Request => {
            let (action, header) = RequestHeader::decode(&mut r)?;
            let body = RequestBody::decode(action, header.protocol_version, &mut r)?;
            Ok(Packet::Request(Request { header, body }))
        }
        DatagramKind::Reply => {
            let (action, header) = ReplyHeader::decode(&mut r)?;
            let body = ReplyBody::decode(action, header.protocol_version, &mut r)?;
            Ok(Packet::Reply(Reply { header, body }))
        }
        DatagramKind::Foreign => Err(DecodeError::NotDhtPacket),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::altnet::AltNetworkType;
    use crate::version::{PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN_AZ, VENDOR_ID_SELF};
    use crate::wire::CountryStat;

    fn request_header(version: u8) -> RequestHeader {
        RequestHeader {
            connection_id: 0x0123_4567_89ab_cdef | CONNECTION_ID_HIGH_BIT,
            transaction_id: 77,
            protocol_version: version,
            vendor_id: VENDOR_ID_SELF,
            network: NetworkId::AZ_MAIN,
            originator_version: version,
            originator_address: "203.0.113.5:6881".parse().unwrap(),
            originator_instance_id: 0xdead_beef,
            originator_time: 1_700_000_000_000,
            flags: 1,
            flags2: 2,
        }
    }

    fn reply_header(version: u8) -> ReplyHeader {
        ReplyHeader {
            transaction_id: 77,
            connection_id: 0x0123_4567_89ab_cdef | CONNECTION_ID_HIGH_BIT,
            protocol_version: version,
            vendor_id: VENDOR_ID_SELF,
            network: NetworkId::AZ_MAIN,
            target_instance_id: 42,
            flags: 1,
            flags2: 2,
            processing_time: 15,
        }
    }

    fn value(version: u8) -> TransportValue {
        TransportValue {
            version: 3,
            created: 1_700_000_000_000,
            value: b"peer-list".to_vec(),
            originator: ContactInfo { version, address: "198.51.100.7:6881".parse().unwrap() },
            flags: 0,
            life_hours: 4,
            replication_control: 1,
        }
    }

    fn upload_stats() -> UploadStats {
        UploadStats {
            received_total: 10.0,
            sent_total: 20.0,
            received: vec![CountryStat { cc: *b"NZ", rate: 1.5 }],
            sent: vec![],
        }
    }

    fn round_trip(packet: Packet) -> Packet {
        let bytes = packet.encode().expect("encode");
        decode(&bytes).expect("decode")
    }

    #[test]
    fn classify_by_leading_bytes() {
        let ping = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_CURRENT),
            body: RequestBody::Ping { alt_request: vec![], upload_stats: None },
        });
        assert_eq!(classify(&ping.encode().unwrap()), DatagramKind::Request);

        let reply = Packet::Reply(Reply { header: reply_header(PROTOCOL_VERSION_CURRENT), body: ReplyBody::KeyBlock });
        assert_eq!(classify(&reply.encode().unwrap()), DatagramKind::Reply);

        assert_eq!(classify(b"d1:ad2:id20:"), DatagramKind::Foreign);
        assert_eq!(classify(&[]), DatagramKind::Foreign);
        assert_eq!(decode(b"d1:ad2:id20:"), Err(DecodeError::NotDhtPacket));
    }

    #[test]
    fn request_header_fields_follow_version() {
        for version in PROTOCOL_VERSION_MIN_AZ..=PROTOCOL_VERSION_CURRENT {
            let packet = Packet::Request(Request {
                header: request_header(version),
                body: RequestBody::FindValue { key: vec![9; 20], flags: 1, max_values: 32 },
            });
            let Packet::Request(decoded) = round_trip(packet) else { panic!("expected request") };
            let h = decoded.header;
            assert_eq!(h.originator_address, "203.0.113.5:6881".parse().unwrap());
            assert_eq!(h.originator_instance_id, 0xdead_beef);
            assert_eq!(h.vendor_id, if version >= PROTOCOL_VERSION_VENDOR_ID { VENDOR_ID_SELF } else { VENDOR_ID_NONE });
            assert_eq!(h.flags, if version >= PROTOCOL_VERSION_PACKET_FLAGS { 1 } else { 0 });
            assert_eq!(h.flags2, if version >= PROTOCOL_VERSION_PACKET_FLAGS2 { 2 } else { 0 });
            assert_eq!(decoded.body, RequestBody::FindValue { key: vec![9; 20], flags: 1, max_values: 32 });
        }
    }

    #[test]
    fn reply_header_fields_follow_version() {
        for version in PROTOCOL_VERSION_MIN_AZ..=PROTOCOL_VERSION_CURRENT {
            let packet = Packet::Reply(Reply {
                header: reply_header(version),
                body: ReplyBody::Store { diversifications: vec![1, 2] },
            });
            let Packet::Reply(decoded) = round_trip(packet) else { panic!("expected reply") };
            assert_eq!(decoded.header.target_instance_id, 42);
            assert_eq!(
                decoded.header.processing_time,
                if version >= PROTOCOL_VERSION_PROC_TIME { 15 } else { 0 }
            );
            assert_eq!(decoded.body, ReplyBody::Store { diversifications: vec![1, 2] });
        }
    }

    #[test]
    fn version_below_network_minimum_rejected() {
        let mut header = request_header(PROTOCOL_VERSION_CURRENT);
        header.protocol_version = 40;
        header.network = NetworkId::AZ_CVS;
        let bytes = Packet::Request(Request { header, body: RequestBody::Stats { stats_type: 1 } })
            .encode()
            .unwrap();
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::VersionTooLow { version: 40, minimum: 51, network: 1 })
        );

        // below 9 the network is implied and the main minimum applies
        let bytes = Packet::Request(Request { header: request_header(8), body: RequestBody::Stats { stats_type: 1 } })
            .encode()
            .unwrap();
        assert!(matches!(decode(&bytes), Err(DecodeError::VersionTooLow { version: 8, .. })));
    }

    #[test]
    fn ping_round_trip_with_alt_contacts_and_stats() {
        let alt = AlternativeContact::for_socket_addr(AltNetworkType::BiglybtV4, 55, "203.0.113.20:6881".parse().unwrap())
            .unwrap();
        let reply = Packet::Reply(Reply {
            header: reply_header(PROTOCOL_VERSION_CURRENT),
            body: ReplyBody::Ping {
                network_positions: vec![NetworkPosition { kind: 5, data: vec![0; 16] }],
                alt_contacts: vec![alt.clone()],
                upload_stats: Some(upload_stats()),
            },
        });
        let Packet::Reply(Reply { body: ReplyBody::Ping { network_positions, alt_contacts, upload_stats: stats }, .. }) =
            round_trip(reply)
        else {
            panic!("expected ping reply")
        };
        assert_eq!(network_positions.len(), 1);
        assert_eq!(alt_contacts, vec![alt]);
        assert_eq!(alt_contacts[0].socket_addr(), Some("203.0.113.20:6881".parse().unwrap()));
        assert_eq!(stats, Some(upload_stats()));

        let request = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_ALT_CONTACTS),
            body: RequestBody::Ping { alt_request: vec![(5, 4), (3, 2)], upload_stats: Some(upload_stats()) },
        });
        // upload stats are not carried below 55
        let Packet::Request(decoded) = round_trip(request) else { panic!("expected request") };
        assert_eq!(decoded.header.flags2, 0);
        assert_eq!(decoded.body, RequestBody::Ping { alt_request: vec![(5, 4), (3, 2)], upload_stats: None });
    }

    #[test]
    fn store_round_trip() {
        for version in [PROTOCOL_VERSION_MIN_AZ, 23, PROTOCOL_VERSION_CURRENT] {
            let body = RequestBody::Store {
                random_id: 99,
                keys: vec![vec![1; 20], vec![2; 20]],
                value_sets: vec![vec![value(version)], vec![value(version), value(version)]],
            };
            let Packet::Request(decoded) =
                round_trip(Packet::Request(Request { header: request_header(version), body }))
            else {
                panic!("expected request")
            };
            let RequestBody::Store { random_id, keys, value_sets } = decoded.body else { panic!("expected store") };
            assert_eq!(random_id, 99);
            assert_eq!(keys.len(), 2);
            assert_eq!(value_sets[1].len(), 2);
            let v = &value_sets[0][0];
            assert_eq!(v.value, b"peer-list");
            assert_eq!(v.version, if version >= 11 { 3 } else { 0 });
            assert_eq!(v.life_hours, if version >= 23 { 4 } else { 0 });
            assert_eq!(v.replication_control, if version >= 24 { 1 } else { 0 });
        }
    }

    #[test]
    fn find_node_reply_fields() {
        let contacts = vec![
            ContactInfo { version: 55, address: "203.0.113.1:1".parse().unwrap() },
            ContactInfo { version: 55, address: "[2001:db8::1]:2".parse().unwrap() },
        ];
        let reply = Packet::Reply(Reply {
            header: reply_header(PROTOCOL_VERSION_CURRENT),
            body: ReplyBody::FindNode {
                random_id: 5,
                node_status: 1,
                estimated_dht_size: 1_000_000,
                network_positions: vec![],
                contacts: contacts.clone(),
                upload_stats: None,
            },
        });
        let Packet::Reply(Reply { body: ReplyBody::FindNode { random_id, estimated_dht_size, contacts: got, .. }, .. }) =
            round_trip(reply)
        else {
            panic!("expected find-node reply")
        };
        assert_eq!(random_id, 5);
        assert_eq!(estimated_dht_size, 1_000_000);
        assert_eq!(got, contacts);
    }

    #[test]
    fn find_value_reply_variants() {
        let values = Packet::Reply(Reply {
            header: reply_header(PROTOCOL_VERSION_CURRENT),
            body: ReplyBody::FindValue {
                has_continuation: true,
                result: FindValueReply::Values { values: vec![value(55)], diversification: 2 },
                network_positions: vec![],
            },
        });
        assert_eq!(round_trip(values.clone()), values);

        let contacts = Packet::Reply(Reply {
            header: reply_header(PROTOCOL_VERSION_CURRENT),
            body: ReplyBody::FindValue {
                has_continuation: false,
                result: FindValueReply::Contacts(vec![ContactInfo {
                    version: 50,
                    address: "198.51.100.2:7000".parse().unwrap(),
                }]),
                network_positions: vec![],
            },
        });
        assert_eq!(round_trip(contacts.clone()), contacts);
    }

    #[test]
    fn query_store_bitmap() {
        let request = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_CURRENT),
            body: RequestBody::QueryStore {
                header_length: 6,
                keys: vec![(vec![1, 2], vec![vec![3, 4, 5, 6], vec![7, 8, 9, 10]]), (vec![9; 6], vec![vec![]])],
            },
        });
        assert_eq!(round_trip(request.clone()), request);

        let mut entries = vec![None; 10];
        entries[0] = Some(vec![1; 6]);
        entries[9] = Some(vec![2; 6]);
        let reply = Packet::Reply(Reply {
            header: reply_header(PROTOCOL_VERSION_CURRENT),
            body: ReplyBody::QueryStore { random_id: 3, header_size: 6, entries },
        });
        assert_eq!(round_trip(reply.clone()), reply);
    }

    #[test]
    fn query_store_suffix_length_enforced() {
        let request = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_CURRENT),
            body: RequestBody::QueryStore { header_length: 4, keys: vec![(vec![1, 2], vec![vec![3]])] },
        });
        assert!(matches!(request.encode(), Err(EncodeError::LengthExceeded { len: 1, max: 2 })));
    }

    #[test]
    fn error_replies() {
        for error in [
            ErrorReply::OriginatorAddressWrong("203.0.113.99:6881".parse().unwrap()),
            ErrorReply::KeyBlocked { request: vec![1; 10], signature: vec![2; 300] },
            ErrorReply::Other(7),
        ] {
            let reply = Packet::Reply(Reply { header: reply_header(PROTOCOL_VERSION_CURRENT), body: ReplyBody::Error(error) });
            assert_eq!(round_trip(reply.clone()), reply);
        }
    }

    #[test]
    fn stats_and_data_round_trip() {
        let stats = Packet::Reply(Reply {
            header: reply_header(PROTOCOL_VERSION_CURRENT),
            body: ReplyBody::Stats(StatsReply::Full(FullStats { router_nodes: 12, ..FullStats::default() })),
        });
        assert_eq!(round_trip(stats.clone()), stats);

        let opaque = Packet::Reply(Reply {
            header: reply_header(PROTOCOL_VERSION_CURRENT),
            body: ReplyBody::Stats(StatsReply::Opaque { stats_type: STATS_TYPE_NP_VER2, data: vec![1, 2, 3] }),
        });
        assert_eq!(round_trip(opaque.clone()), opaque);

        let data = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_CURRENT),
            body: RequestBody::Data(DataPacket {
                packet_type: 1,
                transfer_key: vec![1; 20],
                request_key: vec![2; 20],
                data: vec![3; 500],
                start_position: 1000,
                length: 500,
                total_length: 4000,
            }),
        });
        assert_eq!(round_trip(data.clone()), data);
    }

    #[test]
    fn trailing_bytes_ignored() {
        let packet = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_CURRENT),
            body: RequestBody::KeyBlock { random_id: 1, request: vec![1], signature: vec![2] },
        });
        let mut bytes = packet.encode().unwrap();
        bytes.extend_from_slice(&[0xaa; 16]);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn length_boundaries() {
        let oversized_key = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_CURRENT),
            body: RequestBody::FindValue { key: vec![0; MAX_KEY_SIZE + 1], flags: 0, max_values: 1 },
        });
        assert!(matches!(oversized_key.encode(), Err(EncodeError::LengthExceeded { .. })));

        let ok = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_CURRENT),
            body: RequestBody::FindValue { key: vec![0; MAX_KEY_SIZE], flags: 0, max_values: 1 },
        });
        let mut bytes = ok.encode().unwrap();
        // rewrite the key prefix to claim 65 bytes
        let prefix_at = bytes.len() - MAX_KEY_SIZE - 3;
        bytes[prefix_at] = (MAX_KEY_SIZE + 1) as u8;
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::LengthExceeded { len: MAX_KEY_SIZE + 1, max: MAX_KEY_SIZE })
        );

        let too_big = Packet::Request(Request {
            header: request_header(PROTOCOL_VERSION_CURRENT),
            body: RequestBody::Data(DataPacket {
                packet_type: 0,
                transfer_key: vec![],
                request_key: vec![],
                data: vec![0; MAX_PACKET_SIZE],
                start_position: 0,
                length: 0,
                total_length: 0,
            }),
        });
        assert!(matches!(too_big.encode(), Err(EncodeError::PacketTooLarge { .. })));
    }

    #[test]
    fn truncated_packet_fails() {
        let packet = Packet::Reply(Reply {
            header: reply_header(PROTOCOL_VERSION_CURRENT),
            body: ReplyBody::Store { diversifications: vec![1, 2, 3] },
        });
        let bytes = packet.encode().unwrap();
        assert!(matches!(decode(&bytes[..bytes.len() - 1]), Err(DecodeError::UnexpectedEof { .. })));
    }
}
