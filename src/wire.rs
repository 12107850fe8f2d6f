//! # Wire Primitives
//!
//! Cursor-based big-endian encoding shared by every packet type, plus the
//! records that appear inside several payloads (addresses, contacts, values,
//! network positions, stats blocks).
//!
//! ## Length Prefixes
//!
//! Variable-length fields declare a maximum. The prefix width follows from it:
//!
//! | Maximum | Prefix |
//! |---------|--------|
//! | < 256 | 1 byte |
//! | < 65536 | 2 bytes |
//! | otherwise | 4 bytes |
//!
//! Writing more than the maximum is an [`EncodeError`]; reading a prefix above
//! the maximum is a [`DecodeError`]. Neither side truncates.
//!
//! ## Records
//!
//! ```text
//! address   := ip_len(1) ip(4|16) port(2)
//! contact   := type(1)=1 version(1) address
//! value     := version(4, zero below 11) created(8) bytes(2+n<=512) contact flags(1)
//!              [life_hours(1) >=23] [replication_control(1) >=24]
//! netpos    := count(1) { type(1) size(1) bytes(size) }*
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::version::{
    PROTOCOL_VERSION_BLOCK_KEYS, PROTOCOL_VERSION_LONGER_LIFE, PROTOCOL_VERSION_MORE_STATS,
    PROTOCOL_VERSION_REMOVE_DIST_ADD_VER, PROTOCOL_VERSION_REPLICATION_CONTROL,
};

/// Largest datagram this protocol emits or accepts.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Largest value payload carried in a transport value.
pub const MAX_VALUE_SIZE: usize = 512;

/// Contact type tag for UDP contacts, the only kind defined.
pub const CONTACT_TYPE_UDP: u8 = 1;

/// Encoded size of an IPv4 address record.
pub const ADDRESS_SIZE_V4: usize = 1 + 4 + 2;

/// Encoded size of an IPv6 address record.
pub const ADDRESS_SIZE_V6: usize = 1 + 16 + 2;

/// Encoded size of an IPv4 contact.
pub const CONTACT_SIZE: usize = 2 + ADDRESS_SIZE_V4;

/// Encoded size of a transport value excluding the value bytes themselves.
pub const VALUE_SIZE_WITHOUT_VALUE: usize = 17 + CONTACT_SIZE;

/// Maximum number of contacts in a contact list.
pub const MAX_CONTACTS: usize = 65535;

/// Maximum number of values in one value list.
pub const MAX_VALUES: usize = 65535;

/// Maximum length of a key or node id field.
pub const MAX_KEY_SIZE: usize = 64;

/// Stats blocks carry a short version string.
pub const MAX_STATS_VERSION_SIZE: usize = 64;

/// Upload stats marker meaning no stats follow.
pub const UPLOAD_STATS_NONE: u8 = 0xff;

const UPLOAD_STATS_FORMAT: u8 = 0x02;

/// Combined cap on received and sent country entries.
pub const MAX_COUNTRY_STATS: usize = 24;

// ============================================================================
// Errors
// ============================================================================

/// Why a datagram could not be decoded. Inbound packets failing to decode are
/// dropped without a reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ended before a field was complete.
    UnexpectedEof { needed: usize, remaining: usize },
    /// A length prefix exceeded the field's declared maximum.
    LengthExceeded { len: usize, max: usize },
    /// Declared protocol version is below the network's minimum.
    VersionTooLow { version: u8, minimum: u8, network: u32 },
    /// Action code not defined by this protocol.
    UnknownAction(u32),
    /// Address record with an IP length other than 4 or 16.
    InvalidAddress(usize),
    /// Contact record with an unknown type tag.
    InvalidContactType(u8),
    /// Bencoded property map failed to parse.
    Properties(String),
    /// Datagram does not belong to this protocol.
    NotDhtPacket,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof { needed, remaining } => {
                write!(f, "unexpected end of packet: need {} bytes, {} remain", needed, remaining)
            }
            DecodeError::LengthExceeded { len, max } => {
                write!(f, "field length {} exceeds maximum {}", len, max)
            }
            DecodeError::VersionTooLow { version, minimum, network } => write!(
                f,
                "protocol version {} below minimum {} for network {}",
                version, minimum, network
            ),
            DecodeError::UnknownAction(action) => write!(f, "unknown action {}", action),
            DecodeError::InvalidAddress(len) => write!(f, "invalid address length {}", len),
            DecodeError::InvalidContactType(t) => write!(f, "invalid contact type {}", t),
            DecodeError::Properties(e) => write!(f, "invalid contact properties: {}", e),
            DecodeError::NotDhtPacket => write!(f, "not a DHT packet"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// A variable-length field is longer than its declared maximum.
    LengthExceeded { len: usize, max: usize },
    /// The finished packet does not fit in one datagram.
    PacketTooLarge { size: usize, max: usize },
    /// Contact properties could not be bencoded.
    Properties(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::LengthExceeded { len, max } => {
                write!(f, "field length {} exceeds maximum {}", len, max)
            }
            EncodeError::PacketTooLarge { size, max } => {
                write!(f, "packet of {} bytes exceeds maximum {}", size, max)
            }
            EncodeError::Properties(e) => write!(f, "cannot encode contact properties: {}", e),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Width in bytes of the length prefix for a field with the given maximum.
#[inline]
pub fn prefix_width(max: usize) -> usize {
    if max < 0x100 {
        1
    } else if max < 0x10000 {
        2
    } else {
        4
    }
}

// ============================================================================
// Shared Records
// ============================================================================

/// A contact as it travels on the wire: version and address only. Identity
/// and liveness state are attached by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContactInfo {
    pub version: u8,
    pub address: SocketAddr,
}

/// A stored DHT value with its originator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportValue {
    /// Value version; zero when the packet predates value versions.
    pub version: i32,
    /// Creation time, milliseconds since the epoch on the originator's clock.
    pub created: i64,
    pub value: Vec<u8>,
    pub originator: ContactInfo,
    pub flags: u8,
    pub life_hours: u8,
    pub replication_control: u8,
}

/// Opaque network-position sample. Known kinds are interpreted by
/// [`crate::netpos`]; others are carried and ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkPosition {
    pub kind: u8,
    pub data: Vec<u8>,
}

/// Transport, router and database counters returned by a stats request.
/// Fields absent at the packet's version decode as -1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullStats {
    pub db_values_stored: i64,
    pub router_nodes: i64,
    pub router_leaves: i64,
    pub router_contacts: i64,
    pub total_bytes_received: i64,
    pub total_bytes_sent: i64,
    pub total_packets_received: i64,
    pub total_packets_sent: i64,
    pub total_pings_received: i64,
    pub total_find_nodes_received: i64,
    pub total_find_values_received: i64,
    pub total_stores_received: i64,
    pub average_bytes_received: i64,
    pub average_bytes_sent: i64,
    pub average_packets_received: i64,
    pub average_packets_sent: i64,
    pub incoming_requests: i64,
    pub version: String,
    pub router_uptime: i64,
    pub router_count: i32,
    pub db_keys_blocked: i64,
    pub total_key_blocks_received: i64,
    pub db_key_count: i64,
    pub db_value_count: i64,
    pub db_store_size: i64,
    pub db_freq_divs: i64,
    pub db_size_divs: i64,
}

impl Default for FullStats {
    fn default() -> Self {
        Self {
            db_values_stored: 0,
            router_nodes: 0,
            router_leaves: 0,
            router_contacts: 0,
            total_bytes_received: 0,
            total_bytes_sent: 0,
            total_packets_received: 0,
            total_packets_sent: 0,
            total_pings_received: 0,
            total_find_nodes_received: 0,
            total_find_values_received: 0,
            total_stores_received: 0,
            average_bytes_received: 0,
            average_bytes_sent: 0,
            average_packets_received: 0,
            average_packets_sent: 0,
            incoming_requests: 0,
            version: String::new(),
            router_uptime: 0,
            router_count: 0,
            db_keys_blocked: -1,
            total_key_blocks_received: -1,
            db_key_count: -1,
            db_value_count: -1,
            db_store_size: -1,
            db_freq_divs: -1,
            db_size_divs: -1,
        }
    }
}

/// Per-country transfer rate, two letter country code.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CountryStat {
    pub cc: [u8; 2],
    pub rate: f32,
}

/// Aggregate upload/download rates piggybacked on pings and find-node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UploadStats {
    pub received_total: f32,
    pub sent_total: f32,
    pub received: Vec<CountryStat>,
    pub sent: Vec<CountryStat>,
}

impl UploadStats {
    /// Trim the two country lists so they fit the combined cap, sharing the
    /// room evenly unless one side needs less than half.
    pub fn clamp(&mut self) {
        let (mut recv, mut sent) = (self.received.len(), self.sent.len());
        if recv + sent > MAX_COUNTRY_STATS {
            let half = MAX_COUNTRY_STATS / 2;
            if recv < half {
                sent = MAX_COUNTRY_STATS - recv;
            } else if sent < half {
                recv = MAX_COUNTRY_STATS - sent;
            } else {
                recv = half;
                sent = half;
            }
        }
        self.received.truncate(recv);
        self.sent.truncate(sent);
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Append-only big-endian packet builder.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(MAX_PACKET_SIZE) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length prefix sized for `max`, rejecting `len > max`.
    pub fn write_length(&mut self, len: usize, max: usize) -> Result<(), EncodeError> {
        if len > max {
            return Err(EncodeError::LengthExceeded { len, max });
        }
        match prefix_width(max) {
            1 => self.write_u8(len as u8),
            2 => self.write_u16(len as u16),
            _ => self.write_u32(len as u32),
        }
        Ok(())
    }

    /// Length-prefixed byte array.
    pub fn write_bytes(&mut self, bytes: &[u8], max: usize) -> Result<(), EncodeError> {
        self.write_length(bytes.len(), max)?;
        self.write_raw(bytes);
        Ok(())
    }

    pub fn write_address(&mut self, addr: &SocketAddr) -> Result<(), EncodeError> {
        match addr.ip() {
            IpAddr::V4(ip) => self.write_bytes(&ip.octets(), 16)?,
            IpAddr::V6(ip) => self.write_bytes(&ip.octets(), 16)?,
        }
        self.write_u16(addr.port());
        Ok(())
    }

    pub fn write_contact(&mut self, contact: &ContactInfo) -> Result<(), EncodeError> {
        self.write_u8(CONTACT_TYPE_UDP);
        self.write_u8(contact.version);
        self.write_address(&contact.address)
    }

    pub fn write_contacts(&mut self, contacts: &[ContactInfo]) -> Result<(), EncodeError> {
        self.write_length(contacts.len(), MAX_CONTACTS)?;
        for contact in contacts {
            self.write_contact(contact)?;
        }
        Ok(())
    }

    pub fn write_value(&mut self, version: u8, value: &TransportValue) -> Result<(), EncodeError> {
        if version >= PROTOCOL_VERSION_REMOVE_DIST_ADD_VER {
            self.write_i32(value.version);
        } else {
            self.write_i32(0);
        }
        self.write_i64(value.created);
        self.write_bytes(&value.value, MAX_VALUE_SIZE)?;
        self.write_contact(&value.originator)?;
        self.write_u8(value.flags);
        if version >= PROTOCOL_VERSION_LONGER_LIFE {
            self.write_u8(value.life_hours);
        }
        if version >= PROTOCOL_VERSION_REPLICATION_CONTROL {
            self.write_u8(value.replication_control);
        }
        Ok(())
    }

    pub fn write_values(&mut self, version: u8, values: &[TransportValue]) -> Result<(), EncodeError> {
        self.write_length(values.len(), MAX_VALUES)?;
        for value in values {
            self.write_value(version, value)?;
        }
        Ok(())
    }

    pub fn write_network_positions(&mut self, positions: &[NetworkPosition]) -> Result<(), EncodeError> {
        self.write_length(positions.len(), 255)?;
        for pos in positions {
            self.write_u8(pos.kind);
            self.write_bytes(&pos.data, 255)?;
        }
        Ok(())
    }

    pub fn write_full_stats(&mut self, version: u8, stats: &FullStats) -> Result<(), EncodeError> {
        for v in [
            stats.db_values_stored,
            stats.router_nodes,
            stats.router_leaves,
            stats.router_contacts,
            stats.total_bytes_received,
            stats.total_bytes_sent,
            stats.total_packets_received,
            stats.total_packets_sent,
            stats.total_pings_received,
            stats.total_find_nodes_received,
            stats.total_find_values_received,
            stats.total_stores_received,
            stats.average_bytes_received,
            stats.average_bytes_sent,
            stats.average_packets_received,
            stats.average_packets_sent,
            stats.incoming_requests,
        ] {
            self.write_i64(v);
        }
        self.write_bytes(stats.version.as_bytes(), MAX_STATS_VERSION_SIZE)?;
        self.write_i64(stats.router_uptime);
        self.write_i32(stats.router_count);
        if version >= PROTOCOL_VERSION_BLOCK_KEYS {
            self.write_i64(stats.db_keys_blocked);
            self.write_i64(stats.total_key_blocks_received);
        }
        if version >= PROTOCOL_VERSION_MORE_STATS {
            self.write_i64(stats.db_key_count);
            self.write_i64(stats.db_value_count);
            self.write_i64(stats.db_store_size);
            self.write_i64(stats.db_freq_divs);
            self.write_i64(stats.db_size_divs);
        }
        Ok(())
    }

    /// `None` writes the no-stats marker.
    pub fn write_upload_stats(&mut self, stats: Option<&UploadStats>) {
        let Some(stats) = stats else {
            self.write_u8(UPLOAD_STATS_NONE);
            return;
        };
        let mut stats = stats.clone();
        stats.clamp();
        self.write_u8(UPLOAD_STATS_FORMAT);
        self.write_f32(stats.received_total);
        self.write_f32(stats.sent_total);
        for list in [&stats.received, &stats.sent] {
            self.write_u8(list.len() as u8);
            for entry in list {
                self.write_raw(&entry.cc);
                self.write_f32(entry.rate);
            }
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Zero-copy big-endian cursor over a received datagram.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEof { needed: len, remaining: self.remaining() });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_raw(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(u32::from_be_bytes(self.read_array()?)))
    }

    /// Read a length prefix sized for `max`, rejecting values above it.
    pub fn read_length(&mut self, max: usize) -> Result<usize, DecodeError> {
        let len = match prefix_width(max) {
            1 => self.read_u8()? as usize,
            2 => self.read_u16()? as usize,
            _ => self.read_u32()? as usize,
        };
        if len > max {
            return Err(DecodeError::LengthExceeded { len, max });
        }
        Ok(len)
    }

    pub fn read_bytes(&mut self, max: usize) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_length(max)?;
        Ok(self.read_raw(len)?.to_vec())
    }

    pub fn read_address(&mut self) -> Result<SocketAddr, DecodeError> {
        let ip = self.read_bytes(16)?;
        let ip = match ip.len() {
            4 => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&ip);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(DecodeError::InvalidAddress(other)),
        };
        let port = self.read_u16()?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn read_contact(&mut self) -> Result<ContactInfo, DecodeError> {
        let kind = self.read_u8()?;
        if kind != CONTACT_TYPE_UDP {
            return Err(DecodeError::InvalidContactType(kind));
        }
        let version = self.read_u8()?;
        let address = self.read_address()?;
        Ok(ContactInfo { version, address })
    }

    /// Contacts advertising port 0 are unusable and dropped.
    pub fn read_contacts(&mut self) -> Result<Vec<ContactInfo>, DecodeError> {
        let count = self.read_length(MAX_CONTACTS)?;
        let mut contacts = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let contact = self.read_contact()?;
            if contact.address.port() != 0 {
                contacts.push(contact);
            }
        }
        Ok(contacts)
    }

    pub fn read_value(&mut self, version: u8) -> Result<TransportValue, DecodeError> {
        let value_version = self.read_i32()?;
        let value_version = if version >= PROTOCOL_VERSION_REMOVE_DIST_ADD_VER { value_version } else { 0 };
        let created = self.read_i64()?;
        let value = self.read_bytes(MAX_VALUE_SIZE)?;
        let originator = self.read_contact()?;
        let flags = self.read_u8()?;
        let life_hours = if version >= PROTOCOL_VERSION_LONGER_LIFE { self.read_u8()? } else { 0 };
        let replication_control =
            if version >= PROTOCOL_VERSION_REPLICATION_CONTROL { self.read_u8()? } else { 0 };
        Ok(TransportValue {
            version: value_version,
            created,
            value,
            originator,
            flags,
            life_hours,
            replication_control,
        })
    }

    pub fn read_values(&mut self, version: u8) -> Result<Vec<TransportValue>, DecodeError> {
        let count = self.read_length(MAX_VALUES)?;
        let mut values = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            values.push(self.read_value(version)?);
        }
        Ok(values)
    }

    pub fn read_network_positions(&mut self) -> Result<Vec<NetworkPosition>, DecodeError> {
        let count = self.read_length(255)?;
        let mut positions = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = self.read_u8()?;
            let data = self.read_bytes(255)?;
            positions.push(NetworkPosition { kind, data });
        }
        Ok(positions)
    }

    pub fn read_full_stats(&mut self, version: u8) -> Result<FullStats, DecodeError> {
        let mut counters = [0i64; 17];
        for slot in counters.iter_mut() {
            *slot = self.read_i64()?;
        }
        let version_string = String::from_utf8_lossy(&self.read_bytes(MAX_STATS_VERSION_SIZE)?).into_owned();
        let router_uptime = self.read_i64()?;
        let router_count = self.read_i32()?;
        let mut stats = FullStats {
            db_values_stored: counters[0],
            router_nodes: counters[1],
            router_leaves: counters[2],
            router_contacts: counters[3],
            total_bytes_received: counters[4],
            total_bytes_sent: counters[5],
            total_packets_received: counters[6],
            total_packets_sent: counters[7],
            total_pings_received: counters[8],
            total_find_nodes_received: counters[9],
            total_find_values_received: counters[10],
            total_stores_received: counters[11],
            average_bytes_received: counters[12],
            average_bytes_sent: counters[13],
            average_packets_received: counters[14],
            average_packets_sent: counters[15],
            incoming_requests: counters[16],
            version: version_string,
            router_uptime,
            router_count,
            ..FullStats::default()
        };
        if version >= PROTOCOL_VERSION_BLOCK_KEYS {
            stats.db_keys_blocked = self.read_i64()?;
            stats.total_key_blocks_received = self.read_i64()?;
        }
        if version >= PROTOCOL_VERSION_MORE_STATS {
            stats.db_key_count = self.read_i64()?;
            stats.db_value_count = self.read_i64()?;
            stats.db_store_size = self.read_i64()?;
            stats.db_freq_divs = self.read_i64()?;
            stats.db_size_divs = self.read_i64()?;
        }
        Ok(stats)
    }

    /// Unknown stats formats are treated as absent.
    pub fn read_upload_stats(&mut self) -> Result<Option<UploadStats>, DecodeError> {
        let format = self.read_u8()?;
        if format != UPLOAD_STATS_FORMAT {
            return Ok(None);
        }
        let received_total = self.read_f32()?;
        let sent_total = self.read_f32()?;
        let mut lists = [Vec::new(), Vec::new()];
        let mut total = 0usize;
        for list in lists.iter_mut() {
            let records = self.read_u8()? as usize;
            total += records;
            if total > MAX_COUNTRY_STATS {
                return Err(DecodeError::LengthExceeded { len: total, max: MAX_COUNTRY_STATS });
            }
            for _ in 0..records {
                let cc = self.read_array::<2>()?;
                let rate = self.read_f32()?;
                list.push(CountryStat { cc, rate });
            }
        }
        let [received, sent] = lists;
        Ok(Some(UploadStats { received_total, sent_total, received, sent }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::PROTOCOL_VERSION_CURRENT;

    fn contact(addr: &str) -> ContactInfo {
        ContactInfo { version: PROTOCOL_VERSION_CURRENT, address: addr.parse().unwrap() }
    }

    #[test]
    fn prefix_width_follows_maximum() {
        assert_eq!(prefix_width(0), 1);
        assert_eq!(prefix_width(255), 1);
        assert_eq!(prefix_width(256), 2);
        assert_eq!(prefix_width(65535), 2);
        assert_eq!(prefix_width(65536), 4);
    }

    #[test]
    fn encode_beyond_max_fails() {
        let mut w = Writer::new();
        let err = w.write_bytes(&[0u8; 65], MAX_KEY_SIZE).unwrap_err();
        assert_eq!(err, EncodeError::LengthExceeded { len: 65, max: 64 });
    }

    #[test]
    fn decode_prefix_beyond_max_fails() {
        let buf = [65u8, 0, 0];
        let mut r = Reader::new(&buf);
        assert_eq!(
            r.read_bytes(MAX_KEY_SIZE).unwrap_err(),
            DecodeError::LengthExceeded { len: 65, max: 64 }
        );

        // two byte prefix for a 512 byte field
        let buf = [0x02u8, 0x01];
        let mut r = Reader::new(&buf);
        assert!(matches!(r.read_bytes(MAX_VALUE_SIZE), Err(DecodeError::LengthExceeded { len: 513, .. })));
    }

    #[test]
    fn short_buffer_is_eof() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert!(matches!(r.read_u32(), Err(DecodeError::UnexpectedEof { needed: 4, remaining: 3 })));
    }

    #[test]
    fn address_sizes() {
        let mut w = Writer::new();
        w.write_address(&"10.0.0.1:6881".parse().unwrap()).unwrap();
        assert_eq!(w.len(), ADDRESS_SIZE_V4);

        let mut w = Writer::new();
        w.write_address(&"[2001:db8::1]:6881".parse().unwrap()).unwrap();
        assert_eq!(w.len(), ADDRESS_SIZE_V6);

        let mut w = Writer::new();
        w.write_contact(&contact("1.2.3.4:5")).unwrap();
        assert_eq!(w.len(), CONTACT_SIZE);
    }

    #[test]
    fn bad_address_length_rejected() {
        let buf = [3u8, 1, 2, 3, 0, 80];
        assert_eq!(Reader::new(&buf).read_address().unwrap_err(), DecodeError::InvalidAddress(3));
    }

    #[test]
    fn zero_port_contacts_are_skipped() {
        let mut w = Writer::new();
        w.write_contacts(&[contact("1.2.3.4:0"), contact("5.6.7.8:9")]).unwrap();
        let bytes = w.into_bytes();
        let contacts = Reader::new(&bytes).read_contacts().unwrap();
        assert_eq!(contacts, vec![contact("5.6.7.8:9")]);
    }

    #[test]
    fn value_fields_follow_version() {
        let value = TransportValue {
            version: 7,
            created: 1_700_000_000_000,
            value: b"hello".to_vec(),
            originator: contact("1.2.3.4:6881"),
            flags: 3,
            life_hours: 12,
            replication_control: 0x21,
        };

        let mut w = Writer::new();
        w.write_value(PROTOCOL_VERSION_CURRENT, &value).unwrap();
        assert_eq!(w.len(), VALUE_SIZE_WITHOUT_VALUE + 5);
        let bytes = w.into_bytes();
        assert_eq!(Reader::new(&bytes).read_value(PROTOCOL_VERSION_CURRENT).unwrap(), value);

        let mut w = Writer::new();
        w.write_value(PROTOCOL_VERSION_REMOVE_DIST_ADD_VER - 1, &value).unwrap();
        let bytes = w.into_bytes();
        let old = Reader::new(&bytes).read_value(PROTOCOL_VERSION_REMOVE_DIST_ADD_VER - 1).unwrap();
        assert_eq!(old.version, 0);
        assert_eq!(old.life_hours, 0);
        assert_eq!(old.replication_control, 0);
        assert_eq!(old.value, value.value);
    }

    #[test]
    fn full_stats_defaults_for_old_versions() {
        let stats = FullStats {
            total_pings_received: 42,
            version: "5.0".into(),
            db_keys_blocked: 3,
            db_key_count: 9,
            ..FullStats::default()
        };
        let mut w = Writer::new();
        w.write_full_stats(PROTOCOL_VERSION_BLOCK_KEYS, &stats).unwrap();
        let bytes = w.into_bytes();
        let decoded = Reader::new(&bytes).read_full_stats(PROTOCOL_VERSION_BLOCK_KEYS).unwrap();
        assert_eq!(decoded.total_pings_received, 42);
        assert_eq!(decoded.db_keys_blocked, 3);
        assert_eq!(decoded.db_key_count, -1);
    }

    #[test]
    fn upload_stats_clamped_to_cap() {
        let entry = CountryStat { cc: *b"DE", rate: 1.5 };
        let mut stats = UploadStats {
            received_total: 10.0,
            sent_total: 20.0,
            received: vec![entry; 4],
            sent: vec![entry; 30],
        };
        let mut w = Writer::new();
        w.write_upload_stats(Some(&stats));
        let bytes = w.into_bytes();
        let decoded = Reader::new(&bytes).read_upload_stats().unwrap().unwrap();
        stats.clamp();
        assert_eq!(decoded.received.len(), 4);
        assert_eq!(decoded.sent.len(), 20);
        assert_eq!(decoded, stats);

        let mut w = Writer::new();
        w.write_upload_stats(None);
        let bytes = w.into_bytes();
        assert_eq!(Reader::new(&bytes).read_upload_stats().unwrap(), None);
    }
}
