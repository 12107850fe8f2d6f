//! # Protocol Versions and Networks
//!
//! Every wire field beyond the original packet layout was introduced by a
//! protocol version bump. Encoders and decoders gate each optional field on
//! `packet.protocol_version >= PROTOCOL_VERSION_<FEATURE>`.
//!
//! Several features share a version number; they shipped in the same release.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const PROTOCOL_VERSION_DIV_AND_CONT: u8 = 6;
pub const PROTOCOL_VERSION_ANTI_SPOOF: u8 = 7;
pub const PROTOCOL_VERSION_FIX_ORIGINATOR: u8 = 9;
pub const PROTOCOL_VERSION_NETWORKS: u8 = PROTOCOL_VERSION_FIX_ORIGINATOR;
pub const PROTOCOL_VERSION_REMOVE_DIST_ADD_VER: u8 = 11;
pub const PROTOCOL_VERSION_XFER_STATUS: u8 = 12;
pub const PROTOCOL_VERSION_SIZE_ESTIMATE: u8 = 13;
pub const PROTOCOL_VERSION_VENDOR_ID: u8 = 14;
pub const PROTOCOL_VERSION_BLOCK_KEYS: u8 = 14;
pub const PROTOCOL_VERSION_GENERIC_NETPOS: u8 = 15;
pub const PROTOCOL_VERSION_VIVALDI_FINDVALUE: u8 = 16;
pub const PROTOCOL_VERSION_MORE_STATS: u8 = 20;
pub const PROTOCOL_VERSION_MORE_NODE_STATUS: u8 = 22;
pub const PROTOCOL_VERSION_LONGER_LIFE: u8 = 23;
pub const PROTOCOL_VERSION_REPLICATION_CONTROL: u8 = 24;
pub const PROTOCOL_VERSION_RESTRICT_ID_PORTS: u8 = 32;
pub const PROTOCOL_VERSION_RESTRICT_ID_PORTS2: u8 = 33;
pub const PROTOCOL_VERSION_RESTRICT_ID3: u8 = 50;
pub const PROTOCOL_VERSION_VIVALDI_OPTIONAL: u8 = 51;
pub const PROTOCOL_VERSION_PACKET_FLAGS: u8 = 51;
pub const PROTOCOL_VERSION_ALT_CONTACTS: u8 = 52;
pub const PROTOCOL_VERSION_PACKET_FLAGS2: u8 = 53;
pub const PROTOCOL_VERSION_PROC_TIME: u8 = 54;
pub const PROTOCOL_VERSION_BBT_UPLOAD_STATS: u8 = 55;

/// Version spoken by this implementation.
pub const PROTOCOL_VERSION_CURRENT: u8 = PROTOCOL_VERSION_BBT_UPLOAD_STATS;

/// Oldest peers still accepted on the main networks.
pub const PROTOCOL_VERSION_MIN_AZ: u8 = PROTOCOL_VERSION_FIX_ORIGINATOR;

/// The CVS network only carries recent builds.
pub const PROTOCOL_VERSION_MIN_AZ_CVS: u8 = PROTOCOL_VERSION_VIVALDI_OPTIONAL;

pub const PROTOCOL_VERSION_MIN_BIGLYBT: u8 = PROTOCOL_VERSION_RESTRICT_ID3;

/// Vendor byte written in headers from `PROTOCOL_VERSION_VENDOR_ID` on.
pub const VENDOR_ID_SELF: u8 = 0x04;

pub const VENDOR_ID_NONE: u8 = 0xff;

/// DHT network a transport participates in. Packets carry it from
/// `PROTOCOL_VERSION_NETWORKS` on; older packets belong to the main network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u32);

impl NetworkId {
    pub const AZ_MAIN: NetworkId = NetworkId(0);
    pub const AZ_CVS: NetworkId = NetworkId(1);
    pub const AZ_MAIN_V6: NetworkId = NetworkId(3);
    pub const BIGLYBT_MAIN: NetworkId = NetworkId(4);

    /// Lowest protocol version a packet may declare on this network.
    pub fn min_protocol_version(self) -> u8 {
        match self {
            NetworkId::AZ_MAIN | NetworkId::AZ_MAIN_V6 => PROTOCOL_VERSION_MIN_AZ,
            NetworkId::AZ_CVS => PROTOCOL_VERSION_MIN_AZ_CVS,
            _ => PROTOCOL_VERSION_MIN_BIGLYBT,
        }
    }

    pub fn is_ipv6(self) -> bool {
        self == NetworkId::AZ_MAIN_V6
    }
}

impl Default for NetworkId {
    fn default() -> Self {
        NetworkId::AZ_MAIN
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NetworkId::AZ_MAIN => write!(f, "main"),
            NetworkId::AZ_CVS => write!(f, "cvs"),
            NetworkId::AZ_MAIN_V6 => write!(f, "main-v6"),
            NetworkId::BIGLYBT_MAIN => write!(f, "biglybt"),
            NetworkId(other) => write!(f, "network-{}", other),
        }
    }
}
