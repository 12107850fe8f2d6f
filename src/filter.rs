//! # IP Filter Guard
//!
//! Every outbound RPC and every inbound packet passes [`AddressGuard::check`].
//! The external [`IpFilter`] may be slow (large range lists), so addresses it
//! rejects are remembered in an add-only bloom filter and rejected cheaply on
//! repeat. The bloom filter is rebuilt once it holds a tenth of its size in
//! entries, bounding the false-positive rate.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::lock;
use crate::protocols::IpFilter;

/// Bloom filter size in bits.
pub const BAD_IP_BLOOM_FILTER_SIZE: usize = 32000;

/// Rebuild threshold, in entries.
const BLOOM_RESET_ENTRIES: usize = BAD_IP_BLOOM_FILTER_SIZE / 10;

const BLOOM_HASHES: usize = 4;

/// Source or destination refused by the IP filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRejected {
    pub ip: IpAddr,
    /// Rejected from the bloom filter without consulting the range filter.
    pub repeat: bool,
}

impl fmt::Display for AddressRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.repeat {
            write!(f, "address {} rejected by IP filter (repeat)", self.ip)
        } else {
            write!(f, "address {} rejected by IP filter", self.ip)
        }
    }
}

impl std::error::Error for AddressRejected {}

/// Bloom filter supporting insertion and membership only.
pub struct AddOnlyBloomFilter {
    bits: Vec<u64>,
    size: usize,
    entries: usize,
}

impl AddOnlyBloomFilter {
    pub fn new(size: usize) -> Self {
        let size = size.max(64);
        Self { bits: vec![0; size.div_ceil(64)], size, entries: 0 }
    }

    fn indexes(&self, key: &[u8]) -> [usize; BLOOM_HASHES] {
        let hash = blake3::hash(key);
        let bytes = hash.as_bytes();
        let mut out = [0usize; BLOOM_HASHES];
        for (i, slot) in out.iter_mut().enumerate() {
            let chunk = [bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]];
            *slot = u32::from_be_bytes(chunk) as usize % self.size;
        }
        out
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.indexes(key).iter().all(|&i| self.bits[i / 64] & (1 << (i % 64)) != 0)
    }

    /// Returns false when the key was (probably) already present.
    pub fn add(&mut self, key: &[u8]) -> bool {
        if self.contains(key) {
            return false;
        }
        for i in self.indexes(key) {
            self.bits[i / 64] |= 1 << (i % 64);
        }
        self.entries += 1;
        true
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }
}

fn ip_key(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub struct AddressGuard {
    filter: Option<Arc<dyn IpFilter>>,
    bloom: Mutex<Option<AddOnlyBloomFilter>>,
}

impl AddressGuard {
    pub fn new(filter: Option<Arc<dyn IpFilter>>) -> Self {
        Self { filter, bloom: Mutex::new(None) }
    }

    /// Refuse addresses the IP filter blocks.
    pub fn check(&self, addr: &SocketAddr) -> Result<(), AddressRejected> {
        let Some(filter) = self.filter.as_ref().filter(|f| f.is_enabled()) else {
            return Ok(());
        };
        let ip = addr.ip();
        let key = ip_key(&ip);

        let mut bloom = lock(&self.bloom);
        let bloom = bloom.get_or_insert_with(|| AddOnlyBloomFilter::new(BAD_IP_BLOOM_FILTER_SIZE));
        if bloom.contains(&key) {
            return Err(AddressRejected { ip, repeat: true });
        }
        if filter.is_blocked(&ip) {
            if bloom.entry_count() >= BLOOM_RESET_ENTRIES {
                debug!(entries = bloom.entry_count(), "resetting bad-ip bloom filter");
                *bloom = AddOnlyBloomFilter::new(BAD_IP_BLOOM_FILTER_SIZE);
            }
            bloom.add(&key);
            return Err(AddressRejected { ip, repeat: false });
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn bloom_entries(&self) -> usize {
        lock(&self.bloom).as_ref().map(|b| b.entry_count()).unwrap_or(0)
    }
}
