//! # Reachability & Stats
//!
//! A node behind a NAT only sees requests from peers it contacted first. Peers
//! it never talked to ("aliens") can only reach a public node, so the rate of
//! alien requests is the reachability signal:
//!
//! - each stats period the alien deltas feed two rolling averages (all
//!   requests, find-value only);
//! - after the warm-up period the verdict is
//!   `find_value_avg > 1 || all_avg > 3`;
//! - listeners hear about flips only.
//!
//! Independently, the share of *incoming* requests whose sender reports itself
//! routable estimates how much of the network is publicly reachable. Outbound
//! targets are excluded since the routing layer already prefers routable ones.
//!
//! This module also holds the transport counters and the bounded contact
//! histories.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::identity::Contact;
use crate::wire::FullStats;

/// Stats tick interval.
pub const STATS_PERIOD: Duration = Duration::from_secs(60);

/// Window covered by the alien averages.
pub const STATS_DURATION: Duration = Duration::from_secs(600);

/// Reachability is not trusted before this much uptime.
pub const STATS_INIT_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Samples in the routable percentage average.
pub const ROUTABLE_AVERAGE_SAMPLES: usize = 8;

/// General contact history capacity.
pub const CONTACT_HISTORY_MAX: usize = 32;

/// Routable contact history capacity.
pub const ROUTABLE_CONTACT_HISTORY_MAX: usize = 128;

/// Dedup cache for "your address is wrong" log lines.
pub const RECENT_REPORTS_HISTORY_MAX: usize = 32;

/// A request counts as solicited if we sent to its source this recently.
pub const ALIEN_WINDOW: Duration = Duration::from_secs(120);

const RECENT_DESTINATIONS_MAX: usize = 1024;

const ROUTABLE_UPDATE_SAMPLES: u64 = 300;
const ROUTABLE_BLEND_SAMPLES: u64 = 100;

// ============================================================================
// Averages
// ============================================================================

/// Mean of the last `window` samples.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: VecDeque<u64>,
    window: usize,
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        Self { samples: VecDeque::with_capacity(window), window: window.max(1) }
    }

    pub fn add(&mut self, value: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Average over the full window; missing samples count as zero.
    pub fn average(&self) -> u64 {
        self.samples.iter().sum::<u64>() / self.window as u64
    }
}

/// Moving average that reports the mean of whatever samples it has so far.
#[derive(Debug, Clone)]
pub struct ImmediateMovingAverage {
    samples: VecDeque<f64>,
    window: usize,
}

impl ImmediateMovingAverage {
    pub fn new(window: usize) -> Self {
        Self { samples: VecDeque::with_capacity(window), window: window.max(1) }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

// ============================================================================
// Reachability
// ============================================================================

pub struct ReachabilityTracker {
    started: Instant,
    warmup: Duration,
    last_alien: u64,
    last_alien_fv: u64,
    alien_average: RollingAverage,
    alien_fv_average: RollingAverage,
    reachable: bool,
    accurate: bool,
}

impl ReachabilityTracker {
    pub fn with_warmup(initially_reachable: bool, warmup: Duration) -> Self {
        let window = (STATS_DURATION.as_secs() / STATS_PERIOD.as_secs()) as usize;
        Self {
            started: Instant::now(),
            warmup,
            last_alien: 0,
            last_alien_fv: 0,
            alien_average: RollingAverage::new(window),
            alien_fv_average: RollingAverage::new(window),
            reachable: initially_reachable,
            accurate: false,
        }
    }

    /// Feed cumulative alien counts. Returns the new verdict when it flips.
    pub fn tick(&mut self, alien_total: u64, alien_fv_total: u64) -> Option<bool> {
        self.alien_average.add(alien_total.saturating_sub(self.last_alien));
        self.alien_fv_average.add(alien_fv_total.saturating_sub(self.last_alien_fv));
        self.last_alien = alien_total;
        self.last_alien_fv = alien_fv_total;

        if self.started.elapsed() <= self.warmup {
            return None;
        }
        self.accurate = true;
        let old = self.reachable;
        self.reachable = self.alien_fv_average.average() > 1 || self.alien_average.average() > 3;
        (old != self.reachable).then_some(self.reachable)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// True once the warm-up period has passed.
    pub fn is_accurate(&self) -> bool {
        self.accurate
    }

    #[cfg(test)]
    pub fn averages(&self) -> (u64, u64) {
        (self.alien_average.average(), self.alien_fv_average.average())
    }
}

/// Share of incoming requesters reporting themselves routable.
pub struct RoutableTracker {
    routable: u64,
    not_routable: u64,
    average: ImmediateMovingAverage,
}

impl RoutableTracker {
    pub fn new(seed_percentage: i32) -> Self {
        let mut average = ImmediateMovingAverage::new(ROUTABLE_AVERAGE_SAMPLES);
        if seed_percentage > 0 {
            average.update(seed_percentage as f64);
        }
        Self { routable: 0, not_routable: 0, average }
    }

    pub fn record(&mut self, routable: bool) {
        if routable {
            self.routable += 1;
        } else {
            self.not_routable += 1;
        }
    }

    /// Current estimate in percent, or -1 when there is nothing to go on.
    pub fn percentage(&mut self) -> i32 {
        let mut average = self.average.average();
        let total = self.routable + self.not_routable;
        let current = if total == 0 { 0 } else { (self.routable * 100 / total) as i32 };

        if total >= ROUTABLE_UPDATE_SAMPLES {
            if current > 0 {
                average = self.average.update(current as f64);
                self.routable = 0;
                self.not_routable = 0;
            }
        } else if total >= ROUTABLE_BLEND_SAMPLES {
            if average == 0.0 {
                average = current as f64;
            } else {
                let samples = self.average.sample_count() as f64;
                if samples > 0.0 {
                    average = (samples * average + current as f64) / (samples + 1.0);
                }
            }
        }

        match average as i32 {
            0 => -1,
            pct => pct,
        }
    }
}

/// Recently contacted addresses, used to tell solicited from alien requests.
pub struct RecentDestinations {
    cache: LruCache<IpAddr, Instant>,
}

impl RecentDestinations {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(RECENT_DESTINATIONS_MAX).unwrap_or(NonZeroUsize::MIN);
        Self { cache: LruCache::new(cap) }
    }

    pub fn record_send(&mut self, to: &SocketAddr) {
        self.cache.put(to.ip(), Instant::now());
    }

    pub fn is_alien(&mut self, from: &SocketAddr) -> bool {
        match self.cache.get(&from.ip()) {
            Some(at) => at.elapsed() > ALIEN_WINDOW,
            None => true,
        }
    }
}

impl Default for RecentDestinations {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Bounded Histories
// ============================================================================

/// LRU of contacts keyed by transport address.
pub struct ContactHistory {
    cache: LruCache<SocketAddr, Contact>,
    max: usize,
}

impl ContactHistory {
    pub fn new(max: usize) -> Self {
        let cap = NonZeroUsize::new(max.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { cache: LruCache::new(cap), max }
    }

    pub fn insert(&mut self, contact: Contact) {
        self.cache.put(contact.transport_addr(), contact);
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Contact> {
        self.cache.pop(addr)
    }

    #[cfg(test)]
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.cache.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_full(&self) -> bool {
        self.cache.len() >= self.max
    }

    /// Most recently used first.
    pub fn contacts(&self) -> Vec<Contact> {
        self.cache.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn random_sample(&self, n: usize) -> Vec<Contact> {
        let mut all = self.contacts();
        all.shuffle(&mut rand::thread_rng());
        all.truncate(n);
        all
    }
}

/// Remembers which keys have been seen so a repeated event is logged once.
pub struct RecentReports {
    cache: LruCache<String, ()>,
}

impl RecentReports {
    pub fn new(max: usize) -> Self {
        let cap = NonZeroUsize::new(max.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { cache: LruCache::new(cap) }
    }

    /// True the first time `key` is seen (while it stays cached).
    pub fn first_report(&mut self, key: &str) -> bool {
        if self.cache.get(key).is_some() {
            return false;
        }
        self.cache.put(key.to_string(), ());
        true
    }
}

// ============================================================================
// Counters
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RpcKind {
    Ping,
    Store,
    FindNode,
    FindValue,
    Stats,
    KeyBlock,
    QueryStore,
    Data,
}

impl RpcKind {
    pub const ALL: [RpcKind; 8] = [
        RpcKind::Ping,
        RpcKind::Store,
        RpcKind::FindNode,
        RpcKind::FindValue,
        RpcKind::Stats,
        RpcKind::KeyBlock,
        RpcKind::QueryStore,
        RpcKind::Data,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

const KINDS: usize = RpcKind::ALL.len();

#[derive(Default)]
struct Counters([AtomicU64; KINDS]);

impl Counters {
    fn inc(&self, kind: RpcKind) {
        self.0[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, kind: RpcKind) -> u64 {
        self.0[kind.index()].load(Ordering::Relaxed)
    }

    fn total(&self) -> u64 {
        self.0.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

/// Lock-free transport counters.
#[derive(Default)]
pub struct TransportStats {
    sent: Counters,
    ok: Counters,
    failed: Counters,
    received: Counters,
    aliens: Counters,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    incoming_requests: AtomicU64,
    skew_total: AtomicI64,
    skew_samples: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub pings_sent: u64,
    pub pings_ok: u64,
    pub pings_failed: u64,
    pub pings_received: u64,
    pub find_nodes_sent: u64,
    pub find_nodes_ok: u64,
    pub find_nodes_failed: u64,
    pub find_nodes_received: u64,
    pub find_values_sent: u64,
    pub find_values_ok: u64,
    pub find_values_failed: u64,
    pub find_values_received: u64,
    pub stores_sent: u64,
    pub stores_ok: u64,
    pub stores_failed: u64,
    pub stores_received: u64,
    pub query_stores_sent: u64,
    pub query_stores_received: u64,
    pub key_blocks_received: u64,
    pub stats_received: u64,
    pub data_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub incoming_requests: u64,
    pub aliens: u64,
    pub alien_find_values: u64,
    pub average_skew_ms: i64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_sent(&self, kind: RpcKind) {
        self.sent.inc(kind);
    }

    pub fn request_ok(&self, kind: RpcKind) {
        self.ok.inc(kind);
    }

    pub fn request_failed(&self, kind: RpcKind) {
        self.failed.inc(kind);
    }

    pub fn request_received(&self, kind: RpcKind, alien: bool) {
        self.received.inc(kind);
        self.incoming_requests.fetch_add(1, Ordering::Relaxed);
        if alien {
            self.aliens.inc(kind);
        }
    }

    pub fn packet_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_skew(&self, skew: i64) {
        self.skew_total.fetch_add(skew, Ordering::Relaxed);
        self.skew_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self, kind: RpcKind) -> u64 {
        self.sent.get(kind)
    }

    pub fn ok(&self, kind: RpcKind) -> u64 {
        self.ok.get(kind)
    }

    pub fn failed(&self, kind: RpcKind) -> u64 {
        self.failed.get(kind)
    }

    pub fn received(&self, kind: RpcKind) -> u64 {
        self.received.get(kind)
    }

    /// Cumulative (all aliens, find-value aliens).
    pub fn aliens(&self) -> (u64, u64) {
        (self.aliens.total(), self.aliens.get(RpcKind::FindValue))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let samples = self.skew_samples.load(Ordering::Relaxed);
        let (aliens, alien_find_values) = self.aliens();
        StatsSnapshot {
            pings_sent: self.sent(RpcKind::Ping),
            pings_ok: self.ok(RpcKind::Ping),
            pings_failed: self.failed(RpcKind::Ping),
            pings_received: self.received(RpcKind::Ping),
            find_nodes_sent: self.sent(RpcKind::FindNode),
            find_nodes_ok: self.ok(RpcKind::FindNode),
            find_nodes_failed: self.failed(RpcKind::FindNode),
            find_nodes_received: self.received(RpcKind::FindNode),
            find_values_sent: self.sent(RpcKind::FindValue),
            find_values_ok: self.ok(RpcKind::FindValue),
            find_values_failed: self.failed(RpcKind::FindValue),
            find_values_received: self.received(RpcKind::FindValue),
            stores_sent: self.sent(RpcKind::Store),
            stores_ok: self.ok(RpcKind::Store),
            stores_failed: self.failed(RpcKind::Store),
            stores_received: self.received(RpcKind::Store),
            query_stores_sent: self.sent(RpcKind::QueryStore),
            query_stores_received: self.received(RpcKind::QueryStore),
            key_blocks_received: self.received(RpcKind::KeyBlock),
            stats_received: self.received(RpcKind::Stats),
            data_received: self.received(RpcKind::Data),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            incoming_requests: self.incoming_requests.load(Ordering::Relaxed),
            aliens,
            alien_find_values,
            average_skew_ms: if samples == 0 {
                0
            } else {
                self.skew_total.load(Ordering::Relaxed) / samples as i64
            },
        }
    }

    /// Transport half of a stats reply; router and database fields are
    /// filled in by the request handler.
    pub fn fill_full_stats(&self, stats: &mut FullStats) {
        let snap = self.snapshot();
        stats.total_bytes_received = snap.bytes_received as i64;
        stats.total_bytes_sent = snap.bytes_sent as i64;
        stats.total_packets_received = snap.packets_received as i64;
        stats.total_packets_sent = snap.packets_sent as i64;
        stats.total_pings_received = snap.pings_received as i64;
        stats.total_find_nodes_received = snap.find_nodes_received as i64;
        stats.total_find_values_received = snap.find_values_received as i64;
        stats.total_stores_received = snap.stores_received as i64;
        stats.total_key_blocks_received = snap.key_blocks_received as i64;
        stats.incoming_requests = snap.incoming_requests as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdCache;

    #[test]
    fn rolling_average_window() {
        let mut avg = RollingAverage::new(4);
        avg.add(4);
        assert_eq!(avg.average(), 1);
        for _ in 0..4 {
            avg.add(8);
        }
        assert_eq!(avg.average(), 8);
    }

    #[test]
    fn immediate_average_uses_present_samples() {
        let mut avg = ImmediateMovingAverage::new(3);
        assert_eq!(avg.average(), 0.0);
        assert_eq!(avg.update(30.0), 30.0);
        assert_eq!(avg.update(60.0), 45.0);
        avg.update(90.0);
        assert_eq!(avg.update(120.0), 90.0);
        assert_eq!(avg.sample_count(), 3);
    }

    #[test]
    fn reachability_waits_for_warmup() {
        let mut tracker = ReachabilityTracker::with_warmup(false, STATS_INIT_PERIOD);
        assert_eq!(tracker.tick(1000, 1000), None);
        assert!(!tracker.is_reachable());
        assert!(!tracker.is_accurate());
    }

    #[test]
    fn reachability_flips_after_warmup() {
        let mut tracker = ReachabilityTracker::with_warmup(false, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        // 10 sample window: 40 find-values in one period averages 4
        assert_eq!(tracker.tick(40, 40), Some(true));
        assert!(tracker.is_accurate());
        assert_eq!(tracker.tick(40, 40), None);
        for _ in 0..10 {
            tracker.tick(40, 40);
        }
        assert!(!tracker.is_reachable());
    }

    #[test]
    fn reachable_on_general_aliens() {
        let mut tracker = ReachabilityTracker::with_warmup(false, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(tracker.tick(40, 0), Some(true));
        assert_eq!(tracker.averages(), (4, 0));
    }

    #[test]
    fn routable_percentage_thresholds() {
        let mut tracker = RoutableTracker::new(0);
        assert_eq!(tracker.percentage(), -1);

        for i in 0..100 {
            tracker.record(i % 4 == 0);
        }
        // 100 samples, empty average: current value used as is
        assert_eq!(tracker.percentage(), 25);

        for i in 0..200 {
            tracker.record(i % 4 == 0);
        }
        // 300 samples: committed into the average and counters reset
        assert_eq!(tracker.percentage(), 25);
        assert_eq!(tracker.percentage(), 25);
    }

    #[test]
    fn routable_percentage_blends_with_seed() {
        let mut tracker = RoutableTracker::new(50);
        assert_eq!(tracker.percentage(), 50);
        for i in 0..100 {
            tracker.record(i < 20);
        }
        // (1 * 50 + 20) / 2
        assert_eq!(tracker.percentage(), 35);
    }

    #[test]
    fn alien_detection() {
        let mut recent = RecentDestinations::new();
        let peer: SocketAddr = "203.0.113.9:6881".parse().unwrap();
        assert!(recent.is_alien(&peer));
        recent.record_send(&peer);
        assert!(!recent.is_alien(&"203.0.113.9:9999".parse().unwrap()));
    }

    #[test]
    fn contact_history_bounded() {
        let ids = NodeIdCache::default();
        let mut history = ContactHistory::new(2);
        for port in 1..=3u16 {
            let addr: SocketAddr = format!("203.0.113.1:{}", port).parse().unwrap();
            history.insert(Contact::new(&ids, addr, addr, 50, 0, 0));
        }
        assert_eq!(history.len(), 2);
        assert!(history.is_full());
        assert!(!history.contains(&"203.0.113.1:1".parse().unwrap()));
        assert_eq!(history.random_sample(5).len(), 2);
    }

    #[test]
    fn recent_reports_dedup() {
        let mut reports = RecentReports::new(2);
        assert!(reports.first_report("a"));
        assert!(!reports.first_report("a"));
        assert!(reports.first_report("b"));
        assert!(reports.first_report("c"));
        assert!(reports.first_report("a"));
    }

    #[test]
    fn counters_and_snapshot() {
        let stats = TransportStats::new();
        stats.request_sent(RpcKind::Ping);
        stats.request_ok(RpcKind::Ping);
        stats.request_received(RpcKind::FindValue, true);
        stats.request_received(RpcKind::Ping, false);
        stats.packet_sent(100);
        stats.record_skew(10);
        stats.record_skew(30);

        let snap = stats.snapshot();
        assert_eq!(snap.pings_sent, 1);
        assert_eq!(snap.pings_ok, 1);
        assert_eq!(snap.incoming_requests, 2);
        assert_eq!((snap.aliens, snap.alien_find_values), (1, 1));
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.average_skew_ms, 20);

        let mut full = FullStats::default();
        stats.fill_full_stats(&mut full);
        assert_eq!(full.total_pings_received, 1);
        assert_eq!(full.total_find_values_received, 1);
    }
}
