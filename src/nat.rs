//! # External Address
//!
//! Working out the address other nodes see us at, and reacting when a peer
//! says we are wrong about it.
//!
//! Resolution order:
//!
//! 1. bind address override
//! 2. explicit IP override
//! 3. triangulation: ping random history contacts until three agree
//! 4. platform public-address source
//! 5. the caller's default
//!
//! A peer's "originator address wrong" report is only acted on after it
//! passes [`AddressTracker::evaluate`]; acting means re-resolving in the
//! background and committing a new local contact if the answer changed.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, trace};

use crate::identity::{is_public_ip, Contact};
use crate::lock;
use crate::rpc::{PeerError, RpcError};
use crate::stats::CONTACT_HISTORY_MAX;
use crate::transport::TransportInner;

/// Contacts asked during one triangulation.
pub const TRIANGULATION_CONTACTS: usize = 24;

/// Matching answers needed to settle.
pub const TRIANGULATION_AGREEMENT: usize = 3;

pub const MIN_ADDRESS_CHANGE_PERIOD_INIT: Duration = Duration::from_secs(5 * 60);
pub const MIN_ADDRESS_CHANGE_PERIOD_NEXT: Duration = Duration::from_secs(10 * 60);

/// Delay before a report received with a thin contact history is retried.
pub const ADDRESS_CHANGE_DEFER: Duration = Duration::from_secs(30);

// ============================================================================
// Triangulation
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TallyStep {
    Continue,
    Settled(IpAddr),
    /// Two contacts disagreed.
    Abort,
}

/// Running agreement across contacts' views of our address.
#[derive(Debug, Default)]
pub struct Triangulation {
    candidate: Option<IpAddr>,
    matches: usize,
}

impl Triangulation {
    pub fn offer(&mut self, seen: IpAddr) -> TallyStep {
        match self.candidate {
            None => {
                self.candidate = Some(seen);
                self.matches = 1;
            }
            Some(ip) if ip == seen => self.matches += 1,
            Some(_) => return TallyStep::Abort,
        }
        if self.matches >= TRIANGULATION_AGREEMENT {
            TallyStep::Settled(seen)
        } else {
            TallyStep::Continue
        }
    }
}

// ============================================================================
// Change Policy
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeDecision {
    Ignore(&'static str),
    /// Retry forced after [`ADDRESS_CHANGE_DEFER`].
    Defer,
    Accept,
}

/// A peer's claim about our address.
#[derive(Clone, Copy, Debug)]
pub struct AddressReport {
    pub reported: IpAddr,
    /// The reporting peer's own external address.
    pub reporter: IpAddr,
    pub history_len: usize,
    pub force: bool,
}

/// Current external address plus the rate limit on changing it.
#[derive(Debug)]
pub struct AddressTracker {
    current: Option<IpAddr>,
    ipv6: bool,
    last_change: Option<Instant>,
    min_period: Duration,
    deferred: bool,
}

impl AddressTracker {
    pub fn new(ipv6: bool) -> Self {
        Self { current: None, ipv6, last_change: None, min_period: MIN_ADDRESS_CHANGE_PERIOD_INIT, deferred: false }
    }

    pub fn current(&self) -> Option<IpAddr> {
        self.current
    }

    /// Record the resolved address, returning true when it differs.
    pub fn set_current(&mut self, ip: IpAddr) -> bool {
        let changed = self.current != Some(ip);
        self.current = Some(ip);
        changed
    }

    #[cfg(test)]
    pub fn min_period(&self) -> Duration {
        self.min_period
    }

    pub fn evaluate(&mut self, now: Instant, report: &AddressReport) -> ChangeDecision {
        if report.reported.is_ipv6() != self.ipv6 {
            return ChangeDecision::Ignore("address family differs");
        }
        if self.current == Some(report.reported) {
            return ChangeDecision::Ignore("already current");
        }
        if let Some(last) = self.last_change {
            if now.saturating_duration_since(last) < self.min_period {
                return ChangeDecision::Ignore("inside change period");
            }
        }
        if report.history_len < CONTACT_HISTORY_MAX && !report.force {
            if self.deferred {
                return ChangeDecision::Ignore("history too small");
            }
            self.deferred = true;
            return ChangeDecision::Defer;
        }
        if !is_public_ip(&report.reported) {
            return ChangeDecision::Ignore("not a public address");
        }
        if report.reported == report.reporter {
            return ChangeDecision::Ignore("reporter's own address");
        }
        self.last_change = Some(now);
        self.min_period = MIN_ADDRESS_CHANGE_PERIOD_NEXT;
        ChangeDecision::Accept
    }
}

// ============================================================================
// Transport Integration
// ============================================================================

impl TransportInner {
    /// Work out our external address, falling back to `default`. Listeners
    /// hear about it when it differs from the last resolution.
    pub(crate) async fn resolve_external_address(self: &Arc<Self>, default: IpAddr) -> IpAddr {
        let mut found = self.config.bind_address.filter(|ip| !ip.is_unspecified());
        if let Some(ip) = self.config.explicit_ip {
            debug!(ip = %ip, "external address explicitly overridden");
            found = Some(ip);
        }
        if found.is_none() {
            found = self.triangulate().await;
        }
        if found.is_none() {
            if let Some(source) = &self.public_address {
                found = source.public_address(self.is_ipv6()).await;
                if let Some(ip) = found {
                    debug!(ip = %ip, "external address from public address source");
                }
            }
        }
        let ip = found.unwrap_or(default);
        if lock(&self.address).set_current(ip) {
            info!(ip = %ip, "external address");
            for listener in self.listeners() {
                listener.current_address(ip);
            }
        }
        ip
    }

    async fn triangulate(self: &Arc<Self>) -> Option<IpAddr> {
        let candidates = lock(&self.state).contact_history.random_sample(TRIANGULATION_CONTACTS);
        debug!(contacts = candidates.len(), "triangulating external address");

        let mut tally = Triangulation::default();
        for contact in candidates {
            let Some(seen) = self.ask_external_address(&contact).await else {
                trace!(contact = %contact.transport_addr(), "no reply to address probe");
                continue;
            };
            match tally.offer(seen) {
                TallyStep::Continue => {}
                TallyStep::Settled(ip) => {
                    debug!(ip = %ip, "external address agreed by contacts");
                    return Some(ip);
                }
                TallyStep::Abort => {
                    debug!(contact = %contact.transport_addr(), seen = %seen, "contacts disagree, abandoning");
                    return None;
                }
            }
        }
        None
    }

    /// What `contact` sees as our address: a plain ping reply confirms the
    /// current one, an address-wrong error carries the corrected one.
    async fn ask_external_address(self: &Arc<Self>, contact: &Contact) -> Option<IpAddr> {
        match self.probe_ping(contact).await {
            Ok(_) => Some(self.local_contact().external_addr().ip()),
            Err(RpcError::PeerReported(PeerError::OriginatorAddressWrong(addr))) => Some(addr.ip()),
            Err(_) => None,
        }
    }

    /// Handle a peer telling us it sees us at `new_addr`.
    pub(crate) fn external_address_change(self: &Arc<Self>, reporter: &Contact, new_addr: SocketAddr, force: bool) {
        let report = AddressReport {
            reported: new_addr.ip(),
            reporter: reporter.external_addr().ip(),
            history_len: lock(&self.state).contact_history.len(),
            force,
        };
        let decision = lock(&self.address).evaluate(Instant::now(), &report);
        match decision {
            ChangeDecision::Ignore(reason) => {
                trace!(reporter = %reporter.transport_addr(), reported = %new_addr, reason, "address report ignored");
            }
            ChangeDecision::Defer => {
                info!(reporter = %reporter.transport_addr(), reported = %new_addr, "address report deferred");
                let inner = Arc::clone(self);
                let reporter = reporter.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(ADDRESS_CHANGE_DEFER).await;
                    inner.external_address_change(&reporter, new_addr, true);
                });
            }
            ChangeDecision::Accept => {
                info!(reporter = %reporter.transport_addr(), reported = %new_addr, "peer reports new external address");
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.apply_address_change(new_addr.ip()).await });
            }
        }
    }

    async fn apply_address_change(self: Arc<Self>, suggested: IpAddr) {
        if self.address_changing.swap(true, Ordering::AcqRel) {
            return;
        }
        let old = lock(&self.address).current();
        let resolved = self.resolve_external_address(suggested).await;
        if old != Some(resolved) {
            self.set_local_contact(resolved);
        } else {
            debug!(ip = %resolved, "address unchanged after re-resolution");
        }
        self.address_changing.store(false, Ordering::Release);
    }

    /// Commit a new local contact at `ip` with a fresh instance id.
    pub(crate) fn set_local_contact(&self, ip: IpAddr) {
        let port = self.local_contact().external_addr().port();
        let addr = SocketAddr::new(ip, port);
        let instance_id = rand::thread_rng().gen::<u32>();
        let contact = Contact::new(&self.ids, addr, addr, self.version, instance_id, 0);
        *lock(&self.local) = contact.clone();
        info!(addr = %addr, "local contact changed");
        for listener in self.listeners() {
            listener.local_contact_changed(&contact);
        }
    }
}
