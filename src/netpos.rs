//! # Network Positions
//!
//! Vivaldi synthetic coordinates: each node keeps a 2D position plus a height
//! (access-link latency) and an error estimate. Every RTT sample against a
//! peer's advertised position moves the local coordinate so that coordinate
//! distance predicts round-trip time.
//!
//! Positions travel as typed entries (`kind`, bytes); kinds this node does not
//! know are carried untouched.

use std::sync::Mutex;

use rand::Rng;

use crate::lock;
use crate::wire::NetworkPosition;

/// Wire kind for [`VivaldiPosition`].
pub const POSITION_TYPE_VIVALDI_V2: u8 = 5;

const ENCODED_LEN: usize = 16;

/// Error-weight constant.
const CE: f32 = 0.25;

/// Movement constant.
const CC: f32 = 0.25;

const INITIAL_ERROR: f32 = 10.0;
const MIN_ERROR: f32 = 0.01;
const MIN_HEIGHT: f32 = 0.01;

/// Samples above this are treated as outliers.
const MAX_RTT_MS: f32 = 5.0 * 60.0 * 1000.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VivaldiPosition {
    pub x: f32,
    pub y: f32,
    pub h: f32,
    pub error: f32,
}

impl Default for VivaldiPosition {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, h: MIN_HEIGHT, error: INITIAL_ERROR }
    }
}

impl VivaldiPosition {
    /// Predicted RTT in milliseconds.
    pub fn distance(&self, other: &VivaldiPosition) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt() + self.h + other.h
    }

    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.h, self.error].iter().all(|v| v.is_finite())
    }

    /// Fold one RTT sample against `remote` into this position.
    pub fn update(&mut self, rtt_ms: f32, remote: &VivaldiPosition) {
        if !(rtt_ms > 0.0 && rtt_ms <= MAX_RTT_MS) || !remote.is_valid() {
            return;
        }
        let weight = self.error / (self.error + remote.error).max(f32::EPSILON);
        let dist = self.distance(remote);
        let sample_error = (dist - rtt_ms).abs() / rtt_ms;
        self.error = (sample_error * CE * weight + self.error * (1.0 - CE * weight)).max(MIN_ERROR);

        let force = CC * weight * (rtt_ms - dist);
        let (mut ux, mut uy) = (self.x - remote.x, self.y - remote.y);
        let len = (ux * ux + uy * uy).sqrt();
        if len > f32::EPSILON {
            ux /= len;
            uy /= len;
        } else {
            let angle: f32 = rand::thread_rng().gen_range(0.0..std::f32::consts::TAU);
            ux = angle.cos();
            uy = angle.sin();
        }
        self.x += ux * force;
        self.y += uy * force;
        self.h = (self.h + force).max(MIN_HEIGHT);

        if !self.is_valid() {
            *self = VivaldiPosition::default();
        }
    }

    pub fn encode(&self) -> NetworkPosition {
        let mut data = Vec::with_capacity(ENCODED_LEN);
        for v in [self.x, self.y, self.h, self.error] {
            data.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        NetworkPosition { kind: POSITION_TYPE_VIVALDI_V2, data }
    }

    pub fn decode(pos: &NetworkPosition) -> Option<Self> {
        if pos.kind != POSITION_TYPE_VIVALDI_V2 || pos.data.len() != ENCODED_LEN {
            return None;
        }
        let mut f = pos
            .data
            .chunks_exact(4)
            .map(|c| f32::from_bits(u32::from_be_bytes([c[0], c[1], c[2], c[3]])));
        let decoded = Self { x: f.next()?, y: f.next()?, h: f.next()?, error: f.next()? };
        decoded.is_valid().then_some(decoded)
    }
}

/// Owns the local node's coordinate.
#[derive(Default)]
pub struct NetworkPositionManager {
    local: Mutex<VivaldiPosition>,
}

impl NetworkPositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(&self) -> VivaldiPosition {
        *lock(&self.local)
    }

    /// Positions attached to outgoing replies.
    pub fn local_positions(&self) -> Vec<NetworkPosition> {
        vec![self.local().encode()]
    }

    /// Apply an RTT sample against whatever Vivaldi position the peer
    /// advertised. Peers without one contribute nothing.
    pub fn update(&self, rtt_ms: u64, remote: &[NetworkPosition]) {
        if let Some(remote) = remote.iter().find_map(VivaldiPosition::decode) {
            lock(&self.local).update(rtt_ms as f32, &remote);
        }
    }

    pub fn estimate_rtt(&self, remote: &[NetworkPosition]) -> Option<f32> {
        let remote = remote.iter().find_map(VivaldiPosition::decode)?;
        Some(self.local().distance(&remote))
    }

    pub fn reset(&self) {
        *lock(&self.local) = VivaldiPosition::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let p = VivaldiPosition { x: 1.5, y: -3.25, h: 8.0, error: 0.5 };
        assert_eq!(VivaldiPosition::decode(&p.encode()), Some(p));

        let foreign = NetworkPosition { kind: 99, data: vec![1, 2, 3] };
        assert_eq!(VivaldiPosition::decode(&foreign), None);
    }

    #[test]
    fn converges_towards_measured_rtt() {
        let mut local = VivaldiPosition::default();
        let remote = VivaldiPosition { x: 0.0, y: 0.0, h: MIN_HEIGHT, error: 0.2 };
        for _ in 0..200 {
            local.update(100.0, &remote);
        }
        let predicted = local.distance(&remote);
        assert!((predicted - 100.0).abs() < 10.0, "predicted {}", predicted);
        assert!(local.error < INITIAL_ERROR);
    }

    #[test]
    fn outliers_ignored() {
        let mut local = VivaldiPosition::default();
        let remote = VivaldiPosition::default();
        local.update(0.0, &remote);
        local.update(MAX_RTT_MS * 2.0, &remote);
        assert_eq!(local, VivaldiPosition::default());
    }

    #[test]
    fn manager_skips_unknown_kinds() {
        let mgr = NetworkPositionManager::new();
        mgr.update(50, &[NetworkPosition { kind: 1, data: vec![0; 16] }]);
        assert_eq!(mgr.local(), VivaldiPosition::default());

        let remote = VivaldiPosition { x: 10.0, y: 10.0, h: 1.0, error: 1.0 };
        mgr.update(50, &[remote.encode()]);
        assert_ne!(mgr.local(), VivaldiPosition::default());
        assert!(mgr.estimate_rtt(&[remote.encode()]).is_some());

        mgr.reset();
        assert_eq!(mgr.local(), VivaldiPosition::default());
    }
}
