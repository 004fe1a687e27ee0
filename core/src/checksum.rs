// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-tick state checksums and desync localization.
//!
//! Each client periodically digests its simulation state into a
//! `StateChecksum`: a primary blake3 hash plus auxiliary sums. When
//! primaries disagree, the auxiliary sums let an observer localize the
//! kind of divergence without shipping full state over the wire.

use crate::Tick;
use serde::{Deserialize, Serialize};

/// Minimal view of one simulation entity, as fed to the checksum.
///
/// The ordering of digests does not matter; entities are sorted by id
/// before hashing so all clients fold them identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDigest {
    pub id: u64,
    pub health: i64,
    pub x: i32,
    pub y: i32,
}

/// Digest of the simulation state at one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChecksum {
    pub tick: Tick,
    /// Primary blake3 hash over the full canonical snapshot (hex)
    pub primary: String,
    /// Number of live entities
    #[serde(rename = "entityCount")]
    pub entity_count: u64,
    /// Sum of all player resource stockpiles
    #[serde(rename = "resourceTotal")]
    pub resource_total: i64,
    /// Sum of all entity health values
    #[serde(rename = "healthTotal")]
    pub health_total: i64,
    /// blake3 hash over entity positions only (hex)
    #[serde(rename = "positionHash")]
    pub position_hash: String,
}

impl StateChecksum {
    /// Compute the checksum for `tick` from entity digests and the
    /// aggregate resource total.
    pub fn compute(tick: Tick, entities: &[EntityDigest], resource_total: i64) -> Self {
        let mut sorted: Vec<&EntityDigest> = entities.iter().collect();
        sorted.sort_by_key(|e| e.id);

        let mut primary = blake3::Hasher::new();
        let mut positions = blake3::Hasher::new();
        primary.update(&tick.to_le_bytes());
        primary.update(&resource_total.to_le_bytes());

        let mut health_total: i64 = 0;
        for e in &sorted {
            primary.update(&e.id.to_le_bytes());
            primary.update(&e.health.to_le_bytes());
            primary.update(&e.x.to_le_bytes());
            primary.update(&e.y.to_le_bytes());
            positions.update(&e.id.to_le_bytes());
            positions.update(&e.x.to_le_bytes());
            positions.update(&e.y.to_le_bytes());
            health_total += e.health;
        }

        Self {
            tick,
            primary: hex::encode(primary.finalize().as_bytes()),
            entity_count: sorted.len() as u64,
            resource_total,
            health_total,
            position_hash: hex::encode(positions.finalize().as_bytes()),
        }
    }

    /// True when the primary hashes agree.
    pub fn matches(&self, other: &StateChecksum) -> bool {
        self.primary == other.primary
    }
}

/// What kind of state diverged, as inferred from the auxiliary sums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivergenceKind {
    EntityCount,
    Resources,
    Health,
    Positions,
    /// Primaries differ but every auxiliary sum agrees
    Unknown,
}

/// Localize a divergence between two checksums for the same tick.
///
/// Returns `None` when the primaries agree. The auxiliary fields are
/// checked in order of how cheaply they narrow the search: a count
/// mismatch explains everything downstream of it.
pub fn localize(local: &StateChecksum, remote: &StateChecksum) -> Option<DivergenceKind> {
    if local.matches(remote) {
        return None;
    }
    let kind = if local.entity_count != remote.entity_count {
        DivergenceKind::EntityCount
    } else if local.resource_total != remote.resource_total {
        DivergenceKind::Resources
    } else if local.health_total != remote.health_total {
        DivergenceKind::Health
    } else if local.position_hash != remote.position_hash {
        DivergenceKind::Positions
    } else {
        DivergenceKind::Unknown
    };
    Some(kind)
}

/// Report raised when two clients disagree about the state at a tick.
///
/// Desyncs are not fatal inside the protocol layer; the report travels
/// upward with both checksums so the consumer decides whether to pause,
/// resync or abort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncReport {
    pub tick: Tick,
    pub local: StateChecksum,
    pub remote: StateChecksum,
    pub divergence: DivergenceKind,
    /// Whether the reporter wants a full state dump for diagnosis
    #[serde(rename = "requestStateDump")]
    pub request_state_dump: bool,
}

impl DesyncReport {
    /// Build a report from two mismatched checksums. Returns `None`
    /// when the checksums actually agree.
    pub fn new(
        local: StateChecksum,
        remote: StateChecksum,
        request_state_dump: bool,
    ) -> Option<Self> {
        let divergence = localize(&local, &remote)?;
        Some(Self {
            tick: local.tick,
            local,
            remote,
            divergence,
            request_state_dump,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities() -> Vec<EntityDigest> {
        vec![
            EntityDigest { id: 1, health: 100, x: 10, y: 20 },
            EntityDigest { id: 2, health: 250, x: -5, y: 7 },
            EntityDigest { id: 3, health: 80, x: 0, y: 0 },
        ]
    }

    #[test]
    fn identical_state_produces_identical_checksums() {
        let a = StateChecksum::compute(40, &entities(), 1500);
        let b = StateChecksum::compute(40, &entities(), 1500);
        assert_eq!(a, b);
        assert!(a.matches(&b));
        assert_eq!(localize(&a, &b), None);
    }

    #[test]
    fn entity_order_does_not_matter() {
        let mut reversed = entities();
        reversed.reverse();
        let a = StateChecksum::compute(40, &entities(), 1500);
        let b = StateChecksum::compute(40, &reversed, 1500);
        assert_eq!(a, b);
    }

    #[test]
    fn diverging_health_is_localized() {
        let mut damaged = entities();
        damaged[1].health -= 30;

        let a = StateChecksum::compute(40, &entities(), 1500);
        let b = StateChecksum::compute(40, &damaged, 1500);

        assert!(!a.matches(&b));
        assert_eq!(localize(&a, &b), Some(DivergenceKind::Health));

        let report = DesyncReport::new(a, b, false).unwrap();
        assert_eq!(report.tick, 40);
        assert_eq!(report.divergence, DivergenceKind::Health);
    }

    #[test]
    fn diverging_position_is_localized() {
        let mut drifted = entities();
        drifted[0].x += 1;

        let a = StateChecksum::compute(12, &entities(), 0);
        let b = StateChecksum::compute(12, &drifted, 0);
        assert_eq!(localize(&a, &b), Some(DivergenceKind::Positions));
    }

    #[test]
    fn missing_entity_is_localized_as_count() {
        let mut fewer = entities();
        fewer.pop();

        let a = StateChecksum::compute(12, &entities(), 0);
        let b = StateChecksum::compute(12, &fewer, 0);
        assert_eq!(localize(&a, &b), Some(DivergenceKind::EntityCount));
    }

    #[test]
    fn report_requires_actual_mismatch() {
        let a = StateChecksum::compute(9, &entities(), 10);
        let b = StateChecksum::compute(9, &entities(), 10);
        assert!(DesyncReport::new(a, b, true).is_none());
    }
}
