use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::direction::{Direction, PerDirection};
use crate::modules::StageKind;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketStats {
    pub packets: u64,
    pub bytes: u64,
}

/// What happened to the frames a stage received
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageStats {
    pub passed: PacketStats,
    pub dropped: PacketStats,
    pub replied: PacketStats,
}

/// Totals for the whole tunnel, across every chain generation
#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub ingress: PerDirection<PacketStats>,
    pub egress: PerDirection<PacketStats>,
    /// Per direction, in pipeline order
    pub stages: PerDirection<Vec<(StageKind, StageStats)>>,
}

impl PipelineStats {
    pub fn stage(&self, direction: Direction, kind: StageKind) -> StageStats {
        self.stages
            .get(direction)
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, stats)| *stats)
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub(crate) struct PacketCounter {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl PacketCounter {
    pub(crate) fn track_one(&self, size_bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size_bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> PacketStats {
        PacketStats {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StageCounters {
    pub(crate) passed: PacketCounter,
    pub(crate) dropped: PacketCounter,
    pub(crate) replied: PacketCounter,
}

impl StageCounters {
    fn get(&self) -> StageStats {
        StageStats {
            passed: self.passed.get(),
            dropped: self.dropped.get(),
            replied: self.replied.get(),
        }
    }
}

/// Counters shared by the workers; outlives chain generations so totals survive reloads
#[derive(Default)]
pub(crate) struct StatsRegistry {
    pub(crate) ingress: PerDirection<PacketCounter>,
    pub(crate) egress: PerDirection<PacketCounter>,
    stages: Mutex<HashMap<(Direction, StageKind), Arc<StageCounters>>>,
}

impl StatsRegistry {
    pub(crate) fn stage(&self, direction: Direction, kind: StageKind) -> Arc<StageCounters> {
        self.stages
            .lock()
            .entry((direction, kind))
            .or_default()
            .clone()
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        let stages = self.stages.lock();
        let per_direction = |direction: Direction| {
            StageKind::PIPELINE_ORDER
                .iter()
                .filter_map(|&kind| {
                    stages
                        .get(&(direction, kind))
                        .map(|counters| (kind, counters.get()))
                })
                .collect()
        };

        PipelineStats {
            ingress: PerDirection::from_fn(|d| self.ingress.get(d).get()),
            egress: PerDirection::from_fn(|d| self.egress.get(d).get()),
            stages: PerDirection::from_fn(per_direction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_survive_lookups() {
        let registry = StatsRegistry::default();
        registry
            .stage(Direction::LeftToRight, StageKind::Loss)
            .dropped
            .track_one(100);
        registry
            .stage(Direction::LeftToRight, StageKind::Loss)
            .dropped
            .track_one(50);
        registry.ingress.left_to_right.track_one(150);

        let stats = registry.snapshot();
        let loss = stats.stage(Direction::LeftToRight, StageKind::Loss);
        assert_eq!(loss.dropped, PacketStats { packets: 2, bytes: 150 });
        assert_eq!(stats.ingress.left_to_right.packets, 1);
        assert_eq!(
            stats.stage(Direction::RightToLeft, StageKind::Loss),
            StageStats::default()
        );
    }
}
