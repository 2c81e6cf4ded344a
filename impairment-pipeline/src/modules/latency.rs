use fastrand::Rng;
use tokio::time::Instant;
use tracing::trace;

use super::delay_queue::DelayQueue;
use super::{Outcome, StageContext};
use crate::config::TUNNEL_OVERHEAD;
use crate::frame::Frame;
use crate::packet;
use crate::sampling::Sampler;

/// Gaussian delay with a bounded queue that evicts its oldest frame when full
pub(crate) struct Latency {
    rng: Rng,
    queue: DelayQueue<Frame>,
}

impl Latency {
    pub(crate) fn new(rng: Rng) -> Self {
        Self {
            rng,
            queue: DelayQueue::new(),
        }
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        let config = &cx.snapshot.latency;
        if config.exclude_icmp && packet::is_icmp(frame.as_bytes()) {
            return Outcome::Pass(frame);
        }

        let mut delay = self.rng.duration(*config.delay.get(cx.direction));
        if config.simulate_tunnel {
            delay += TUNNEL_OVERHEAD;
        }

        while self.queue.len() >= config.capacity() {
            let Some(evicted) = self.queue.evict_oldest() else {
                break;
            };
            trace!(direction = %cx.direction, "latency: queue full, evicted oldest frame");
            cx.evicted(evicted);
        }

        self.queue.push(frame, cx.now + delay);
        Outcome::Queued
    }

    pub(crate) fn next_release(&self) -> Option<Instant> {
        self.queue.next_release()
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Frame> {
        self.queue.pop_due(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use crate::direction::{Direction, PerDirection};
    use crate::modules::testing::Bench;
    use crate::modules::{Released, Stage, StageKind};
    use crate::packet::test_frames;
    use crate::sampling::GaussianParam;
    use std::net::IpAddr;
    use std::time::Duration;

    fn bench(delay_secs: f64, max_buffer_size: usize) -> Bench {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.latency.enabled = true;
        snapshot.latency.max_buffer_size = max_buffer_size;
        snapshot.latency.delay = PerDirection::new(
            GaussianParam::constant(delay_secs),
            GaussianParam::constant(delay_secs),
        );
        Bench::new(snapshot)
    }

    fn drain(stage: &mut Stage, now: Instant) -> Vec<u32> {
        let mut released = Vec::new();
        while let Some(Released::Forward(frame)) = stage.pop_due(now) {
            released.push(test_frames::number_of(&frame));
        }
        released
    }

    #[test]
    fn frames_wait_for_their_delay_in_admission_order() {
        let mut bench = bench(0.1, 0);
        let mut stage = Stage::new(StageKind::Latency, Rng::with_seed(42));
        let start = Instant::now();

        for i in 0..3 {
            let admitted = start + Duration::from_millis(u64::from(i));
            let outcome = bench.run(&mut stage, test_frames::numbered(i), Direction::LeftToRight, admitted);
            assert!(matches!(outcome, Outcome::Queued));
        }

        assert_eq!(stage.next_release(), Some(start + Duration::from_millis(100)));
        assert!(drain(&mut stage, start + Duration::from_millis(99)).is_empty());
        assert_eq!(drain(&mut stage, start + Duration::from_millis(101)), vec![0, 1]);
        assert_eq!(drain(&mut stage, start + Duration::from_millis(102)), vec![2]);
        assert!(stage.is_drained());
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let mut bench = bench(1.0, 2);
        let mut stage = Stage::new(StageKind::Latency, Rng::with_seed(42));
        let now = Instant::now();

        for i in 0..3 {
            bench.run(&mut stage, test_frames::numbered(i), Direction::LeftToRight, now);
        }

        assert_eq!(bench.counters.dropped.get().packets, 1);
        assert_eq!(drain(&mut stage, now + Duration::from_secs(2)), vec![1, 2]);
    }

    #[test]
    fn tunnel_overhead_and_icmp_bypass() {
        let mut bench = bench(0.0, 0);
        bench.snapshot.latency.simulate_tunnel = true;
        bench.snapshot.latency.exclude_icmp = true;
        let mut stage = Stage::new(StageKind::Latency, Rng::with_seed(42));
        let now = Instant::now();

        let ping = test_frames::icmp_echo(IpAddr::from([10, 0, 0, 1]), IpAddr::from([10, 0, 0, 2]));
        assert!(matches!(
            bench.run(&mut stage, ping, Direction::LeftToRight, now),
            Outcome::Pass(_)
        ));

        bench.run(&mut stage, test_frames::numbered(1), Direction::LeftToRight, now);
        assert_eq!(stage.next_release(), Some(now + TUNNEL_OVERHEAD));
    }
}
