use fastrand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::delay_queue::DelayQueue;
use super::{Outcome, StageContext};
use crate::frame::Frame;
use crate::sampling::Sampler;

/// Extra holding time per frame of excess queue depth
const EXCESS_DELAY: Duration = Duration::from_millis(1);

/// A soft-capacity FIFO modelling an oversized bottleneck buffer
///
/// Below capacity frames go straight through the queue. Past it, each arriving frame is
/// dropped with a probability that grows with the excess depth (certain at twice the
/// capacity) and otherwise held for longer the deeper the queue is. Release times never
/// decrease, so the queue stays FIFO. Due frames stay queued until the next stage can take
/// them, so a blocked output is what fills the queue.
pub(crate) struct BufferBloat {
    rng: Rng,
    queue: DelayQueue<Frame>,
    last_release: Option<Instant>,
}

impl BufferBloat {
    pub(crate) fn new(rng: Rng) -> Self {
        Self {
            rng,
            queue: DelayQueue::new(),
            last_release: None,
        }
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        let capacity = *cx.snapshot.buffer_bloat.packets.get(cx.direction) as usize;
        if capacity == 0 {
            return Outcome::Pass(frame);
        }

        let depth = self.queue.len();
        let mut release_at = cx.now;
        if depth >= capacity {
            let excess = depth - capacity + 1;
            if self.rng.chance(excess as f64 / capacity as f64) {
                trace!(direction = %cx.direction, depth, "buffer bloat: dropped frame");
                return Outcome::Drop;
            }

            release_at += EXCESS_DELAY * excess as u32;
        }

        if let Some(last) = self.last_release {
            release_at = release_at.max(last);
        }
        self.last_release = Some(release_at);

        self.queue.push(frame, release_at);
        Outcome::Queued
    }

    pub(crate) fn next_release(&self) -> Option<Instant> {
        self.queue.next_release()
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Frame> {
        self.queue.pop_due(now)
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use crate::direction::Direction;
    use crate::modules::testing::Bench;
    use crate::modules::{Released, Stage, StageKind};
    use crate::packet::test_frames;

    fn bench(capacity: u32) -> Bench {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.buffer_bloat.enabled = true;
        snapshot.buffer_bloat.packets.left_to_right = capacity;
        Bench::new(snapshot)
    }

    #[test]
    fn below_capacity_frames_are_not_delayed() {
        let mut bench = bench(4);
        let mut stage = Stage::new(StageKind::BufferBloat, Rng::with_seed(42));
        let now = Instant::now();

        for i in 0..4 {
            bench.run(&mut stage, test_frames::numbered(i), Direction::LeftToRight, now);
        }
        assert_eq!(stage.next_release(), Some(now));
    }

    #[test]
    fn congested_queue_delays_drops_and_stays_bounded() {
        let mut bench = bench(4);
        let mut stage = Stage::new(StageKind::BufferBloat, Rng::with_seed(42));
        let now = Instant::now();

        // Nothing is popped in between, as with an output that stays blocked
        let mut dropped = 0;
        for i in 0..200 {
            match bench.run(&mut stage, test_frames::numbered(i), Direction::LeftToRight, now) {
                Outcome::Drop => dropped += 1,
                Outcome::Queued => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        let Stage::BufferBloat(bloat) = &stage else {
            unreachable!()
        };
        // Admission is certain to fail once the depth reaches twice the capacity
        assert!(bloat.depth() > 4 && bloat.depth() < 8, "depth {}", bloat.depth());
        assert_eq!(dropped + bloat.depth(), 200);
        assert!(stage.next_release().is_some_and(|at| at == now));

        // FIFO release, with the excess frames held back
        let mut released = Vec::new();
        let mut last = 0;
        while let Some(Released::Forward(frame)) = stage.pop_due(now + Duration::from_secs(1)) {
            let number = test_frames::number_of(&frame);
            assert!(released.is_empty() || number > last);
            last = number;
            released.push(number);
        }
        assert_eq!(released[..4], [0, 1, 2, 3]);
    }

    #[test]
    fn zero_capacity_passes_through() {
        let mut bench = bench(0);
        let mut stage = Stage::new(StageKind::BufferBloat, Rng::with_seed(42));
        let outcome = bench.run(&mut stage, test_frames::numbered(1), Direction::LeftToRight, Instant::now());
        assert!(matches!(outcome, Outcome::Pass(_)));
    }
}
