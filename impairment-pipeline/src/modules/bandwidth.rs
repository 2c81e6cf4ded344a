use std::time::Duration;
use tokio::time::Instant;

use super::{Outcome, StageContext};
use crate::frame::Frame;

/// The smallest bucket must still fit one full-sized Ethernet frame
const MIN_BURST_BYTES: f64 = 1514.0;

/// The bucket holds this much transmission time worth of bytes
const BURST_WINDOW_SECS: f64 = 0.010;

/// Token bucket rate limiting
///
/// A frame that exceeds the budget is forwarded once the bucket has refilled, and the worker
/// holds every later frame behind it, so frames are delayed but never reordered.
pub(crate) struct Bandwidth {
    bucket: Option<TokenBucket>,
}

impl Bandwidth {
    pub(crate) fn new() -> Self {
        Self { bucket: None }
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        let mbps = *cx.snapshot.bandwidth.mbps.get(cx.direction);
        if mbps <= 0.0 {
            return Outcome::Pass(frame);
        }

        let bytes_per_second = mbps * 1_000_000.0 / 8.0;
        if self
            .bucket
            .as_ref()
            .is_none_or(|bucket| bucket.rate != bytes_per_second)
        {
            self.bucket = Some(TokenBucket::new(bytes_per_second, cx.now));
        }

        let Some(bucket) = &mut self.bucket else {
            return Outcome::Pass(frame);
        };

        let release_at = bucket.reserve(frame.len(), cx.now);
        if release_at > cx.now {
            Outcome::PassAt(frame, release_at)
        } else {
            Outcome::Pass(frame)
        }
    }
}

struct TokenBucket {
    /// Bytes per second
    rate: f64,
    burst: f64,
    /// Goes negative while frames are waiting for the bucket to refill
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, now: Instant) -> Self {
        let burst = (rate * BURST_WINDOW_SECS).max(MIN_BURST_BYTES);
        Self {
            rate,
            burst,
            tokens: burst,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Takes `size` bytes from the bucket and returns when they are paid for
    fn reserve(&mut self, size: usize, now: Instant) -> Instant {
        self.refill(now);
        self.tokens -= size as f64;

        if self.tokens >= 0.0 {
            now
        } else {
            now + Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use crate::direction::{Direction, PerDirection};
    use crate::modules::testing::Bench;
    use crate::modules::{Stage, StageKind};
    use fastrand::Rng;

    fn frame(len: usize) -> Frame {
        Frame::new(vec![0; len])
    }

    #[test]
    fn frames_within_burst_pass_immediately() {
        let mut bucket = TokenBucket::new(125_000.0, Instant::now());
        let now = bucket.last_refill;
        assert_eq!(bucket.reserve(1000, now), now);
        assert!(bucket.reserve(1000, now) > now);
    }

    #[test]
    fn sustained_rate_matches_configuration() {
        // 1 Mbps is 125 000 bytes per second
        let mut snapshot = ConfigSnapshot::default();
        snapshot.bandwidth.enabled = true;
        snapshot.bandwidth.mbps = PerDirection::new(1.0, 0.0);
        let mut bench = Bench::new(snapshot);
        let mut stage = Stage::new(StageKind::Bandwidth, Rng::with_seed(42));

        let start = Instant::now();
        let mut now = start;
        for _ in 0..101 {
            match bench.run(&mut stage, frame(1250), Direction::LeftToRight, now) {
                Outcome::Pass(_) => {}
                // The worker waits for the release before taking the next frame
                Outcome::PassAt(_, release_at) => now = release_at,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        // 100 frames beyond the first, minus the burst allowance
        let elapsed = (now - start).as_secs_f64();
        let expected = (101.0 * 1250.0 - 1514.0) / 125_000.0;
        assert!((elapsed - expected).abs() < 0.001, "elapsed {elapsed}, expected {expected}");
    }

    #[test]
    fn zero_rate_is_unlimited() {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.bandwidth.enabled = true;
        let mut bench = Bench::new(snapshot);
        let mut stage = Stage::new(StageKind::Bandwidth, Rng::with_seed(42));

        let now = Instant::now();
        for _ in 0..1000 {
            let outcome = bench.run(&mut stage, frame(1500), Direction::RightToLeft, now);
            assert!(matches!(outcome, Outcome::Pass(_)));
        }
    }
}
