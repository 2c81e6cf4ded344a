use tokio::time::Instant;
use tracing::{debug, trace};

use super::delay_queue::DelayQueue;
use super::{Outcome, StageContext};
use crate::frame::Frame;
use crate::packet::craft::{self, IcmpErrorKind};
use crate::packet::FrameInfo;

/// Replies waiting for their hop's RTT to elapse
const MAX_PENDING_REPLIES: usize = 1024;

/// Answers TTL-limited probes on behalf of a fabricated path
pub(crate) struct FakeTraceroute {
    pending: DelayQueue<Frame>,
}

impl FakeTraceroute {
    pub(crate) fn new() -> Self {
        Self {
            pending: DelayQueue::new(),
        }
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        FrameInfo::parse(frame.as_bytes())
            .and_then(|info| self.answer(&info, cx))
            .unwrap_or(Outcome::Pass(frame))
    }

    fn answer(&mut self, probe: &FrameInfo<'_>, cx: &mut StageContext<'_>) -> Option<Outcome> {
        let snapshot = cx.snapshot;
        let rule = snapshot
            .fake_traceroute
            .rules
            .iter()
            .find(|rule| rule.destination.contains(probe.ip.destination))?;
        let hop = rule.hops.get(usize::from(probe.ip.ttl))?;
        if hop.address.is_ipv4() != probe.is_ipv4() {
            return None;
        }

        if rule.blackhole {
            trace!(ttl = probe.ip.ttl, destination = %probe.ip.destination, "fake traceroute: blackholed probe");
            return Some(Outcome::Drop);
        }

        let kind = if rule.unreachable {
            IcmpErrorKind::Unreachable
        } else {
            IcmpErrorKind::TimeExceeded
        };
        let reply = craft::icmp_error_reply(probe, hop.address, kind)?;

        while self.pending.len() >= MAX_PENDING_REPLIES {
            let Some(evicted) = self.pending.evict_oldest() else {
                break;
            };
            cx.evicted(evicted);
        }

        debug!(
            ttl = probe.ip.ttl,
            hop = %hop.address,
            rtt = ?hop.rtt,
            "fake traceroute: answering probe"
        );
        self.pending.push(reply, cx.now + hop.rtt);
        Some(Outcome::Drop)
    }

    pub(crate) fn next_release(&self) -> Option<Instant> {
        self.pending.next_release()
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Frame> {
        self.pending.pop_due(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSnapshot, FakeTracerouteRule, Hop};
    use crate::direction::Direction;
    use crate::modules::testing::Bench;
    use crate::modules::{Released, Stage, StageKind};
    use crate::packet::{Transport, test_frames};
    use fastrand::Rng;
    use std::net::IpAddr;
    use std::time::Duration;

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const TARGET: [u8; 4] = [198, 51, 100, 7];

    fn hop(last_octet: u8, rtt_ms: u64) -> Hop {
        Hop {
            address: IpAddr::from([192, 0, 2, last_octet]),
            rtt: Duration::from_millis(rtt_ms),
        }
    }

    fn bench(unreachable: bool, blackhole: bool) -> Bench {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.fake_traceroute.enabled = true;
        snapshot.fake_traceroute.rules = vec![FakeTracerouteRule {
            destination: "198.51.100.0/24".parse().unwrap(),
            hops: vec![hop(1, 10), hop(2, 20), hop(3, 30)],
            unreachable,
            blackhole,
        }];
        Bench::new(snapshot)
    }

    fn probe(ttl: u8) -> Frame {
        test_frames::udp_with_ttl(
            IpAddr::from(CLIENT),
            IpAddr::from(TARGET),
            (50000, 33434),
            b"probe",
            ttl,
        )
    }

    /// ICMP type and code of a reply frame
    fn icmp_type_code(reply: &Frame) -> (u8, u8) {
        let info = FrameInfo::parse(reply.as_bytes()).unwrap();
        assert!(matches!(info.transport, Transport::Icmp));
        let message = info.ip_payload();
        (message[0], message[1])
    }

    #[test]
    fn probe_is_answered_by_the_indexed_hop_after_its_rtt() {
        let mut bench = bench(false, false);
        let mut stage = Stage::new(StageKind::FakeTraceroute, Rng::with_seed(42));
        let now = Instant::now();

        let outcome = bench.run(&mut stage, probe(2), Direction::LeftToRight, now);
        assert!(matches!(outcome, Outcome::Drop));
        assert!(bench.replies.is_empty());
        assert_eq!(stage.next_release(), Some(now + Duration::from_millis(30)));
        assert!(stage.pop_due(now + Duration::from_millis(29)).is_none());

        let Some(Released::Reply(reply)) = stage.pop_due(now + Duration::from_millis(30)) else {
            panic!("expected a reply");
        };
        let info = FrameInfo::parse(reply.as_bytes()).unwrap();
        assert_eq!(info.ip.source, IpAddr::from([192, 0, 2, 3]));
        assert_eq!(info.ip.destination, IpAddr::from(CLIENT));
        assert_eq!(icmp_type_code(&reply), (11, 0));
        assert!(stage.is_drained());
    }

    #[test]
    fn probes_beyond_the_last_hop_pass() {
        let mut bench = bench(false, false);
        let mut stage = Stage::new(StageKind::FakeTraceroute, Rng::with_seed(42));

        for ttl in [3, 64] {
            let outcome = bench.run(&mut stage, probe(ttl), Direction::LeftToRight, Instant::now());
            assert!(matches!(outcome, Outcome::Pass(_)));
        }
        assert!(stage.is_drained());
    }

    #[test]
    fn other_destinations_pass() {
        let mut bench = bench(false, false);
        let mut stage = Stage::new(StageKind::FakeTraceroute, Rng::with_seed(42));
        let frame = test_frames::udp_with_ttl(
            IpAddr::from(CLIENT),
            IpAddr::from([203, 0, 113, 1]),
            (50000, 33434),
            b"probe",
            1,
        );

        let outcome = bench.run(&mut stage, frame, Direction::LeftToRight, Instant::now());
        assert!(matches!(outcome, Outcome::Pass(_)));
    }

    #[test]
    fn unreachable_and_blackhole() {
        let mut bench = self::bench(true, false);
        let mut stage = Stage::new(StageKind::FakeTraceroute, Rng::with_seed(42));
        let now = Instant::now();
        bench.run(&mut stage, probe(0), Direction::LeftToRight, now);
        let Some(Released::Reply(reply)) = stage.pop_due(now + Duration::from_millis(10)) else {
            panic!("expected a reply");
        };
        assert_eq!(icmp_type_code(&reply), (3, 1));

        let mut bench = self::bench(false, true);
        let mut stage = Stage::new(StageKind::FakeTraceroute, Rng::with_seed(42));
        let outcome = bench.run(&mut stage, probe(1), Direction::LeftToRight, now);
        assert!(matches!(outcome, Outcome::Drop));
        assert!(stage.is_drained());
    }

    #[test]
    fn mismatched_hop_family_passes_the_probe() {
        let mut bench = bench(false, false);
        bench.snapshot.fake_traceroute.rules[0].hops[1].address = "2001:db8::1".parse().unwrap();
        let mut stage = Stage::new(StageKind::FakeTraceroute, Rng::with_seed(42));

        let outcome = bench.run(&mut stage, probe(1), Direction::LeftToRight, Instant::now());
        assert!(matches!(outcome, Outcome::Pass(_)));
    }
}
