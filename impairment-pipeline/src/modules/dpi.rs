use fastrand::Rng;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Outcome, StageContext};
use crate::config::DpiRule;
use crate::frame::Frame;
use crate::packet::{FrameInfo, Transport, craft};
use crate::sampling::Sampler;

/// How often expired flow penalties are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What a triggered rule penalises
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum PenaltyKey {
    /// Both endpoints in a fixed order, so either side of the conversation maps to the same key
    Flow {
        protocol: u8,
        low: (IpAddr, u16),
        high: (IpAddr, u16),
    },
    Hosts(IpAddr, IpAddr),
}

impl PenaltyKey {
    fn flow(info: &FrameInfo<'_>, ports: (u16, u16)) -> Self {
        let a = (info.ip.source, ports.0);
        let b = (info.ip.destination, ports.1);
        Self::Flow {
            protocol: info.ip.protocol,
            low: a.min(b),
            high: a.max(b),
        }
    }

    fn hosts(info: &FrameInfo<'_>) -> Self {
        let (a, b) = (info.ip.source, info.ip.destination);
        Self::Hosts(a.min(b), a.max(b))
    }
}

#[derive(Clone, Copy, Debug)]
struct Penalty {
    rule: usize,
    /// `None` for blocked hosts, which stay blocked for the lifetime of the stage
    expires: Option<Instant>,
}

impl Penalty {
    fn is_active(&self, now: Instant) -> bool {
        self.expires.is_none_or(|expires| now < expires)
    }
}

/// Keyword matching on TCP and UDP payloads
///
/// A rule fires at most once per cooldown window. Firing penalises the flow (or the whole
/// host pair) so that its later frames suffer the rule's loss, and optionally tears down
/// TCP connections with resets in both directions.
pub(crate) struct Dpi {
    rng: Rng,
    last_triggered: Vec<Option<Instant>>,
    penalties: HashMap<PenaltyKey, Penalty>,
    next_sweep: Option<Instant>,
    triggers: u64,
}

impl Dpi {
    pub(crate) fn new(rng: Rng) -> Self {
        Self {
            rng,
            last_triggered: Vec::new(),
            penalties: HashMap::new(),
            next_sweep: None,
            triggers: 0,
        }
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        FrameInfo::parse(frame.as_bytes())
            .and_then(|info| self.inspect(&info, cx))
            .unwrap_or(Outcome::Pass(frame))
    }

    /// Returns `None` when the frame should continue unchanged
    fn inspect(&mut self, info: &FrameInfo<'_>, cx: &mut StageContext<'_>) -> Option<Outcome> {
        let snapshot = cx.snapshot;
        let rules = &snapshot.dpi.rules;
        self.sweep(cx.now);

        // Blocked hosts apply to portless traffic too
        let ports = info.ports();
        let hosts = PenaltyKey::hosts(info);
        let penalty = [ports.map(|ports| PenaltyKey::flow(info, ports)), Some(hosts)]
            .iter()
            .flatten()
            .filter_map(|key| self.penalties.get(key))
            .find(|penalty| penalty.is_active(cx.now))
            .copied();
        if let Some(penalty) = penalty {
            let loss = rules
                .get(penalty.rule)
                .map_or(0.0, |rule| *rule.loss.get(cx.direction));
            if self.rng.chance(loss) {
                trace!(direction = %cx.direction, rule = penalty.rule, "dpi: dropped penalised frame");
                return Some(Outcome::Drop);
            }
        }

        let ports = ports?;
        let flow = PenaltyKey::flow(info, ports);
        let payload = info.payload();
        let (index, rule) = rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule_matches(rule, ports, payload))?;

        if self.last_triggered.len() < rules.len() {
            self.last_triggered.resize(rules.len(), None);
        }
        let cooling_down = self.last_triggered[index]
            .is_some_and(|last| cx.now < last + rule.cooldown);
        if cooling_down {
            return None;
        }

        self.last_triggered[index] = Some(cx.now);
        self.triggers += 1;
        let (key, expires) = if rule.block_whole_ip {
            (hosts, None)
        } else {
            (flow, Some(cx.now + rule.cooldown))
        };
        self.penalties.insert(key, Penalty { rule: index, expires });
        debug!(
            direction = %cx.direction,
            rule = index,
            source = %info.ip.source,
            destination = %info.ip.destination,
            "dpi: rule triggered"
        );

        if let Transport::Tcp(tcp) = info.transport {
            if rule.reset_tcp && !tcp.is_reset() {
                let back = craft::tcp_reset_to_source(info, &tcp)?;
                let forward = craft::tcp_reset_to_destination(info, &tcp)?;
                cx.reply(back);
                return Some(Outcome::Pass(forward));
            }
        }

        self.rng
            .chance(*rule.loss.get(cx.direction))
            .then_some(Outcome::Drop)
    }

    fn sweep(&mut self, now: Instant) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }

        self.penalties.retain(|_, penalty| penalty.is_active(now));
        self.next_sweep = Some(now + SWEEP_INTERVAL);
    }
}

fn rule_matches(rule: &DpiRule, (source, destination): (u16, u16), payload: &[u8]) -> bool {
    let port_matches = rule.ports.is_empty()
        || rule.ports.contains(&source)
        || rule.ports.contains(&destination);

    port_matches
        && !rule.keyword.is_empty()
        && payload
            .windows(rule.keyword.len())
            .any(|window| window == rule.keyword.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use crate::direction::{Direction, PerDirection};
    use crate::modules::testing::Bench;
    use crate::modules::{Stage, StageKind};
    use crate::packet::test_frames;

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 1, 80];

    fn bench(loss: f64, block_whole_ip: bool, reset_tcp: bool) -> Bench {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.dpi.enabled = true;
        snapshot.dpi.rules = vec![DpiRule {
            ports: vec![80],
            keyword: b"forbidden".to_vec(),
            block_whole_ip,
            loss: PerDirection::new(loss, loss),
            reset_tcp,
            cooldown: Duration::from_secs(10),
        }];
        Bench::new(snapshot)
    }

    fn request(client_port: u16, payload: &[u8]) -> Frame {
        test_frames::udp(
            IpAddr::from(CLIENT),
            IpAddr::from(SERVER),
            (client_port, 80),
            payload,
        )
    }

    fn triggers(stage: &Stage) -> u64 {
        let Stage::Dpi(dpi) = stage else {
            unreachable!()
        };
        dpi.triggers
    }

    #[test]
    fn cooldown_limits_triggers() {
        let mut bench = bench(0.0, false, false);
        let mut stage = Stage::new(StageKind::Dpi, Rng::with_seed(42));
        let start = Instant::now();

        for offset in [0, 1, 5] {
            let at = start + Duration::from_secs(offset);
            let outcome = bench.run(&mut stage, request(40000, b"a forbidden word"), Direction::LeftToRight, at);
            assert!(matches!(outcome, Outcome::Pass(_)));
        }
        assert_eq!(triggers(&stage), 1);

        let after = start + Duration::from_secs(11);
        bench.run(&mut stage, request(40000, b"forbidden"), Direction::LeftToRight, after);
        assert_eq!(triggers(&stage), 2);
    }

    #[test]
    fn unmatched_frames_pass() {
        let mut bench = bench(1.0, false, false);
        let mut stage = Stage::new(StageKind::Dpi, Rng::with_seed(42));
        let now = Instant::now();

        let outcome = bench.run(&mut stage, request(40000, b"harmless"), Direction::LeftToRight, now);
        assert!(matches!(outcome, Outcome::Pass(_)));

        let other_port = test_frames::udp(IpAddr::from(CLIENT), IpAddr::from(SERVER), (40000, 8080), b"forbidden");
        let outcome = bench.run(&mut stage, other_port, Direction::LeftToRight, now);
        assert!(matches!(outcome, Outcome::Pass(_)));
        assert_eq!(triggers(&stage), 0);
    }

    #[test]
    fn trigger_penalises_the_flow_until_cooldown_expires() {
        let mut bench = bench(1.0, false, false);
        let mut stage = Stage::new(StageKind::Dpi, Rng::with_seed(42));
        let start = Instant::now();

        let outcome = bench.run(&mut stage, request(40000, b"forbidden"), Direction::LeftToRight, start);
        assert!(matches!(outcome, Outcome::Drop));

        // Same flow, innocent payload
        let later = start + Duration::from_secs(2);
        let outcome = bench.run(&mut stage, request(40000, b"hello"), Direction::LeftToRight, later);
        assert!(matches!(outcome, Outcome::Drop));

        // A different flow between the same hosts is not affected
        let outcome = bench.run(&mut stage, request(40001, b"hello"), Direction::LeftToRight, later);
        assert!(matches!(outcome, Outcome::Pass(_)));

        let expired = start + Duration::from_secs(10);
        let outcome = bench.run(&mut stage, request(40000, b"hello"), Direction::LeftToRight, expired);
        assert!(matches!(outcome, Outcome::Pass(_)));
    }

    #[test]
    fn block_whole_ip_covers_every_flow() {
        let mut bench = bench(1.0, true, false);
        let mut stage = Stage::new(StageKind::Dpi, Rng::with_seed(42));
        let start = Instant::now();

        bench.run(&mut stage, request(40000, b"forbidden"), Direction::LeftToRight, start);

        let much_later = start + Duration::from_secs(3600);
        let outcome = bench.run(&mut stage, request(50000, b"hello"), Direction::LeftToRight, much_later);
        assert!(matches!(outcome, Outcome::Drop));

        let reverse = test_frames::udp(IpAddr::from(SERVER), IpAddr::from(CLIENT), (80, 50000), b"hello");
        let outcome = bench.run(&mut stage, reverse, Direction::LeftToRight, much_later);
        assert!(matches!(outcome, Outcome::Drop));
    }

    #[test]
    fn blocked_hosts_lose_portless_traffic_too() {
        let mut blocking = bench(1.0, true, false);
        let mut stage = Stage::new(StageKind::Dpi, Rng::with_seed(42));
        let start = Instant::now();

        let ping = || test_frames::icmp_echo(IpAddr::from(CLIENT), IpAddr::from(SERVER));
        let outcome = blocking.run(&mut stage, ping(), Direction::LeftToRight, start);
        assert!(matches!(outcome, Outcome::Pass(_)));

        blocking.run(&mut stage, request(40000, b"forbidden"), Direction::LeftToRight, start);

        let later = start + Duration::from_secs(60);
        let outcome = blocking.run(&mut stage, ping(), Direction::LeftToRight, later);
        assert!(matches!(outcome, Outcome::Drop));

        // Flow penalties need ports, so without a host block ICMP still passes
        let mut flow_only = bench(1.0, false, false);
        let mut stage = Stage::new(StageKind::Dpi, Rng::with_seed(42));
        flow_only.run(&mut stage, request(40000, b"forbidden"), Direction::LeftToRight, start);
        let outcome = flow_only.run(&mut stage, ping(), Direction::LeftToRight, start);
        assert!(matches!(outcome, Outcome::Pass(_)));
    }

    #[test]
    fn reset_tcp_resets_both_ends() {
        let mut bench = bench(0.0, false, true);
        let mut stage = Stage::new(StageKind::Dpi, Rng::with_seed(42));

        let segment = test_frames::tcp(IpAddr::from(CLIENT), IpAddr::from(SERVER), (40000, 80), 100, b"GET /forbidden");
        let outcome = bench.run(&mut stage, segment, Direction::LeftToRight, Instant::now());

        let Outcome::Pass(forward) = outcome else {
            panic!("expected a reset toward the server");
        };
        let forward = FrameInfo::parse(forward.as_bytes()).unwrap();
        assert_eq!(forward.ip.destination, IpAddr::from(SERVER));
        assert!(matches!(forward.transport, Transport::Tcp(tcp) if tcp.is_reset() && tcp.sequence == 100));

        let back = bench.replies.pop_front().unwrap();
        let back = FrameInfo::parse(back.as_bytes()).unwrap();
        assert_eq!(back.ip.destination, IpAddr::from(CLIENT));
        assert!(matches!(back.transport, Transport::Tcp(tcp) if tcp.is_reset() && tcp.sequence == 1000));
    }
}
