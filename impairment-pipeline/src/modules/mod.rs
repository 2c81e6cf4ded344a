//! The impairment stages
//!
//! Every stage owns its private state exclusively and reads its parameters from the snapshot
//! handed to it with each frame. Stages never block: time-based policies are expressed through
//! [`Outcome::PassAt`] or through the stage's own delay queue, which the worker drains.

mod bandwidth;
mod buffer_bloat;
mod cutoff;
mod delay_queue;
mod dns_poison;
mod dpi;
mod fake_traceroute;
mod ip_firewall;
mod latency;
mod loss;

use fastrand::Rng;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use tokio::time::Instant;

use crate::config::ConfigSnapshot;
use crate::direction::Direction;
use crate::frame::Frame;
use crate::stats::StageCounters;

use bandwidth::Bandwidth;
use buffer_bloat::BufferBloat;
use cutoff::Cutoff;
use dns_poison::DnsPoison;
use dpi::Dpi;
use fake_traceroute::FakeTraceroute;
use ip_firewall::IpFirewall;
use latency::Latency;
use loss::Loss;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Bandwidth,
    FakeTraceroute,
    Cutoff,
    Loss,
    DnsPoison,
    Dpi,
    IpFirewall,
    Latency,
    BufferBloat,
}

impl StageKind {
    /// The order frames traverse the stages, from chain head to output
    pub const PIPELINE_ORDER: [StageKind; 9] = [
        StageKind::Bandwidth,
        StageKind::FakeTraceroute,
        StageKind::Cutoff,
        StageKind::Loss,
        StageKind::DnsPoison,
        StageKind::Dpi,
        StageKind::IpFirewall,
        StageKind::Latency,
        StageKind::BufferBloat,
    ];

    /// The name of the stage's configuration block
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Bandwidth => "Bandwidth",
            StageKind::FakeTraceroute => "FakeTraceroute",
            StageKind::Cutoff => "Cutoff",
            StageKind::Loss => "Loss",
            StageKind::DnsPoison => "DNSPoison",
            StageKind::Dpi => "DPI",
            StageKind::IpFirewall => "IPFirewall",
            StageKind::Latency => "Latency",
            StageKind::BufferBloat => "BufferBloat",
        }
    }

    pub fn is_enabled(self, snapshot: &ConfigSnapshot) -> bool {
        match self {
            StageKind::Bandwidth => snapshot.bandwidth.enabled,
            StageKind::FakeTraceroute => snapshot.fake_traceroute.enabled,
            StageKind::Cutoff => snapshot.cutoff.enabled,
            StageKind::Loss => snapshot.loss.enabled,
            StageKind::DnsPoison => snapshot.dns_poison.enabled,
            StageKind::Dpi => snapshot.dpi.enabled,
            StageKind::IpFirewall => snapshot.ip_firewall.enabled,
            StageKind::Latency => snapshot.latency.enabled,
            StageKind::BufferBloat => snapshot.buffer_bloat.enabled,
        }
    }
}

impl Display for StageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What a stage decided for one frame
#[derive(Debug)]
pub(crate) enum Outcome {
    Pass(Frame),
    /// Forward once the instant is reached, holding back everything behind it
    PassAt(Frame, Instant),
    Drop,
    /// The stage keeps the frame in its own queue until it is due
    Queued,
}

/// A frame leaving a stage's own queue
#[derive(Debug)]
pub(crate) enum Released {
    Forward(Frame),
    Reply(Frame),
}

/// Everything a stage may consult or produce while handling one frame
pub(crate) struct StageContext<'a> {
    pub(crate) snapshot: &'a ConfigSnapshot,
    pub(crate) direction: Direction,
    pub(crate) now: Instant,
    replies: &'a mut VecDeque<Frame>,
    counters: &'a StageCounters,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        snapshot: &'a ConfigSnapshot,
        direction: Direction,
        now: Instant,
        replies: &'a mut VecDeque<Frame>,
        counters: &'a StageCounters,
    ) -> Self {
        Self {
            snapshot,
            direction,
            now,
            replies,
            counters,
        }
    }

    /// Sends a synthesized frame back toward the sender of the current one
    pub(crate) fn reply(&mut self, frame: Frame) {
        self.counters.replied.track_one(frame.len());
        self.replies.push_back(frame);
    }

    /// Accounts for a queued frame the stage had to give up
    pub(crate) fn evicted(&self, frame: Frame) {
        self.counters.dropped.track_one(frame.len());
    }
}

pub(crate) enum Stage {
    Bandwidth(Bandwidth),
    FakeTraceroute(FakeTraceroute),
    Cutoff(Cutoff),
    Loss(Loss),
    DnsPoison(DnsPoison),
    Dpi(Dpi),
    IpFirewall(IpFirewall),
    Latency(Latency),
    BufferBloat(BufferBloat),
}

impl Stage {
    pub(crate) fn new(kind: StageKind, rng: Rng) -> Self {
        match kind {
            StageKind::Bandwidth => Stage::Bandwidth(Bandwidth::new()),
            StageKind::FakeTraceroute => Stage::FakeTraceroute(FakeTraceroute::new()),
            StageKind::Cutoff => Stage::Cutoff(Cutoff::new(rng)),
            StageKind::Loss => Stage::Loss(Loss::new(rng)),
            StageKind::DnsPoison => Stage::DnsPoison(DnsPoison),
            StageKind::Dpi => Stage::Dpi(Dpi::new(rng)),
            StageKind::IpFirewall => Stage::IpFirewall(IpFirewall::new(rng)),
            StageKind::Latency => Stage::Latency(Latency::new(rng)),
            StageKind::BufferBloat => Stage::BufferBloat(BufferBloat::new(rng)),
        }
    }

    pub(crate) fn kind(&self) -> StageKind {
        match self {
            Stage::Bandwidth(_) => StageKind::Bandwidth,
            Stage::FakeTraceroute(_) => StageKind::FakeTraceroute,
            Stage::Cutoff(_) => StageKind::Cutoff,
            Stage::Loss(_) => StageKind::Loss,
            Stage::DnsPoison(_) => StageKind::DnsPoison,
            Stage::Dpi(_) => StageKind::Dpi,
            Stage::IpFirewall(_) => StageKind::IpFirewall,
            Stage::Latency(_) => StageKind::Latency,
            Stage::BufferBloat(_) => StageKind::BufferBloat,
        }
    }

    /// Whether frames leaving the stage's own queue travel back toward the sender
    pub(crate) fn releases_replies(&self) -> bool {
        matches!(self, Stage::FakeTraceroute(_))
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        match self {
            Stage::Bandwidth(stage) => stage.process(frame, cx),
            Stage::FakeTraceroute(stage) => stage.process(frame, cx),
            Stage::Cutoff(stage) => stage.process(frame, cx),
            Stage::Loss(stage) => stage.process(frame, cx),
            Stage::DnsPoison(stage) => stage.process(frame, cx),
            Stage::Dpi(stage) => stage.process(frame, cx),
            Stage::IpFirewall(stage) => stage.process(frame, cx),
            Stage::Latency(stage) => stage.process(frame, cx),
            Stage::BufferBloat(stage) => stage.process(frame, cx),
        }
    }

    /// When the next queued frame becomes due, if any is queued
    pub(crate) fn next_release(&self) -> Option<Instant> {
        match self {
            Stage::FakeTraceroute(stage) => stage.next_release(),
            Stage::Latency(stage) => stage.next_release(),
            Stage::BufferBloat(stage) => stage.next_release(),
            _ => None,
        }
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Released> {
        match self {
            Stage::FakeTraceroute(stage) => stage.pop_due(now).map(Released::Reply),
            Stage::Latency(stage) => stage.pop_due(now).map(Released::Forward),
            Stage::BufferBloat(stage) => stage.pop_due(now).map(Released::Forward),
            _ => None,
        }
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.next_release().is_none()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::stats::StageCounters;

    /// Runs a stage against a snapshot outside of any chain
    pub(crate) struct Bench {
        pub(crate) snapshot: ConfigSnapshot,
        pub(crate) replies: VecDeque<Frame>,
        pub(crate) counters: StageCounters,
    }

    impl Bench {
        pub(crate) fn new(snapshot: ConfigSnapshot) -> Self {
            Self {
                snapshot,
                replies: VecDeque::new(),
                counters: StageCounters::default(),
            }
        }

        pub(crate) fn run(
            &mut self,
            stage: &mut Stage,
            frame: Frame,
            direction: Direction,
            now: Instant,
        ) -> Outcome {
            let mut cx = StageContext::new(
                &self.snapshot,
                direction,
                now,
                &mut self.replies,
                &self.counters,
            );
            stage.process(frame, &mut cx)
        }
    }
}
