use fastrand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Outcome, StageContext};
use crate::config::CutoffConfig;
use crate::direction::Direction;
use crate::frame::Frame;
use crate::sampling::Sampler;

/// Shortest On or Off period, so a zero-mean distribution cannot stall the schedule
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Expired periods replayed after an idle gap before the schedule restarts from the present
const MAX_REPLAYED_PERIODS: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    On,
    Off,
}

#[derive(Clone, Copy, Debug)]
struct Schedule {
    phase: Phase,
    deadline: Instant,
}

/// Intermittent outages alternating between On and Off periods
///
/// The schedule starts On at the first frame the stage sees. Expired deadlines are advanced
/// from the previous deadline, so after an idle period the stage lands in the phase the
/// schedule would have reached. Gaps spanning more than `MAX_REPLAYED_PERIODS` periods start a
/// fresh On period instead.
pub(crate) struct Cutoff {
    rng: Rng,
    schedule: Option<Schedule>,
}

impl Cutoff {
    pub(crate) fn new(rng: Rng) -> Self {
        Self {
            rng,
            schedule: None,
        }
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        let config = &cx.snapshot.cutoff;
        match self.advance(config, cx.direction, cx.now) {
            Phase::Off => {
                trace!(direction = %cx.direction, "cutoff: dropped frame during outage");
                Outcome::Drop
            }
            Phase::On if self.rng.chance(*config.loss.get(cx.direction)) => {
                trace!(direction = %cx.direction, "cutoff: dropped frame");
                Outcome::Drop
            }
            Phase::On => Outcome::Pass(frame),
        }
    }

    fn advance(&mut self, config: &CutoffConfig, direction: Direction, now: Instant) -> Phase {
        let mut schedule = match self.schedule {
            Some(schedule) => schedule,
            None => Schedule {
                phase: Phase::On,
                deadline: now + self.period(config, direction, Phase::On),
            },
        };

        let mut replayed = 0;
        while now >= schedule.deadline {
            if replayed == MAX_REPLAYED_PERIODS {
                schedule = Schedule {
                    phase: Phase::On,
                    deadline: now + self.period(config, direction, Phase::On),
                };
                debug!(%direction, "cutoff: idle for too long, schedule restarted");
                break;
            }

            replayed += 1;
            let next = match schedule.phase {
                Phase::On => Phase::Off,
                Phase::Off => Phase::On,
            };
            let period = self.period(config, direction, next);
            schedule = Schedule {
                phase: next,
                deadline: schedule.deadline + period,
            };
            trace!(%direction, phase = ?next, ?period, "cutoff: phase changed");
        }

        self.schedule = Some(schedule);
        schedule.phase
    }

    fn period(&mut self, config: &CutoffConfig, direction: Direction, phase: Phase) -> Duration {
        let param = match phase {
            Phase::On => *config.on.get(direction),
            Phase::Off => *config.off.get(direction),
        };

        self.rng.duration(param).max(MIN_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSnapshot;
    use crate::modules::testing::Bench;
    use crate::modules::{Stage, StageKind};
    use crate::packet::test_frames;
    use crate::sampling::GaussianParam;

    fn bench(loss: f64) -> Bench {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.cutoff.enabled = true;
        snapshot.cutoff.loss.left_to_right = loss;
        snapshot.cutoff.on.left_to_right = GaussianParam::constant(1.0);
        snapshot.cutoff.off.left_to_right = GaussianParam::constant(0.5);
        Bench::new(snapshot)
    }

    fn passed(bench: &mut Bench, stage: &mut Stage, at: Instant) -> bool {
        let outcome = bench.run(stage, test_frames::numbered(0), Direction::LeftToRight, at);
        matches!(outcome, Outcome::Pass(_))
    }

    #[test]
    fn drops_everything_while_off_and_nothing_while_on() {
        let mut bench = bench(0.0);
        let mut stage = Stage::new(StageKind::Cutoff, Rng::with_seed(42));
        let start = Instant::now();
        let ms = Duration::from_millis;

        // On: [0, 1000), Off: [1000, 1500), On: [1500, 2500), Off: [2500, 3000)
        for t in (0..1000).step_by(50) {
            assert!(passed(&mut bench, &mut stage, start + ms(t)), "dropped at {t} ms");
        }
        for t in (1000..1500).step_by(50) {
            assert!(!passed(&mut bench, &mut stage, start + ms(t)), "passed at {t} ms");
        }
        for t in (1500..2500).step_by(50) {
            assert!(passed(&mut bench, &mut stage, start + ms(t)), "dropped at {t} ms");
        }
        assert!(!passed(&mut bench, &mut stage, start + ms(2700)));
    }

    #[test]
    fn idle_periods_replay_the_schedule() {
        let mut bench = bench(0.0);
        let mut stage = Stage::new(StageKind::Cutoff, Rng::with_seed(42));
        let start = Instant::now();

        assert!(passed(&mut bench, &mut stage, start));
        // Cycles last 1.5 s, so [10.5, 11.5) is On and [11.5, 12) is Off
        assert!(passed(&mut bench, &mut stage, start + Duration::from_millis(10_700)));
        assert!(!passed(&mut bench, &mut stage, start + Duration::from_millis(11_600)));
    }

    #[test]
    fn on_periods_apply_loss() {
        let mut bench = bench(1.0);
        let mut stage = Stage::new(StageKind::Cutoff, Rng::with_seed(42));
        let start = Instant::now();
        assert!(!passed(&mut bench, &mut stage, start));
    }

    #[test]
    fn zero_length_periods_are_clamped() {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.cutoff.enabled = true;
        let mut bench = Bench::new(snapshot);
        let mut stage = Stage::new(StageKind::Cutoff, Rng::with_seed(42));
        let start = Instant::now();

        // Both periods last 1 ms: On at 0, Off at 1, On at 2
        assert!(passed(&mut bench, &mut stage, start));
        assert!(!passed(&mut bench, &mut stage, start + Duration::from_micros(1500)));
        assert!(passed(&mut bench, &mut stage, start + Duration::from_micros(2500)));
    }

    #[test]
    fn long_idle_periods_restart_the_schedule() {
        let mut snapshot = ConfigSnapshot::default();
        snapshot.cutoff.enabled = true;
        let mut bench = Bench::new(snapshot);
        let mut stage = Stage::new(StageKind::Cutoff, Rng::with_seed(42));
        let start = Instant::now();
        assert!(passed(&mut bench, &mut stage, start));

        // Millions of 1 ms periods have expired
        let later = start + Duration::from_secs(3600);
        assert!(passed(&mut bench, &mut stage, later));

        let Stage::Cutoff(cutoff) = &stage else {
            unreachable!()
        };
        let schedule = cutoff.schedule.unwrap();
        assert_eq!(schedule.phase, Phase::On);
        assert_eq!(schedule.deadline, later + MIN_PERIOD);

        assert!(!passed(&mut bench, &mut stage, later + Duration::from_micros(1500)));
    }
}
