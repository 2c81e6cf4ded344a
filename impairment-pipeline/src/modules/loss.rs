use fastrand::Rng;
use tracing::trace;

use super::{Outcome, StageContext};
use crate::frame::Frame;
use crate::packet;
use crate::sampling::Sampler;

/// Independent random drops
pub(crate) struct Loss {
    rng: Rng,
}

impl Loss {
    pub(crate) fn new(rng: Rng) -> Self {
        Self { rng }
    }

    pub(crate) fn process(&mut self, frame: Frame, cx: &mut StageContext<'_>) -> Outcome {
        let config = &cx.snapshot.loss;
        if config.exclude_icmp && packet::is_icmp(frame.as_bytes()) {
            return Outcome::Pass(frame);
        }

        if self.rng.chance(*config.probability.get(cx.direction)) {
            trace!(direction = %cx.direction, len = frame.len(), "loss: dropped frame");
            Outcome::Drop
        } else {
            Outcome::Pass(frame)
        }
    }
}
