use std::f64::consts::PI;
use std::time::Duration;

/// Longest duration a sampler will ever produce, to keep deadlines representable
const MAX_SAMPLED_SECS: f64 = 86_400.0;

/// A normal distribution, in seconds when used for durations
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GaussianParam {
    pub mean: f64,
    pub stdev: f64,
}

impl GaussianParam {
    pub fn constant(mean: f64) -> Self {
        Self { mean, stdev: 0.0 }
    }
}

/// Random draws used by the impairment stages
pub trait Sampler {
    /// A uniform draw from `[0, 1)`
    fn unit(&mut self) -> f64;

    /// Returns true with the given probability
    fn chance(&mut self, probability: f64) -> bool {
        if probability <= 0.0 {
            false
        } else if probability >= 1.0 {
            true
        } else {
            self.unit() < probability
        }
    }

    /// A draw from the normal distribution (Box-Muller)
    fn gaussian(&mut self, param: GaussianParam) -> f64 {
        if param.stdev <= 0.0 {
            return param.mean;
        }

        let u1 = 1.0 - self.unit();
        let u2 = self.unit();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        param.mean + z * param.stdev
    }

    /// A non-negative duration drawn from the distribution (negative draws become zero)
    fn duration(&mut self, param: GaussianParam) -> Duration {
        let secs = self.gaussian(param).clamp(0.0, MAX_SAMPLED_SECS);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }
}

impl Sampler for fastrand::Rng {
    fn unit(&mut self) -> f64 {
        self.f64()
    }
}
