//! Simulated latency.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay applied before a response is produced. Values are milliseconds.
///
/// ```yaml
/// delay:
///   type: normal
///   mean: 200
///   stddev: 50
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DelayConfig {
    Fixed { fixed: u64 },
    /// Uniform within `[min, max]`; reversed bounds are swapped
    Random { min: u64, max: u64 },
    /// Gaussian, clamped at zero
    Normal { mean: f64, stddev: f64 },
}

impl DelayConfig {
    /// Draw a delay, capped at `max_delay_ms`.
    pub fn resolve_ms(&self, max_delay_ms: u64) -> u64 {
        self.resolve_with(&mut rand::thread_rng(), max_delay_ms)
    }

    pub fn resolve_with<R: Rng + ?Sized>(&self, rng: &mut R, max_delay_ms: u64) -> u64 {
        let ms = match *self {
            DelayConfig::Fixed { fixed } => fixed,
            DelayConfig::Random { min, max } => {
                let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
                rng.gen_range(lo..=hi)
            }
            DelayConfig::Normal { mean, stddev } => {
                let sample = mean + stddev.abs() * standard_normal(rng);
                if sample.is_finite() && sample > 0.0 {
                    sample.round() as u64
                } else {
                    0
                }
            }
        };
        ms.min(max_delay_ms)
    }

    pub fn resolve(&self, max_delay_ms: u64) -> Duration {
        Duration::from_millis(self.resolve_ms(max_delay_ms))
    }
}

/// Box-Muller transform over two uniform samples.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // 1 - [0, 1) keeps u1 away from zero so ln stays finite.
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
