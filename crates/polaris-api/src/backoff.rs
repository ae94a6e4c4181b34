//! Exponential backoff with jitter for the reconnect loop (spec §4.1).
//!
//! `delay_n = min(max_delay, initial * multiplier^n)`, then scaled by a
//! uniform jitter factor in `[1 - jitter_pct/100, 1 + jitter_pct/100]`.

use std::time::Duration;

/// Reconnect backoff parameters, resolved from config at startup.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_pct: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_pct: 20.0,
        }
    }
}

impl ReconnectPolicy {
    /// The unjittered cap for attempt `n`: `min(max, initial * mult^n)`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }

    /// The actual sleep duration for attempt `n`, with jitter applied.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, rng: &mut JitterRng) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = self.jitter_pct / 100.0;
        let factor = 1.0 + rng.uniform(-spread, spread);
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

/// A small, dependency-free xorshift PRNG used only to spread reconnect
/// jitter -- not suitable for anything security-sensitive.
pub struct JitterRng {
    state: u64,
}

impl JitterRng {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            state: seed | 1,
        }
    }

    #[must_use]
    pub fn from_entropy() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0x9E37_79B9);
        Self::seeded(u64::from(nanos) ^ 0xD1B5_4A32_D192_ED03)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform float in `[lo, hi)`.
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        let unit = (self.next_u64() >> 11) as f64 * (1.0 / (1_u64 << 53) as f64);
        lo + unit * (hi - lo)
    }
}
