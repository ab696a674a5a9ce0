//! Delay Calculator
//!
//! Pure computation of the pause inserted before an operation:
//!
//! ```text
//! delay = floor(tier)
//!       × risk_factor(risk)          super-linear above the mid threshold
//!       × proxy_factor(proxy health)
//!       × warming_factor(warming)
//!       × load_factor(system load)
//!       × (1 + jitter × jitter_ratio)
//! capped at ceiling_ms
//! ```
//!
//! Every factor is non-decreasing in risk and non-increasing in proxy
//! health, so for a fixed jitter sample the result is monotonic.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{GatehouseError, Result, SpeedTier};

/// Tunables for delay computation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayTuning {
    pub fast_floor_ms: u64,
    pub medium_floor_ms: u64,
    pub slow_floor_ms: u64,
    /// Linear growth of the risk factor over the whole risk range
    pub risk_linear_gain: f64,
    /// Risk above which growth becomes quadratic
    pub risk_mid_threshold: f64,
    pub risk_superlinear_gain: f64,
    /// Extra factor at zero proxy health
    pub proxy_penalty: f64,
    /// Extra factor at zero warming
    pub warming_penalty: f64,
    /// Extra factor at full system load
    pub load_gain: f64,
    /// Jitter amplitude as a fraction of the delay (0.2 = ±20%)
    pub jitter_ratio: f64,
    pub ceiling_ms: u64,
}

impl Default for DelayTuning {
    fn default() -> Self {
        Self {
            fast_floor_ms: 1_500,
            medium_floor_ms: 4_000,
            slow_floor_ms: 9_000,
            risk_linear_gain: 1.0,
            risk_mid_threshold: 0.5,
            risk_superlinear_gain: 8.0,
            proxy_penalty: 1.0,
            warming_penalty: 0.5,
            load_gain: 0.5,
            jitter_ratio: 0.2,
            ceiling_ms: 120_000,
        }
    }
}

impl DelayTuning {
    pub fn validate(&self) -> Result<()> {
        if !(self.fast_floor_ms <= self.medium_floor_ms && self.medium_floor_ms <= self.slow_floor_ms) {
            return Err(GatehouseError::Config(
                "delay floors must satisfy fast <= medium <= slow".into(),
            ));
        }
        let gains = [
            self.risk_linear_gain,
            self.risk_superlinear_gain,
            self.proxy_penalty,
            self.warming_penalty,
            self.load_gain,
        ];
        if gains.iter().any(|g| !g.is_finite() || *g < 0.0) {
            return Err(GatehouseError::Config("delay gains must be non-negative".into()));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(GatehouseError::Config("jitter_ratio must be within 0.0 - 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.risk_mid_threshold) {
            return Err(GatehouseError::Config(
                "risk_mid_threshold must be within 0.0 - 1.0".into(),
            ));
        }
        if self.ceiling_ms < self.slow_floor_ms {
            return Err(GatehouseError::Config(
                "ceiling_ms must be at least slow_floor_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn floor_for(&self, tier: SpeedTier) -> u64 {
        match tier {
            SpeedTier::Fast => self.fast_floor_ms,
            SpeedTier::Medium => self.medium_floor_ms,
            SpeedTier::Slow => self.slow_floor_ms,
        }
    }
}

/// Inputs to a delay computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayInputs {
    /// Combined risk score, 0.0 - 1.0
    pub risk_score: f64,
    /// Identity warming level, 0.0 - 100.0
    pub warming_level: f64,
    /// Proxy health, 0.0 - 1.0 (1.0 = healthy)
    pub proxy_health: f64,
    pub speed_tier: SpeedTier,
    /// System load scalar, 0.0 - 1.0
    pub system_load: f64,
}

/// Computed delay with its audit fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayComputation {
    pub delay_ms: u64,
    /// 1.0 when the ceiling did not clip the delay, lower otherwise
    pub quality: f64,
}

/// Delay calculator bound to a tuning
#[derive(Debug, Clone, Default)]
pub struct DelayCalculator {
    tuning: DelayTuning,
}

impl DelayCalculator {
    pub fn new(tuning: DelayTuning) -> Self {
        Self { tuning }
    }

    pub fn tuning(&self) -> &DelayTuning {
        &self.tuning
    }

    /// Compute a delay with a fresh random jitter sample
    pub fn calculate(&self, inputs: &DelayInputs) -> DelayComputation {
        let jitter = rand::thread_rng().gen_range(-1.0..=1.0);
        self.calculate_with_jitter(inputs, jitter)
    }

    /// Deterministic computation for a given jitter sample in [-1, 1]
    pub fn calculate_with_jitter(&self, inputs: &DelayInputs, jitter: f64) -> DelayComputation {
        let t = &self.tuning;
        let risk = sanitize(inputs.risk_score, 1.0);
        let proxy_health = sanitize(inputs.proxy_health, 1.0);
        let warming = sanitize(inputs.warming_level, 100.0) / 100.0;
        let load = sanitize(inputs.system_load, 1.0);
        let jitter = if jitter.is_finite() { jitter.clamp(-1.0, 1.0) } else { 0.0 };

        let excess = (risk - t.risk_mid_threshold).max(0.0);
        let risk_factor = 1.0 + risk * t.risk_linear_gain + excess * excess * t.risk_superlinear_gain;
        let proxy_factor = 1.0 + (1.0 - proxy_health) * t.proxy_penalty;
        let warming_factor = 1.0 + (1.0 - warming) * t.warming_penalty;
        let load_factor = 1.0 + load * t.load_gain;

        let raw = t.floor_for(inputs.speed_tier) as f64
            * risk_factor
            * proxy_factor
            * warming_factor
            * load_factor
            * (1.0 + jitter * t.jitter_ratio);

        let ceiling = t.ceiling_ms as f64;
        let (delay, quality) = if raw > ceiling {
            (ceiling, ceiling / raw)
        } else {
            (raw.max(0.0), 1.0)
        };

        DelayComputation {
            delay_ms: delay.round() as u64,
            quality,
        }
    }
}

/// Clamp to `[0, max]`, mapping NaN to 0
fn sanitize(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, max)
    }
}
