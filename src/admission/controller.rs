//! Admission Controller
//!
//! Composes identity status, proxy selection and the delay calculator into a
//! single approve/deny decision per operation. A check only reads identity
//! state and reserves a proxy; every health mutation goes through the
//! outcome recorder.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::admission::delay::{DelayCalculator, DelayInputs};
use crate::clock::Clock;
use crate::identity::tracker::window_start;
use crate::identity::{IdentityHealthTracker, IdentityState, IdentityStatus};
use crate::proxy::{ProxyCriteria, ProxyPoolManager};
use crate::types::{
    AdmissionDecision, DecisionReason, DecisionSnapshot, GatehouseError, Operation,
    Recommendation, Result, RiskLevel, SpeedTier,
};

/// Risk weights and thresholds for admission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionTuning {
    pub failure_weight: f64,
    pub health_weight: f64,
    pub proxy_weight: f64,
    /// Consecutive failures that saturate the failure component
    pub failure_normalizer: f64,
    /// Combined risk above which admission is denied
    pub risk_ceiling: f64,
    /// Risk above which `reduce_speed` is recommended
    pub elevated_threshold: f64,
    /// Risk above which a non-slow tier gets `use_slower_tier`
    pub slower_tier_threshold: f64,
    /// Remaining quota fraction below which `approaching_daily_limit` is added
    pub daily_warning_fraction: f64,
}

impl Default for AdmissionTuning {
    fn default() -> Self {
        Self {
            failure_weight: 0.4,
            health_weight: 0.4,
            proxy_weight: 0.2,
            failure_normalizer: 5.0,
            risk_ceiling: 0.85,
            elevated_threshold: 0.5,
            slower_tier_threshold: 0.3,
            daily_warning_fraction: 0.1,
        }
    }
}

impl AdmissionTuning {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.failure_weight, self.health_weight, self.proxy_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(GatehouseError::Config("risk weights must be non-negative".into()));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(GatehouseError::Config("at least one risk weight must be positive".into()));
        }
        if self.failure_normalizer.is_nan() || self.failure_normalizer < 1.0 {
            return Err(GatehouseError::Config("failure_normalizer must be at least 1".into()));
        }
        for (name, value) in [
            ("risk_ceiling", self.risk_ceiling),
            ("elevated_threshold", self.elevated_threshold),
            ("slower_tier_threshold", self.slower_tier_threshold),
            ("daily_warning_fraction", self.daily_warning_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GatehouseError::Config(format!("{name} must be within 0.0 - 1.0")));
            }
        }
        if self.elevated_threshold > self.risk_ceiling {
            return Err(GatehouseError::Config(
                "elevated_threshold must not exceed risk_ceiling".into(),
            ));
        }
        Ok(())
    }

    /// Weighted combination of the three risk components, normalized to 0.0 - 1.0
    pub fn risk_score(&self, status: &IdentityStatus, proxy_health: f64) -> f64 {
        let failures = (status.consecutive_failures as f64 / self.failure_normalizer).min(1.0);
        let health = 1.0 - (status.health_score / 100.0).clamp(0.0, 1.0);
        let proxy = 1.0 - proxy_health.clamp(0.0, 1.0);

        let total = self.failure_weight + self.health_weight + self.proxy_weight;
        let score = (self.failure_weight * failures
            + self.health_weight * health
            + self.proxy_weight * proxy)
            / total;
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            1.0
        }
    }
}

/// Source of the system-wide load scalar fed into delay computation
pub trait LoadSource: Send + Sync {
    /// Load in 0.0 - 1.0
    fn system_load(&self) -> f64;
}

/// Constant load, for tests and standalone use
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLoad(pub f64);

impl LoadSource for FixedLoad {
    fn system_load(&self) -> f64 {
        self.0
    }
}

/// Admission gate for every automated action
pub struct AdmissionController {
    tracker: Arc<IdentityHealthTracker>,
    proxies: Arc<ProxyPoolManager>,
    delay: DelayCalculator,
    tuning: AdmissionTuning,
    load: Arc<dyn LoadSource>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(
        tracker: Arc<IdentityHealthTracker>,
        proxies: Arc<ProxyPoolManager>,
        delay: DelayCalculator,
        tuning: AdmissionTuning,
        load: Arc<dyn LoadSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker,
            proxies,
            delay,
            tuning,
            load,
            clock,
        }
    }

    pub fn tuning(&self) -> &AdmissionTuning {
        &self.tuning
    }

    pub fn tracker(&self) -> &Arc<IdentityHealthTracker> {
        &self.tracker
    }

    /// Decide whether `operation` may run for `identity_id` now
    ///
    /// Denials are returned as decisions. The only error is an unknown
    /// identity. An approved decision carries a reserved proxy that the
    /// caller must hand back through the outcome recorder.
    pub fn check(&self, identity_id: &str, operation: &Operation) -> Result<AdmissionDecision> {
        let status = self.tracker.get_status(identity_id)?;
        let now = self.clock.now();

        if status.state == IdentityState::Restricted {
            let snapshot = DecisionSnapshot::default();
            return Ok(self.deny(identity_id, DecisionReason::IdentityRestricted, &status, snapshot));
        }

        if status.quota_exhausted() {
            let next_window =
                window_start(now, self.tracker.tuning().daily_reset_hour_utc) + Duration::days(1);
            let snapshot = DecisionSnapshot {
                next_check_time: Some(next_window),
                ..Default::default()
            };
            return Ok(self.deny(identity_id, DecisionReason::DailyLimitReached, &status, snapshot));
        }

        if status.state == IdentityState::Cooldown {
            let snapshot = DecisionSnapshot {
                next_check_time: status.cooldown_until,
                ..Default::default()
            };
            let decision = self.deny(identity_id, DecisionReason::IdentityCooldown, &status, snapshot);
            return Ok(decision.with_recommendation(Recommendation::WaitForCooldown));
        }

        let lease = match self.proxies.acquire(&ProxyCriteria::for_identity(identity_id)) {
            Ok(lease) => lease,
            Err(GatehouseError::PoolExhausted(_)) => {
                let snapshot = DecisionSnapshot {
                    risk_score: self.tuning.risk_score(&status, 0.0),
                    ..Default::default()
                };
                return Ok(self.deny(identity_id, DecisionReason::NoHealthyProxy, &status, snapshot));
            }
            Err(e) => return Err(e),
        };

        let proxy_health = lease.health();
        let risk_score = self.tuning.risk_score(&status, proxy_health);
        let risk_level = RiskLevel::from_score(risk_score).max(status.risk_level);

        if risk_score > self.tuning.risk_ceiling {
            self.proxies.cancel_lease(&lease.endpoint_id)?;
            let snapshot = DecisionSnapshot {
                risk_score,
                proxy_health,
                ..Default::default()
            };
            let decision = self.deny(identity_id, DecisionReason::RiskTooHigh, &status, snapshot);
            return Ok(AdmissionDecision {
                risk_level,
                ..decision.with_recommendation(Recommendation::ReduceSpeed)
            });
        }

        let computation = self.delay.calculate(&DelayInputs {
            risk_score,
            warming_level: status.warming_level,
            proxy_health,
            speed_tier: operation.speed_tier,
            system_load: self.load.system_load(),
        });

        let mut recommendations = Vec::new();
        if risk_score >= self.tuning.elevated_threshold {
            recommendations.push(Recommendation::ReduceSpeed);
        }
        if risk_score >= self.tuning.slower_tier_threshold && operation.speed_tier != SpeedTier::Slow {
            recommendations.push(Recommendation::UseSlowerTier);
        }
        if proxy_health < 1.0 {
            recommendations.push(Recommendation::RotateProxy);
        }
        if status.state == IdentityState::Warming {
            recommendations.push(Recommendation::ContinueWarming);
        }
        let warning_at = (status.daily_limit as f64 * self.tuning.daily_warning_fraction).ceil() as u32;
        if status.daily_remaining <= warning_at.max(1) {
            recommendations.push(Recommendation::ApproachingDailyLimit);
        }

        let confidence = ((1.0 - risk_score) * computation.quality).clamp(0.0, 1.0);

        debug!(
            identity_id = %identity_id,
            operation = operation.op_type.as_str(),
            proxy = %lease.endpoint_id,
            risk_score = risk_score,
            delay_ms = computation.delay_ms,
            "Admission approved"
        );

        Ok(AdmissionDecision {
            approved: true,
            delay_ms: computation.delay_ms,
            confidence,
            risk_level,
            reason: DecisionReason::Approved,
            recommendations,
            proxy_endpoint_id: Some(lease.endpoint_id),
            snapshot: DecisionSnapshot {
                risk_score,
                proxy_health,
                delay_quality: computation.quality,
                next_check_time: None,
            },
        })
    }

    fn deny(
        &self,
        identity_id: &str,
        reason: DecisionReason,
        status: &IdentityStatus,
        snapshot: DecisionSnapshot,
    ) -> AdmissionDecision {
        debug!(identity_id = %identity_id, reason = %reason, "Admission denied");
        AdmissionDecision::denied(reason, status.risk_level, snapshot)
    }
}
