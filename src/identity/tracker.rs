//! Identity Health Tracker
//!
//! Owns the risk and health state of every managed identity.
//!
//! ## State machine
//!
//! ```text
//!            warming_level >= exit            risk spike / daily limit
//!  warming ─────────────────────────▶ active ─────────────────────────▶ cooldown
//!     ▲                                 │  ▲                                │
//!     └──────── warming_level < enter ──┘  └──── cooldown window elapsed ───┘
//!
//!  restricted: entered and left only through the administrative API
//! ```
//!
//! Time-driven transitions (cooldown expiry, daily window reset, idle warming
//! decay) are computed lazily. Reads report the effective state without
//! mutating; [`IdentityHealthTracker::apply_result`] persists them before
//! applying the new outcome.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::types::{ErrorType, GatehouseError, OperationResult, Result, RiskLevel};

// ============================================================================
// Tuning
// ============================================================================

/// Health penalty multiplier per error type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorSeverity {
    pub transient: f64,
    pub permanent: f64,
    pub quota: f64,
    pub unknown: f64,
}

impl Default for ErrorSeverity {
    fn default() -> Self {
        Self {
            transient: 1.0,
            permanent: 2.0,
            quota: 4.0,
            unknown: 1.5,
        }
    }
}

impl ErrorSeverity {
    pub fn for_error(&self, error: ErrorType) -> f64 {
        match error {
            ErrorType::Transient => self.transient,
            ErrorType::Permanent => self.permanent,
            ErrorType::Quota => self.quota,
            ErrorType::Unknown => self.unknown,
        }
    }
}

/// Tunables for identity health bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityTuning {
    /// Health gained per successful operation
    pub success_delta: f64,
    /// Health lost per failed operation, before severity scaling
    pub failure_delta: f64,
    pub severity: ErrorSeverity,
    /// Consecutive failures that force a cooldown
    pub cooldown_failure_threshold: u32,
    /// Length of a risk-triggered cooldown
    pub cooldown_window_secs: i64,
    /// Warming gained per successful low-risk operation
    pub warming_gain: f64,
    /// Fraction of warming lost on a failure (0.0 - 1.0)
    pub warming_failure_decay: f64,
    /// Warming lost per idle hour
    pub warming_idle_decay_per_hour: f64,
    /// Below this warming level an active identity drops to warming
    pub warming_enter_threshold: f64,
    /// At or above this warming level a warming identity becomes active
    pub warming_exit_threshold: f64,
    /// Hour (UTC) at which daily counters reset
    pub daily_reset_hour_utc: u32,
    /// Daily limit for identities registered without one
    pub default_daily_limit: u32,
}

impl Default for IdentityTuning {
    fn default() -> Self {
        Self {
            success_delta: 1.0,
            failure_delta: 5.0,
            severity: ErrorSeverity::default(),
            cooldown_failure_threshold: 3,
            cooldown_window_secs: 30 * 60,
            warming_gain: 2.0,
            warming_failure_decay: 0.25,
            warming_idle_decay_per_hour: 1.0,
            warming_enter_threshold: 30.0,
            warming_exit_threshold: 50.0,
            daily_reset_hour_utc: 0,
            default_daily_limit: 50,
        }
    }
}

impl IdentityTuning {
    pub fn validate(&self) -> Result<()> {
        if self.success_delta < 0.0 || self.failure_delta < 0.0 {
            return Err(GatehouseError::Config(
                "identity health deltas must be non-negative".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.warming_failure_decay) {
            return Err(GatehouseError::Config(
                "warming_failure_decay must be within 0.0 - 1.0".into(),
            ));
        }
        if self.warming_enter_threshold > self.warming_exit_threshold {
            return Err(GatehouseError::Config(
                "warming_enter_threshold must not exceed warming_exit_threshold".into(),
            ));
        }
        if self.daily_reset_hour_utc > 23 {
            return Err(GatehouseError::Config("daily_reset_hour_utc must be 0-23".into()));
        }
        if self.cooldown_failure_threshold == 0 {
            return Err(GatehouseError::Config(
                "cooldown_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Types
// ============================================================================

/// Lifecycle state of a managed identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityState {
    Active,
    Warming,
    Restricted,
    Cooldown,
}

impl IdentityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityState::Active => "active",
            IdentityState::Warming => "warming",
            IdentityState::Restricted => "restricted",
            IdentityState::Cooldown => "cooldown",
        }
    }
}

/// Persistent record of a managed identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedIdentity {
    pub id: String,
    /// 0.0 - 100.0
    pub health_score: f64,
    pub risk_level: RiskLevel,
    pub consecutive_failures: u32,
    pub total_operations: u64,
    pub daily_action_count: u32,
    pub daily_limit: u32,
    /// Start of the daily window `daily_action_count` belongs to
    pub daily_window_start: DateTime<Utc>,
    /// 0.0 - 100.0
    pub warming_level: f64,
    pub last_operation_at: Option<DateTime<Utc>>,
    pub state: IdentityState,
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restriction_reason: Option<String>,
    /// Key of the last job attempt folded in; replays of it are skipped
    #[serde(default)]
    pub last_attempt_key: Option<String>,
}

/// Registration request for a new identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIdentity {
    pub id: String,
    #[serde(default)]
    pub daily_limit: Option<u32>,
    #[serde(default)]
    pub warming_level: Option<f64>,
    #[serde(default)]
    pub health_score: Option<f64>,
}

impl NewIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            daily_limit: None,
            warming_level: None,
            health_score: None,
        }
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub fn with_warming_level(mut self, level: f64) -> Self {
        self.warming_level = Some(level);
        self
    }
}

/// Read view of an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityStatus {
    pub id: String,
    pub state: IdentityState,
    pub health_score: f64,
    pub risk_level: RiskLevel,
    pub consecutive_failures: u32,
    pub total_operations: u64,
    pub daily_action_count: u32,
    pub daily_limit: u32,
    pub daily_remaining: u32,
    pub warming_level: f64,
    pub last_operation_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl IdentityStatus {
    fn from_identity(identity: &ManagedIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            state: identity.state,
            health_score: identity.health_score,
            risk_level: identity.risk_level,
            consecutive_failures: identity.consecutive_failures,
            total_operations: identity.total_operations,
            daily_action_count: identity.daily_action_count,
            daily_limit: identity.daily_limit,
            daily_remaining: identity.daily_limit.saturating_sub(identity.daily_action_count),
            warming_level: identity.warming_level,
            last_operation_at: identity.last_operation_at,
            cooldown_until: identity.cooldown_until,
        }
    }

    pub fn quota_exhausted(&self) -> bool {
        self.daily_action_count >= self.daily_limit
    }
}

/// Count of identities per effective state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub active: usize,
    pub warming: usize,
    pub cooldown: usize,
    pub restricted: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.active + self.warming + self.cooldown + self.restricted
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Owner of identity risk state
///
/// Each identity lives in its own map entry; updates take the entry's write
/// lock for the duration of a synchronous read-modify-write, which serializes
/// concurrent writers to the same identity.
pub struct IdentityHealthTracker {
    identities: DashMap<String, ManagedIdentity>,
    tuning: IdentityTuning,
    clock: Arc<dyn Clock>,
}

impl IdentityHealthTracker {
    pub fn new(tuning: IdentityTuning, clock: Arc<dyn Clock>) -> Self {
        Self {
            identities: DashMap::new(),
            tuning,
            clock,
        }
    }

    pub fn tuning(&self) -> &IdentityTuning {
        &self.tuning
    }

    /// Register a new identity
    pub fn register(&self, request: NewIdentity) -> Result<IdentityStatus> {
        if request.id.trim().is_empty() {
            return Err(GatehouseError::BadRequest("identity id must not be empty".into()));
        }
        let daily_limit = request.daily_limit.unwrap_or(self.tuning.default_daily_limit);
        if daily_limit == 0 {
            return Err(GatehouseError::BadRequest("daily_limit must be positive".into()));
        }

        let now = self.clock.now();
        let warming_level = clamp_unit(request.warming_level.unwrap_or(0.0), 100.0);
        let health_score = clamp_unit(request.health_score.unwrap_or(100.0), 100.0);
        let state = if warming_level >= self.tuning.warming_exit_threshold {
            IdentityState::Active
        } else {
            IdentityState::Warming
        };

        let identity = ManagedIdentity {
            id: request.id.clone(),
            health_score,
            risk_level: derive_risk_level(health_score, 0, &self.tuning),
            consecutive_failures: 0,
            total_operations: 0,
            daily_action_count: 0,
            daily_limit,
            daily_window_start: window_start(now, self.tuning.daily_reset_hour_utc),
            warming_level,
            last_operation_at: None,
            state,
            cooldown_until: None,
            restriction_reason: None,
            last_attempt_key: None,
        };

        match self.identities.entry(request.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(GatehouseError::BadRequest(
                format!("identity {} already registered", request.id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let status = IdentityStatus::from_identity(&identity);
                slot.insert(identity);
                info!(
                    identity_id = %request.id,
                    daily_limit = daily_limit,
                    state = state.as_str(),
                    "Registered identity"
                );
                Ok(status)
            }
        }
    }

    /// Current effective status of an identity
    pub fn get_status(&self, identity_id: &str) -> Result<IdentityStatus> {
        let entry = self
            .identities
            .get(identity_id)
            .ok_or_else(|| GatehouseError::identity_not_found(identity_id))?;

        let mut view = entry.value().clone();
        drop(entry);
        normalize(&mut view, self.clock.now(), &self.tuning);
        Ok(IdentityStatus::from_identity(&view))
    }

    /// Fold one operation outcome into the identity's health state
    ///
    /// Only the outcome recorder calls this, once per attempted operation.
    pub fn apply_result(
        &self,
        identity_id: &str,
        result: &OperationResult,
    ) -> Result<IdentityStatus> {
        self.apply_attempt(identity_id, None, result)?
            .ok_or_else(|| GatehouseError::Internal("unkeyed result treated as a replay".into()))
    }

    /// Fold a keyed job attempt in at most once
    ///
    /// Returns `None` without touching any counter when `attempt_key` is the
    /// attempt most recently applied to this identity.
    pub fn apply_attempt(
        &self,
        identity_id: &str,
        attempt_key: Option<&str>,
        result: &OperationResult,
    ) -> Result<Option<IdentityStatus>> {
        let mut entry = self
            .identities
            .get_mut(identity_id)
            .ok_or_else(|| GatehouseError::identity_not_found(identity_id))?;
        let identity = entry.value_mut();
        if attempt_key.is_some() && identity.last_attempt_key.as_deref() == attempt_key {
            debug!(identity_id = %identity_id, attempt = ?attempt_key, "Attempt already applied");
            return Ok(None);
        }
        if let Some(key) = attempt_key {
            identity.last_attempt_key = Some(key.to_string());
        }
        let now = self.clock.now();
        let tuning = &self.tuning;

        normalize(identity, now, tuning);
        let previous_state = identity.state;

        identity.total_operations += 1;
        identity.daily_action_count = (identity.daily_action_count + 1).min(identity.daily_limit);
        identity.last_operation_at = Some(now);

        let error = result.effective_error();
        match error {
            None => {
                identity.health_score += tuning.success_delta;
                identity.consecutive_failures = 0;
                if identity.risk_level == RiskLevel::Low {
                    identity.warming_level += tuning.warming_gain;
                }
            }
            Some(error) => {
                identity.health_score -= tuning.failure_delta * tuning.severity.for_error(error);
                identity.consecutive_failures += 1;
                identity.warming_level *= 1.0 - tuning.warming_failure_decay;
            }
        }

        identity.health_score = clamp_unit(identity.health_score, 100.0);
        identity.warming_level = clamp_unit(identity.warming_level, 100.0);
        identity.risk_level =
            derive_risk_level(identity.health_score, identity.consecutive_failures, tuning);

        if identity.state != IdentityState::Restricted {
            let risk_spike = error == Some(ErrorType::Quota)
                || identity.consecutive_failures >= tuning.cooldown_failure_threshold
                || identity.risk_level == RiskLevel::Critical;

            let mut cooldown_until: Option<DateTime<Utc>> = None;
            if risk_spike {
                cooldown_until = Some(now + Duration::seconds(tuning.cooldown_window_secs));
            }
            if identity.daily_action_count >= identity.daily_limit {
                let boundary = identity.daily_window_start + Duration::days(1);
                cooldown_until = Some(cooldown_until.map_or(boundary, |until| until.max(boundary)));
            }

            if let Some(until) = cooldown_until {
                identity.state = IdentityState::Cooldown;
                identity.cooldown_until = Some(
                    identity
                        .cooldown_until
                        .map_or(until, |existing| existing.max(until)),
                );
            } else {
                apply_warming_hysteresis(identity, tuning);
            }
        }

        if identity.state != previous_state {
            if identity.state == IdentityState::Cooldown {
                warn!(
                    identity_id = %identity_id,
                    consecutive_failures = identity.consecutive_failures,
                    daily_action_count = identity.daily_action_count,
                    cooldown_until = ?identity.cooldown_until,
                    "Identity entered cooldown"
                );
            } else {
                info!(
                    identity_id = %identity_id,
                    from = previous_state.as_str(),
                    to = identity.state.as_str(),
                    "Identity state changed"
                );
            }
        }

        debug!(
            identity_id = %identity_id,
            success = result.success,
            health = identity.health_score,
            warming = identity.warming_level,
            risk = identity.risk_level.as_str(),
            "Applied operation result"
        );

        Ok(Some(IdentityStatus::from_identity(identity)))
    }

    /// Administratively restrict an identity; no admission will be approved
    pub fn restrict(&self, identity_id: &str, reason: impl Into<String>) -> Result<IdentityStatus> {
        let mut entry = self
            .identities
            .get_mut(identity_id)
            .ok_or_else(|| GatehouseError::identity_not_found(identity_id))?;
        let identity = entry.value_mut();
        let reason = reason.into();

        identity.state = IdentityState::Restricted;
        identity.cooldown_until = None;
        identity.restriction_reason = Some(reason.clone());
        warn!(identity_id = %identity_id, reason = %reason, "Identity restricted");

        Ok(IdentityStatus::from_identity(identity))
    }

    /// Clear a restriction (manual unban workflow)
    pub fn clear_restriction(&self, identity_id: &str) -> Result<IdentityStatus> {
        let mut entry = self
            .identities
            .get_mut(identity_id)
            .ok_or_else(|| GatehouseError::identity_not_found(identity_id))?;
        let identity = entry.value_mut();

        if identity.state != IdentityState::Restricted {
            return Err(GatehouseError::BadRequest(format!(
                "identity {} is not restricted",
                identity_id
            )));
        }

        identity.consecutive_failures = 0;
        identity.restriction_reason = None;
        identity.state = if identity.warming_level >= self.tuning.warming_exit_threshold {
            IdentityState::Active
        } else {
            IdentityState::Warming
        };
        identity.risk_level = derive_risk_level(identity.health_score, 0, &self.tuning);
        info!(
            identity_id = %identity_id,
            state = identity.state.as_str(),
            "Identity restriction cleared"
        );

        Ok(IdentityStatus::from_identity(identity))
    }

    /// Effective status of every identity, sorted by id
    pub fn list(&self) -> Vec<IdentityStatus> {
        let now = self.clock.now();
        let mut statuses: Vec<IdentityStatus> = self
            .identities
            .iter()
            .map(|entry| {
                let mut view = entry.value().clone();
                normalize(&mut view, now, &self.tuning);
                IdentityStatus::from_identity(&view)
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Number of identities per effective state
    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for status in self.list() {
            match status.state {
                IdentityState::Active => counts.active += 1,
                IdentityState::Warming => counts.warming += 1,
                IdentityState::Cooldown => counts.cooldown += 1,
                IdentityState::Restricted => counts.restricted += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Raw records for persistence
    pub fn export(&self) -> Vec<ManagedIdentity> {
        let mut records: Vec<ManagedIdentity> =
            self.identities.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Raw record of one identity
    pub fn export_one(&self, identity_id: &str) -> Result<ManagedIdentity> {
        self.identities
            .get(identity_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatehouseError::identity_not_found(identity_id))
    }

    /// Load persisted records, replacing any in-memory entry with the same id
    pub fn import(&self, records: Vec<ManagedIdentity>) -> usize {
        let count = records.len();
        for mut record in records {
            record.health_score = clamp_unit(record.health_score, 100.0);
            record.warming_level = clamp_unit(record.warming_level, 100.0);
            record.daily_action_count = record.daily_action_count.min(record.daily_limit);
            self.identities.insert(record.id.clone(), record);
        }
        info!("Loaded {} identities", count);
        count
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Clamp to `[0, max]`, mapping NaN to 0
fn clamp_unit(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, max)
    }
}

fn derive_risk_level(health_score: f64, consecutive_failures: u32, tuning: &IdentityTuning) -> RiskLevel {
    let mut level = RiskLevel::from_score(1.0 - health_score / 100.0);
    if consecutive_failures >= 2 {
        level = level.escalate();
    }
    if consecutive_failures >= tuning.cooldown_failure_threshold {
        level = level.escalate();
    }
    level
}

/// Most recent daily boundary at or before `now`
pub fn window_start(now: DateTime<Utc>, reset_hour: u32) -> DateTime<Utc> {
    let date = now.date_naive();
    let boundary = date
        .and_hms_opt(reset_hour.min(23), 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);
    if now.hour() < reset_hour.min(23) {
        boundary - Duration::days(1)
    } else {
        boundary
    }
}

fn apply_warming_hysteresis(identity: &mut ManagedIdentity, tuning: &IdentityTuning) {
    match identity.state {
        IdentityState::Active if identity.warming_level < tuning.warming_enter_threshold => {
            identity.state = IdentityState::Warming;
        }
        IdentityState::Warming if identity.warming_level >= tuning.warming_exit_threshold => {
            identity.state = IdentityState::Active;
        }
        _ => {}
    }
}

/// Apply time-driven transitions up to `now`
fn normalize(identity: &mut ManagedIdentity, now: DateTime<Utc>, tuning: &IdentityTuning) {
    let current_window = window_start(now, tuning.daily_reset_hour_utc);
    if current_window > identity.daily_window_start {
        identity.daily_action_count = 0;
        identity.daily_window_start = current_window;
    }

    if let Some(last) = identity.last_operation_at {
        let idle_hours = (now - last).num_seconds().max(0) as f64 / 3600.0;
        let decay = idle_hours * tuning.warming_idle_decay_per_hour;
        identity.warming_level = clamp_unit(identity.warming_level - decay, 100.0);
    }

    if identity.state == IdentityState::Cooldown {
        let expired = identity.cooldown_until.map_or(true, |until| until <= now);
        if expired {
            identity.cooldown_until = None;
            identity.state = if identity.warming_level >= tuning.warming_enter_threshold {
                IdentityState::Active
            } else {
                IdentityState::Warming
            };
        }
    } else if identity.state != IdentityState::Restricted {
        apply_warming_hysteresis(identity, tuning);
    }
}

// ============================================================================
// Tests
// ============================================================================
