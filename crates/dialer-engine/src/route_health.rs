use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RouteHealthConfig;
use crate::state_table::CallState;
use crate::types::TrunkId;

pub const MAX_SCORE: f64 = 100.0;

/// Health score of one trunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteHealth {
    pub trunk_id: TrunkId,
    pub score: f64,
    pub degraded: bool,
    pub updated_at: DateTime<Utc>,
}

impl RouteHealth {
    pub fn healthy(trunk_id: TrunkId) -> Self {
        Self {
            trunk_id,
            score: MAX_SCORE,
            degraded: false,
            updated_at: Utc::now(),
        }
    }
}

/// Trunk health scores with hysteresis on the degraded flag.
///
/// A trunk becomes degraded when its score drops below `degrade_below` and
/// only stops being degraded once the score is back at `recover_at`.
pub struct RouteHealthTable {
    scores: DashMap<TrunkId, RouteHealth>,
    weights: RouteHealthConfig,
}

impl RouteHealthTable {
    pub fn new(weights: RouteHealthConfig) -> Self {
        Self {
            scores: DashMap::new(),
            weights,
        }
    }

    pub fn weights(&self) -> &RouteHealthConfig {
        &self.weights
    }

    pub fn penalize(&self, trunk_id: &TrunkId, weight: f64) -> RouteHealth {
        self.adjust(trunk_id, -weight.abs())
    }

    pub fn recover(&self, trunk_id: &TrunkId, amount: f64) -> RouteHealth {
        self.adjust(trunk_id, amount.abs())
    }

    fn adjust(&self, trunk_id: &TrunkId, delta: f64) -> RouteHealth {
        let mut entry = self
            .scores
            .entry(trunk_id.clone())
            .or_insert_with(|| RouteHealth::healthy(trunk_id.clone()));

        let health = entry.value_mut();
        health.score = (health.score + delta).clamp(0.0, MAX_SCORE);
        let was_degraded = health.degraded;
        if health.score < self.weights.degrade_below {
            health.degraded = true;
        } else if health.score >= self.weights.recover_at {
            health.degraded = false;
        }
        health.updated_at = Utc::now();

        if health.degraded && !was_degraded {
            warn!(trunk_id = %trunk_id, score = health.score, "Trunk marked degraded");
        } else if was_degraded && !health.degraded {
            info!(trunk_id = %trunk_id, score = health.score, "Trunk recovered");
        }
        health.clone()
    }

    /// `None` means the trunk has no health data yet
    pub fn get(&self, trunk_id: &TrunkId) -> Option<RouteHealth> {
        self.scores.get(trunk_id).map(|h| h.clone())
    }

    pub fn is_degraded(&self, trunk_id: &TrunkId) -> bool {
        self.scores.get(trunk_id).map_or(false, |h| h.degraded)
    }

    /// Score adjustment owed for an attempt that reached `state`.
    ///
    /// Negative values are penalties. A 5xx/6xx final code stacks its own
    /// penalty on top of the state penalty.
    pub fn outcome_delta(&self, state: CallState, response_code: Option<u16>) -> Option<f64> {
        let w = &self.weights;
        let mut delta = match state {
            CallState::Failed => -w.failed_penalty,
            CallState::Timeout => -w.timeout_penalty,
            CallState::NoAnswer => -w.no_answer_penalty,
            CallState::NoRtp => -w.no_rtp_penalty,
            CallState::Ended if matches!(response_code, None | Some(200)) => w.clean_end_recovery,
            _ => 0.0,
        };
        if response_code.map_or(false, |code| code >= 500) {
            delta -= w.server_error_penalty;
        }
        (delta != 0.0).then_some(delta)
    }

    /// Apply [`outcome_delta`](Self::outcome_delta) to a trunk
    pub fn record_outcome(
        &self,
        trunk_id: &TrunkId,
        state: CallState,
        response_code: Option<u16>,
    ) -> Option<RouteHealth> {
        self.outcome_delta(state, response_code)
            .map(|delta| self.adjust(trunk_id, delta))
    }

    pub fn snapshot(&self) -> Vec<RouteHealth> {
        let mut all: Vec<RouteHealth> = self.scores.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.trunk_id.cmp(&b.trunk_id));
        all
    }

    pub fn restore(&self, snapshots: &[RouteHealth]) {
        for snap in snapshots {
            let mut health = snap.clone();
            health.score = health.score.clamp(0.0, MAX_SCORE);
            self.scores.insert(health.trunk_id.clone(), health);
        }
        info!("Restored health for {} trunks", snapshots.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteHealthTable {
        RouteHealthTable::new(RouteHealthConfig::default())
    }

    #[test]
    fn test_hysteresis() {
        let t = table();
        let trunk = TrunkId::from("trunk-a");

        // 100 -> 45: degraded
        for _ in 0..11 {
            t.penalize(&trunk, 5.0);
        }
        let h = t.get(&trunk).unwrap();
        assert_eq!(h.score, 45.0);
        assert!(h.degraded);

        // 55 is above the lower threshold but still degraded
        let h = t.recover(&trunk, 10.0);
        assert_eq!(h.score, 55.0);
        assert!(h.degraded);

        let h = t.recover(&trunk, 5.0);
        assert_eq!(h.score, 60.0);
        assert!(!h.degraded);

        // 55 from a healthy trunk does not degrade it
        let h = t.penalize(&trunk, 5.0);
        assert!(!h.degraded);
    }

    #[test]
    fn test_score_is_clamped() {
        let t = table();
        let trunk = TrunkId::from("trunk-a");
        assert_eq!(t.recover(&trunk, 50.0).score, 100.0);
        assert_eq!(t.penalize(&trunk, 500.0).score, 0.0);
    }

    #[test]
    fn test_unknown_trunk_has_no_data() {
        let t = table();
        let trunk = TrunkId::from("trunk-x");
        assert!(t.get(&trunk).is_none());
        assert!(!t.is_degraded(&trunk));
    }

    #[test]
    fn test_outcome_deltas() {
        let t = table();
        assert_eq!(t.outcome_delta(CallState::Failed, Some(404)), Some(-10.0));
        assert_eq!(t.outcome_delta(CallState::Failed, Some(503)), Some(-20.0));
        assert_eq!(t.outcome_delta(CallState::NoRtp, None), Some(-20.0));
        assert_eq!(t.outcome_delta(CallState::NoAnswer, Some(480)), Some(-5.0));
        assert_eq!(t.outcome_delta(CallState::Ended, Some(200)), Some(1.0));
        assert_eq!(t.outcome_delta(CallState::Busy, Some(486)), None);
        assert_eq!(t.outcome_delta(CallState::Ringing, None), None);
    }

    #[test]
    fn test_snapshot_restore() {
        let t = table();
        let trunk = TrunkId::from("trunk-a");
        t.penalize(&trunk, 60.0);
        let snaps = t.snapshot();

        let restored = table();
        restored.restore(&snaps);
        assert!(restored.is_degraded(&trunk));
        assert_eq!(restored.get(&trunk).unwrap().score, 40.0);
    }
}
