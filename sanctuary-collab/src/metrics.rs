//! Synchronization traffic counters and dashboard scores.
//!
//! [`MetricsAggregator`] owns the [`Metrics`] record. Counters only grow;
//! the participant count is floored at zero. [`DerivedScores`] are computed
//! on read and never stored.

use serde::{Deserialize, Serialize};

use crate::config::ParticipantCounting;
use crate::protocol::ExpressModeUpdate;

/// `speedImprovement` value that scores as 100% efficiency.
pub const EFFICIENCY_BASELINE: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RealTimeSync {
    /// Inbound cursor updates applied to the registry
    pub cursor_updates: u64,
    /// Outbound state diffs emitted
    pub state_updates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExpressModeMetrics {
    pub speed_improvement: f64,
    pub agentic_assistance: f64,
}

impl Default for ExpressModeMetrics {
    fn default() -> Self {
        Self {
            speed_improvement: EFFICIENCY_BASELINE,
            agentic_assistance: 0.0,
        }
    }
}

/// Session metrics as read by dashboards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Metrics {
    pub participant_count: u32,
    pub active_collaborations: u32,
    pub response_time_ms: u64,
    pub code_executions: u64,
    pub real_time_sync: RealTimeSync,
    pub express_mode: ExpressModeMetrics,
}

/// Scores derived from a [`Metrics`] record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedScores {
    /// Mean of the two sync counters
    pub sync_rate: f64,
    /// `speedImprovement` relative to the baseline, percent, capped at 100
    pub efficiency_score: f64,
    /// Active collaborations per participant, percent, capped at 100
    pub collaboration_score: f64,
}

impl DerivedScores {
    pub fn from_metrics(metrics: &Metrics) -> Self {
        let sync = metrics.real_time_sync;
        let sync_rate = (sync.cursor_updates + sync.state_updates) as f64 / 2.0;
        let efficiency_score =
            (metrics.express_mode.speed_improvement / EFFICIENCY_BASELINE * 100.0).min(100.0);
        let collaboration_score = if metrics.participant_count == 0 {
            0.0
        } else {
            (f64::from(metrics.active_collaborations) / f64::from(metrics.participant_count)
                * 100.0)
                .min(100.0)
        };
        Self { sync_rate, efficiency_score, collaboration_score }
    }
}

/// Owner of the session's [`Metrics`].
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    metrics: Metrics,
    counting: ParticipantCounting,
}

impl MetricsAggregator {
    pub fn new(initial: Metrics, counting: ParticipantCounting) -> Self {
        Self { metrics: initial, counting }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn derived(&self) -> DerivedScores {
        DerivedScores::from_metrics(&self.metrics)
    }

    pub fn counting(&self) -> ParticipantCounting {
        self.counting
    }

    /// A collaborator joined. `roster_len` is the remote roster size after the join.
    pub fn record_join(&mut self, roster_len: usize) {
        match self.counting {
            ParticipantCounting::EventCounted => {
                self.metrics.participant_count = self.metrics.participant_count.saturating_add(1);
            }
            ParticipantCounting::RosterDerived => self.set_participants(roster_len),
        }
    }

    /// A collaborator left. Never drops the count below zero.
    pub fn record_leave(&mut self, roster_len: usize) {
        match self.counting {
            ParticipantCounting::EventCounted => {
                self.metrics.participant_count = self.metrics.participant_count.saturating_sub(1);
            }
            ParticipantCounting::RosterDerived => self.set_participants(roster_len),
        }
    }

    /// The roster changed wholesale (teardown). Only affects roster-derived counting.
    pub fn roster_changed(&mut self, roster_len: usize) {
        if self.counting == ParticipantCounting::RosterDerived {
            self.set_participants(roster_len);
        }
    }

    fn set_participants(&mut self, roster_len: usize) {
        self.metrics.participant_count = u32::try_from(roster_len).unwrap_or(u32::MAX);
    }

    pub fn record_cursor_update(&mut self) {
        self.metrics.real_time_sync.cursor_updates += 1;
    }

    pub fn record_state_update(&mut self) {
        self.metrics.real_time_sync.state_updates += 1;
    }

    pub fn record_code_execution(&mut self) {
        self.metrics.code_executions += 1;
    }

    pub fn set_active_collaborations(&mut self, count: u32) {
        self.metrics.active_collaborations = count;
    }

    pub fn set_response_time_ms(&mut self, ms: u64) {
        self.metrics.response_time_ms = ms;
    }

    /// Merge externally pushed multipliers; fields absent from `update` are kept.
    pub fn merge_express_mode(&mut self, update: &ExpressModeUpdate) -> ExpressModeMetrics {
        if let Some(speed) = update.speed_improvement {
            self.metrics.express_mode.speed_improvement = speed;
        }
        if let Some(assist) = update.agentic_assistance {
            self.metrics.express_mode.agentic_assistance = assist;
        }
        self.metrics.express_mode
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(Metrics::default(), ParticipantCounting::default())
    }
}
