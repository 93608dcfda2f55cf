use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::jobmodel::DisputeDecision;

pub const INITIAL_RELIABILITY_SCORE: i32 = 50;
pub const MAX_RELIABILITY_SCORE: i32 = 100;
pub const INITIAL_SKILL_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ReliabilityStats {
    pub on_time_arrivals: i32,
    pub late_arrivals: i32,
    pub disputes: i32,
    pub cancellations: i32,
    pub completed_jobs: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WorkerReliability {
    pub worker_id: Uuid,
    pub score: i32,
    pub stats: ReliabilityStats,
    pub skill_confidence: HashMap<String, f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Something that happened on a job and moves a worker's reputation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReliabilityEvent {
    ArrivedOnTime,
    ArrivedLate { delay_minutes: i64 },
    WorkerCancelled { score_penalty: i32 },
    DisputeResolved { decision: DisputeDecision },
    JobCompleted { skill: String },
}

impl WorkerReliability {
    pub fn new(worker_id: Uuid) -> Self {
        Self {
            worker_id,
            score: INITIAL_RELIABILITY_SCORE,
            stats: ReliabilityStats::default(),
            skill_confidence: HashMap::new(),
            updated_at: None,
        }
    }

    fn adjust_score(&mut self, delta: i32) {
        self.score = (self.score + delta).clamp(0, MAX_RELIABILITY_SCORE);
    }

    /// Returns the profile after `event`, with the score kept inside 0..=100.
    pub fn apply(mut self, event: &ReliabilityEvent, at: DateTime<Utc>) -> Self {
        match event {
            ReliabilityEvent::ArrivedOnTime => {
                self.stats.on_time_arrivals += 1;
                self.adjust_score(2);
            }
            ReliabilityEvent::ArrivedLate { .. } => {
                self.stats.late_arrivals += 1;
                self.adjust_score(-5);
            }
            ReliabilityEvent::WorkerCancelled { score_penalty } => {
                self.stats.cancellations += 1;
                self.adjust_score(-score_penalty.abs());
            }
            ReliabilityEvent::DisputeResolved { decision } => {
                self.stats.disputes += 1;
                if *decision == DisputeDecision::RefundClient {
                    self.adjust_score(-10);
                }
            }
            ReliabilityEvent::JobCompleted { skill } => {
                self.stats.completed_jobs += 1;
                let confidence = self
                    .skill_confidence
                    .entry(skill.to_lowercase())
                    .or_insert(INITIAL_SKILL_CONFIDENCE);
                *confidence = (*confidence + 0.05).min(1.0);
            }
        }
        self.updated_at = Some(at);
        self
    }
}
