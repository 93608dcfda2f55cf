// services/trust_service.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    db::reliabilitydb::ReliabilityStore,
    models::{
        jobmodel::{ArrivalRecord, DisputeDecision},
        reliabilitymodel::{ReliabilityEvent, WorkerReliability},
    },
    service::{error::ServiceError, geofence::punctuality_event},
};

/// Applies job outcomes to the worker reliability profile. Clients never write here directly.
#[derive(Debug, Clone)]
pub struct TrustService {
    store: Arc<dyn ReliabilityStore>,
}

impl TrustService {
    pub fn new(store: Arc<dyn ReliabilityStore>) -> Self {
        Self { store }
    }

    pub async fn get_reliability(&self, worker_id: Uuid) -> Result<WorkerReliability, ServiceError> {
        self.store.get_reliability(worker_id).await
    }

    async fn apply(
        &self,
        worker_id: Uuid,
        event: ReliabilityEvent,
        at: DateTime<Utc>,
    ) -> Result<WorkerReliability, ServiceError> {
        let profile = self.store.apply_reliability_event(worker_id, &event, at).await?;
        tracing::info!(
            "Reliability for worker {} is now {} after {:?}",
            worker_id,
            profile.score,
            event
        );
        Ok(profile)
    }

    pub async fn record_arrival(
        &self,
        worker_id: Uuid,
        arrival: &ArrivalRecord,
    ) -> Result<WorkerReliability, ServiceError> {
        self.apply(worker_id, punctuality_event(arrival), arrival.arrived_at).await
    }

    pub async fn record_worker_cancellation(
        &self,
        worker_id: Uuid,
        score_penalty: i32,
        at: DateTime<Utc>,
    ) -> Result<WorkerReliability, ServiceError> {
        self.apply(worker_id, ReliabilityEvent::WorkerCancelled { score_penalty }, at).await
    }

    pub async fn record_dispute_outcome(
        &self,
        worker_id: Uuid,
        decision: DisputeDecision,
        at: DateTime<Utc>,
    ) -> Result<WorkerReliability, ServiceError> {
        self.apply(worker_id, ReliabilityEvent::DisputeResolved { decision }, at).await
    }

    pub async fn record_completion(
        &self,
        worker_id: Uuid,
        skill: &str,
        at: DateTime<Utc>,
    ) -> Result<WorkerReliability, ServiceError> {
        self.apply(worker_id, ReliabilityEvent::JobCompleted { skill: skill.to_string() }, at).await
    }
}
