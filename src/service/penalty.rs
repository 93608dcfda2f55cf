// service/penalty.rs
use serde::{Deserialize, Serialize};

use crate::{
    models::jobmodel::{ActorRole, Job, JobStatus},
    service::error::ServiceError,
    utils::currency::{round_currency, split_by_percent},
};

/// Share of a client-paid cancellation fee that compensates the assigned worker.
pub const WORKER_COMPENSATION_PERCENT: i64 = 80;
pub const WORKER_EARLY_SCORE_PENALTY: i32 = 10;
pub const WORKER_LATE_SCORE_PENALTY: i32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PenaltySchedule {
    /// Client cancels after assignment, before the worker sets off.
    pub client_early: f64,
    /// Client cancels while the worker is on the way.
    pub client_en_route: f64,
    /// Client cancels once the worker is on site.
    pub client_on_site: f64,
    pub worker_en_route: f64,
    pub worker_on_site: f64,
}

impl Default for PenaltySchedule {
    fn default() -> Self {
        Self {
            client_early: 50.0,
            client_en_route: 150.0,
            client_on_site: 300.0,
            worker_en_route: 100.0,
            worker_on_site: 250.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyStage {
    Open,
    Scheduled,
    EnRoute,
    OnSite,
}

impl PenaltyStage {
    pub fn for_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Open => Some(PenaltyStage::Open),
            JobStatus::Assigned | JobStatus::EtaConfirmed => Some(PenaltyStage::Scheduled),
            JobStatus::OnTheWay => Some(PenaltyStage::EnRoute),
            JobStatus::Arrived
            | JobStatus::DiagnosisMode
            | JobStatus::Diagnosed
            | JobStatus::MaterialPendingApproval
            | JobStatus::InProgress
            | JobStatus::Reviewing => Some(PenaltyStage::OnSite),
            JobStatus::CoolingWindow | JobStatus::Disputed | JobStatus::Completed | JobStatus::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PenaltyOutcome {
    pub stage: PenaltyStage,
    pub payer: ActorRole,
    pub fee: f64,
    pub worker_share: f64,
    pub platform_share: f64,
    pub score_penalty: i32,
}

impl PenaltyOutcome {
    pub fn is_chargeable(&self) -> bool {
        self.fee > 0.0
    }
}

/// Fee and split for `role` cancelling `job` at its current stage.
pub fn calculate(schedule: &PenaltySchedule, job: &Job, role: ActorRole) -> Result<PenaltyOutcome, ServiceError> {
    let stage = PenaltyStage::for_status(job.status)
        .ok_or_else(|| ServiceError::invalid_state(job.id, job.status, "cancel"))?;

    match role {
        ActorRole::Client => {
            let fee = round_currency(match stage {
                PenaltyStage::Open => 0.0,
                PenaltyStage::Scheduled => schedule.client_early,
                PenaltyStage::EnRoute => schedule.client_en_route,
                PenaltyStage::OnSite => schedule.client_on_site,
            });
            let (worker_share, platform_share) = if job.worker_id.is_some() {
                split_by_percent(fee, WORKER_COMPENSATION_PERCENT)
            } else {
                (0.0, fee)
            };
            Ok(PenaltyOutcome {
                stage,
                payer: role,
                fee,
                worker_share,
                platform_share,
                score_penalty: 0,
            })
        }
        ActorRole::Worker => {
            let (fee, score_penalty) = match stage {
                PenaltyStage::Open | PenaltyStage::Scheduled => (0.0, WORKER_EARLY_SCORE_PENALTY),
                PenaltyStage::EnRoute => (schedule.worker_en_route, WORKER_LATE_SCORE_PENALTY),
                PenaltyStage::OnSite => (schedule.worker_on_site, WORKER_LATE_SCORE_PENALTY),
            };
            let fee = round_currency(fee);
            Ok(PenaltyOutcome {
                stage,
                payer: role,
                fee,
                worker_share: 0.0,
                platform_share: fee,
                score_penalty,
            })
        }
        ActorRole::Admin | ActorRole::System => Err(ServiceError::Authorization {
            job_id: job.id,
            actor_id: None,
            role,
            operation: "cancel",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::sample_job;
    use chrono::Utc;
    use uuid::Uuid;

    fn job_at(status: JobStatus, assigned: bool) -> Job {
        let mut job = sample_job(Utc::now());
        job.status = status;
        if assigned {
            job.worker_id = Some(Uuid::new_v4());
        }
        job
    }

    #[test]
    fn test_client_penalty_table() {
        let schedule = PenaltySchedule::default();
        let cases = [
            (JobStatus::Open, false, 0.0, 0.0, 0.0),
            (JobStatus::Assigned, true, 50.0, 40.0, 10.0),
            (JobStatus::EtaConfirmed, true, 50.0, 40.0, 10.0),
            (JobStatus::OnTheWay, true, 150.0, 120.0, 30.0),
            (JobStatus::Arrived, true, 300.0, 240.0, 60.0),
            (JobStatus::DiagnosisMode, true, 300.0, 240.0, 60.0),
            (JobStatus::Diagnosed, true, 300.0, 240.0, 60.0),
            (JobStatus::MaterialPendingApproval, true, 300.0, 240.0, 60.0),
            (JobStatus::InProgress, true, 300.0, 240.0, 60.0),
        ];
        for (status, assigned, fee, worker, platform) in cases {
            let outcome = calculate(&schedule, &job_at(status, assigned), ActorRole::Client).unwrap();
            assert_eq!(outcome.fee, fee, "{status}");
            assert_eq!(outcome.worker_share, worker, "{status}");
            assert_eq!(outcome.platform_share, platform, "{status}");
            assert_eq!(outcome.score_penalty, 0);
        }
    }

    #[test]
    fn test_worker_penalty_table() {
        let schedule = PenaltySchedule::default();
        let cases = [
            (JobStatus::Open, 0.0, 10),
            (JobStatus::Assigned, 0.0, 10),
            (JobStatus::EtaConfirmed, 0.0, 10),
            (JobStatus::OnTheWay, 100.0, 20),
            (JobStatus::Arrived, 250.0, 20),
            (JobStatus::MaterialPendingApproval, 250.0, 20),
        ];
        for (status, fee, score) in cases {
            let outcome = calculate(&schedule, &job_at(status, true), ActorRole::Worker).unwrap();
            assert_eq!(outcome.fee, fee, "{status}");
            assert_eq!(outcome.platform_share, fee, "{status}");
            assert_eq!(outcome.worker_share, 0.0);
            assert_eq!(outcome.score_penalty, score, "{status}");
        }
    }

    #[test]
    fn test_settlement_states_cannot_be_cancelled() {
        let schedule = PenaltySchedule::default();
        for status in [JobStatus::CoolingWindow, JobStatus::Disputed, JobStatus::Completed, JobStatus::Cancelled] {
            let err = calculate(&schedule, &job_at(status, true), ActorRole::Client).unwrap_err();
            assert!(matches!(err, ServiceError::InvalidState { .. }));
        }
    }

    #[test]
    fn test_unassigned_client_fee_goes_to_platform() {
        let schedule = PenaltySchedule { client_early: 70.0, ..PenaltySchedule::default() };
        let mut job = job_at(JobStatus::Assigned, false);
        job.worker_id = None;
        let outcome = calculate(&schedule, &job, ActorRole::Client).unwrap();
        assert_eq!((outcome.worker_share, outcome.platform_share), (0.0, 70.0));
    }
}
