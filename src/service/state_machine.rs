// service/state_machine.rs
//
// The declared transition table for jobs. Nothing else in the crate writes
// `Job::status`; every status change goes through `transition`.
use chrono::{DateTime, Utc};

use crate::{
    models::jobmodel::{Actor, ActorRole, Job, JobStatus},
    service::{error::ServiceError, timeline},
};

use ActorRole::{Admin, Client, System, Worker};
use JobStatus::*;

#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub from: &'static [JobStatus],
    pub to: JobStatus,
    pub actors: &'static [ActorRole],
}

/// States a client or worker may still cancel from.
pub const CANCELLABLE: &[JobStatus] = &[
    Open,
    Assigned,
    EtaConfirmed,
    OnTheWay,
    Arrived,
    DiagnosisMode,
    Diagnosed,
    MaterialPendingApproval,
    InProgress,
    Reviewing,
];

pub const TRANSITIONS: &[TransitionRule] = &[
    TransitionRule { from: &[Open], to: Assigned, actors: &[Client] },
    TransitionRule { from: &[Assigned], to: EtaConfirmed, actors: &[Worker] },
    TransitionRule { from: &[EtaConfirmed], to: OnTheWay, actors: &[Worker] },
    TransitionRule { from: &[OnTheWay], to: Arrived, actors: &[Worker] },
    TransitionRule { from: &[Arrived, EtaConfirmed, Assigned], to: DiagnosisMode, actors: &[Worker] },
    TransitionRule { from: &[DiagnosisMode], to: Diagnosed, actors: &[Client] },
    TransitionRule { from: &[Diagnosed, Arrived, DiagnosisMode], to: InProgress, actors: &[Worker] },
    TransitionRule { from: &[InProgress], to: MaterialPendingApproval, actors: &[Worker] },
    TransitionRule { from: &[MaterialPendingApproval], to: InProgress, actors: &[Client] },
    TransitionRule { from: &[InProgress], to: Reviewing, actors: &[Worker] },
    TransitionRule { from: &[Reviewing], to: CoolingWindow, actors: &[Client] },
    TransitionRule { from: &[CoolingWindow], to: Disputed, actors: &[Client] },
    TransitionRule { from: &[CoolingWindow], to: Completed, actors: &[System] },
    TransitionRule { from: &[Disputed], to: Completed, actors: &[Admin] },
    TransitionRule { from: &[Disputed], to: Cancelled, actors: &[Admin] },
    TransitionRule { from: &[Disputed], to: CoolingWindow, actors: &[Admin] },
    TransitionRule { from: CANCELLABLE, to: Cancelled, actors: &[Client, Worker] },
];

fn rules_between(from: JobStatus, to: JobStatus) -> impl Iterator<Item = &'static TransitionRule> {
    TRANSITIONS
        .iter()
        .filter(move |rule| rule.to == to && rule.from.contains(&from))
}

pub fn is_declared(from: JobStatus, to: JobStatus, role: ActorRole) -> bool {
    rules_between(from, to).any(|rule| rule.actors.contains(&role))
}

/// Clients and workers may only act on their own jobs; admins and the scheduler act on any.
pub fn ensure_participant(job: &Job, actor: &Actor, operation: &'static str) -> Result<(), ServiceError> {
    let allowed = match actor.role {
        Client => actor.id == Some(job.client_id),
        Worker => job.worker_id.is_some() && actor.id == job.worker_id,
        Admin | System => true,
    };

    if allowed {
        Ok(())
    } else {
        Err(unauthorized(job, actor, operation))
    }
}

pub fn require_role(job: &Job, actor: &Actor, roles: &[ActorRole], operation: &'static str) -> Result<(), ServiceError> {
    if roles.contains(&actor.role) {
        Ok(())
    } else {
        Err(unauthorized(job, actor, operation))
    }
}

pub fn require_status(job: &Job, allowed: &[JobStatus], operation: &'static str) -> Result<(), ServiceError> {
    if allowed.contains(&job.status) {
        Ok(())
    } else {
        Err(ServiceError::invalid_state(job.id, job.status, operation))
    }
}

fn unauthorized(job: &Job, actor: &Actor, operation: &'static str) -> ServiceError {
    ServiceError::Authorization {
        job_id: job.id,
        actor_id: actor.id,
        role: actor.role,
        operation,
    }
}

/// Checks that `actor` may move `job` to `to` without touching the job.
pub fn check_transition(job: &Job, to: JobStatus, actor: &Actor, operation: &'static str) -> Result<(), ServiceError> {
    let mut rules = rules_between(job.status, to).peekable();
    if rules.peek().is_none() {
        return Err(ServiceError::invalid_state(job.id, job.status, operation));
    }
    if !rules.any(|rule| rule.actors.contains(&actor.role)) {
        return Err(unauthorized(job, actor, operation));
    }
    ensure_participant(job, actor, operation)
}

/// Moves `job` along a declared edge and records it on the timeline.
pub fn transition(
    job: Job,
    to: JobStatus,
    actor: &Actor,
    operation: &'static str,
    note: &str,
    metadata: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<Job, ServiceError> {
    check_transition(&job, to, actor, operation)?;

    let from = job.status;
    let mut job = job;
    job.status = to;

    let mut metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
    metadata["from"] = serde_json::json!(from.to_str());

    Ok(timeline::append_entry(job, actor, note, Some(metadata), now))
}

/// Records a timeline event that leaves the status untouched.
pub fn record_event(
    job: Job,
    actor: &Actor,
    event: &str,
    note: &str,
    metadata: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Job {
    let mut metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
    metadata["event"] = serde_json::json!(event);
    timeline::append_entry(job, actor, note, Some(metadata), now)
}
