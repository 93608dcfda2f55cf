// service/cooling.rs
//
// Cooling-off window and dispute bookkeeping. Status changes happen in the
// state machine; these functions only guard and update the settlement fields.
use chrono::{DateTime, Duration, Utc};

use crate::{
    models::jobmodel::{CoolingPeriod, DisputeDecision, DisputeStatus, Job, JobDispute, JobStatus},
    service::error::ServiceError,
};

pub const COOLING_WINDOW_HOURS: i64 = 24;
/// A settlement claim older than this is treated as abandoned by a crashed scheduler tick.
pub const SETTLEMENT_CLAIM_LEASE_MINUTES: i64 = 10;

pub fn start_cooling(mut job: Job, now: DateTime<Utc>) -> Result<Job, ServiceError> {
    if job.cooling_period.is_some() {
        return Err(ServiceError::invalid_state(job.id, job.status, "confirm_completion"));
    }
    job.cooling_period = Some(CoolingPeriod {
        starts_at: now,
        ends_at: now + Duration::hours(COOLING_WINDOW_HOURS),
        dispute_raised: false,
        monitoring_until: None,
    });
    Ok(job)
}

pub fn has_live_settlement_claim(job: &Job, now: DateTime<Utc>) -> bool {
    job.settlement_claimed_at
        .map(|at| now - at < Duration::minutes(SETTLEMENT_CLAIM_LEASE_MINUTES))
        .unwrap_or(false)
}

pub fn open_dispute(mut job: Job, reason: &str, now: DateTime<Utc>) -> Result<Job, ServiceError> {
    if job.status != JobStatus::CoolingWindow {
        return Err(ServiceError::invalid_state(job.id, job.status, "raise_dispute"));
    }
    if has_live_settlement_claim(&job, now) {
        return Err(ServiceError::Conflict(job.id));
    }
    if job.dispute.is_some() {
        return Err(ServiceError::Validation("A dispute has already been raised for this job".to_string()));
    }

    let period = job
        .cooling_period
        .as_mut()
        .ok_or_else(|| ServiceError::invalid_state(job.id, JobStatus::CoolingWindow, "raise_dispute"))?;
    if now >= period.ends_at {
        return Err(ServiceError::Validation(format!(
            "The dispute window closed at {}",
            period.ends_at.to_rfc3339()
        )));
    }
    period.dispute_raised = true;

    job.dispute = Some(JobDispute {
        reason: reason.to_string(),
        status: DisputeStatus::Open,
        opened_at: now,
        resolved_at: None,
        decision: None,
        resolution_notes: None,
    });
    Ok(job)
}

/// Guards the scheduler's finalize step.
pub fn ensure_finalizable(job: &Job, now: DateTime<Utc>) -> Result<(), ServiceError> {
    if job.payment_released || job.status == JobStatus::Completed {
        return Err(ServiceError::AlreadySettled(job.id));
    }
    if job.status != JobStatus::CoolingWindow {
        return Err(ServiceError::invalid_state(job.id, job.status, "finalize"));
    }

    let period = job
        .cooling_period
        .as_ref()
        .ok_or_else(|| ServiceError::invalid_state(job.id, job.status, "finalize"))?;
    if period.dispute_raised {
        return Err(ServiceError::invalid_state(job.id, JobStatus::Disputed, "finalize"));
    }
    if now < period.settles_at() {
        return Err(ServiceError::Validation(format!(
            "Cooling window for job {} ends at {}",
            job.id,
            period.settles_at().to_rfc3339()
        )));
    }
    if has_live_settlement_claim(job, now) {
        return Err(ServiceError::Conflict(job.id));
    }
    Ok(())
}

pub fn close_dispute(
    mut job: Job,
    decision: DisputeDecision,
    notes: &str,
    now: DateTime<Utc>,
) -> Result<Job, ServiceError> {
    let dispute = job
        .dispute
        .as_mut()
        .filter(|d| d.status == DisputeStatus::Open)
        .ok_or_else(|| ServiceError::Validation("There is no open dispute on this job".to_string()))?;

    dispute.status = DisputeStatus::Resolved;
    dispute.resolved_at = Some(now);
    dispute.decision = Some(decision);
    dispute.resolution_notes = Some(notes.to_string());

    // The original window is kept as recorded; monitoring gets its own deadline.
    if decision == DisputeDecision::ContinueMonitoring {
        if let Some(period) = job.cooling_period.as_mut() {
            period.dispute_raised = false;
            period.monitoring_until = Some(now + Duration::hours(COOLING_WINDOW_HOURS));
        }
    }
    Ok(job)
}
