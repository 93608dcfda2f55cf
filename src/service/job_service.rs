// services/job_service.rs
//
// The job engine. Every operation loads the job, runs the pure guards and
// writes the result back with a compare-and-swap on the version it loaded.
// Operations that move money first claim the job with a CAS write, so a
// concurrent writer loses before any ledger call is made. Notifications and
// reliability updates run after the write and never fail the operation.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::jobdb::JobStore,
    dtos::jobdtos::*,
    models::{
        jobmodel::*,
        reliabilitymodel::WorkerReliability,
    },
    service::{
        cooling,
        diagnosis,
        error::ServiceError,
        escrow_service::EscrowService,
        geofence,
        notification_service::{Notification, NotificationService},
        otp_gate::{self, OtpOutcome},
        penalty::{self, PenaltySchedule},
        state_machine::{check_transition, ensure_participant, record_event, require_role, require_status, transition},
        timeline,
        trust_service::TrustService,
    },
    utils::{clock::Clock, currency::round_currency},
};

pub const DUPLICATE_WINDOW_MINUTES: i64 = 10;
pub const FINALIZE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinalizeSummary {
    pub finalized: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    escrow_service: Arc<EscrowService>,
    trust_service: Arc<TrustService>,
    notification_service: Arc<NotificationService>,
    penalties: PenaltySchedule,
    clock: Arc<dyn Clock>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        escrow_service: Arc<EscrowService>,
        trust_service: Arc<TrustService>,
        notification_service: Arc<NotificationService>,
        penalties: PenaltySchedule,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            escrow_service,
            trust_service,
            notification_service,
            penalties,
            clock,
        }
    }

    async fn load(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(ServiceError::JobNotFound(job_id))
    }

    async fn write(&self, job: &Job, expected_version: i64, operation: &str) -> Result<Job, ServiceError> {
        match self.store.update_job(job, expected_version).await {
            Err(ServiceError::Conflict(id)) => {
                tracing::warn!("Job {} changed concurrently during {}", id, operation);
                Err(ServiceError::Conflict(id))
            }
            other => other,
        }
    }

    /// Regular write path. Refuses while another operation holds the ledger claim.
    async fn save(&self, job: &Job, expected_version: i64, operation: &str) -> Result<Job, ServiceError> {
        if cooling::has_live_settlement_claim(job, self.clock.now()) {
            tracing::warn!("Job {} has a ledger call in flight, refusing {}", job.id, operation);
            return Err(ServiceError::Conflict(job.id));
        }
        self.write(job, expected_version, operation).await
    }

    /// Claims the job, runs `call` against the claimed record and hands back
    /// the record with the claim lifted but not yet written. The caller's
    /// final `save` against the returned version releases the claim. If `call`
    /// fails the claim is cleared straight away.
    async fn with_ledger_claim<T, F, Fut>(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        operation: &'static str,
        call: F,
    ) -> Result<(Job, T), ServiceError>
    where
        F: FnOnce(Job) -> Fut,
        Fut: std::future::Future<Output = Result<T, ServiceError>>,
    {
        if cooling::has_live_settlement_claim(job, now) {
            return Err(ServiceError::Conflict(job.id));
        }
        let mut claim = job.clone();
        claim.settlement_claimed_at = Some(now);
        let claimed = self.write(&claim, job.version, operation).await?;

        let result = call(claimed.clone()).await;
        let mut unclaimed = claimed;
        unclaimed.settlement_claimed_at = None;
        match result {
            Ok(value) => Ok((unclaimed, value)),
            Err(e) => {
                if let Err(clear_err) = self.write(&unclaimed, unclaimed.version, operation).await {
                    tracing::error!("Failed to clear ledger claim on job {}: {}", unclaimed.id, clear_err);
                }
                Err(e)
            }
        }
    }

    fn notify(&self, notification: Notification) {
        self.notification_service.dispatch(notification);
    }

    fn log_reliability_failure(job_id: Uuid, result: Result<WorkerReliability, ServiceError>) {
        if let Err(e) = result {
            tracing::warn!("Failed to update worker reliability for job {}: {}", job_id, e);
        }
    }

    fn actor_id(job: &Job, actor: &Actor, operation: &'static str) -> Result<Uuid, ServiceError> {
        actor.id.ok_or(ServiceError::Authorization {
            job_id: job.id,
            actor_id: None,
            role: actor.role,
            operation,
        })
    }

    /// Persists a `security_alert` entry and returns the error to hand back to the caller.
    async fn reject_mock_location(&self, job: Job, actor: &Actor, operation: &'static str, now: DateTime<Utc>) -> ServiceError {
        let version = job.version;
        let flagged = record_event(
            job,
            actor,
            "security_alert",
            "Mock GPS location detected",
            Some(json!({ "operation": operation, "reason": "mock_location" })),
            now,
        );

        match self.save(&flagged, version, operation).await {
            Ok(saved) => {
                tracing::warn!("Mock location from {:?} on job {} during {}", actor.id, saved.id, operation);
                self.notify(Notification::ops_alert(
                    "security_alert",
                    &saved,
                    format!("Mock GPS location reported by worker during {} on job '{}'", operation, saved.title),
                ));
                ServiceError::Security("Mock GPS location detected, disable location spoofing and try again".to_string())
            }
            Err(e) => e,
        }
    }

    pub async fn create_job(&self, actor: &Actor, dto: CreateJobDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let client_id = match (actor.role, actor.id) {
            (ActorRole::Client, Some(id)) => id,
            _ => {
                return Err(ServiceError::Authorization {
                    job_id: Uuid::nil(),
                    actor_id: actor.id,
                    role: actor.role,
                    operation: "create_job",
                })
            }
        };
        let now = self.clock.now();

        let title = dto.title.trim().to_string();
        let skill = dto.skill.trim().to_lowercase();
        let since = now - Duration::minutes(DUPLICATE_WINDOW_MINUTES);

        let max_hours = dto.urgency.max_quotation_hours();
        let requested_hours = dto.quotation_window_hours.unwrap_or(max_hours);
        let window_hours = requested_hours.min(max_hours);
        if window_hours < requested_hours {
            tracing::info!(
                "Quotation window clamped from {}h to {}h for {:?} urgency",
                requested_hours,
                window_hours,
                dto.urgency
            );
        }

        let job = Job {
            id: Uuid::new_v4(),
            client_id,
            worker_id: None,
            title,
            description: dto.description,
            skill,
            urgency: dto.urgency,
            location: dto.location,
            quotation_window_start: now,
            quotation_window_end: now + Duration::hours(window_hours),
            quotations: Vec::new(),
            agreed_amount: None,
            status: JobStatus::Open,
            timeline: Vec::new(),
            journey: Journey::default(),
            start_otp: None,
            diagnosis_report: None,
            material_requests: Vec::new(),
            completion: None,
            cooling_period: None,
            dispute: None,
            cancellation: None,
            escrow: None,
            payment_released: false,
            settlement_claimed_at: None,
            warranty_claims: Vec::new(),
            assigned_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let job = timeline::append_entry(
            job,
            actor,
            "Job created",
            Some(json!({ "quotation_window_hours": window_hours })),
            now,
        );

        let job = self
            .store
            .insert_unless_duplicate(&job, since)
            .await?
            .ok_or_else(|| ServiceError::Validation("You posted the same job in the last 10 minutes".to_string()))?;
        tracing::info!("Job {} created by client {}", job.id, client_id);
        Ok(job)
    }

    pub async fn submit_quotation(&self, actor: &Actor, job_id: Uuid, dto: SubmitQuotationDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        require_role(&job, actor, &[ActorRole::Worker], "submit_quotation")?;
        require_status(&job, &[JobStatus::Open], "submit_quotation")?;
        let worker_id = Self::actor_id(&job, actor, "submit_quotation")?;

        if now < job.quotation_window_start || now >= job.quotation_window_end {
            return Err(ServiceError::Validation("The quotation window for this job is closed".to_string()));
        }
        if job.quotations.iter().any(|q| q.worker_id == worker_id) {
            return Err(ServiceError::Validation("You have already quoted for this job".to_string()));
        }

        let quotation = Quotation {
            id: Uuid::new_v4(),
            worker_id,
            amount: round_currency(dto.amount),
            note: dto.note.map(|n| timeline::redact_pii(&n)),
            status: QuotationStatus::Submitted,
            submitted_at: now,
        };
        let metadata = json!({ "quotation_id": quotation.id, "amount": quotation.amount });
        let mut next = job;
        next.quotations.push(quotation);
        let next = record_event(next, actor, "quotation_submitted", "Quotation submitted", Some(metadata), now);

        let saved = self.save(&next, version, "submit_quotation").await?;
        self.notify(Notification::to_user(
            saved.client_id,
            "quotation_submitted",
            &saved,
            format!("New quotation received for '{}'", saved.title),
        ));
        Ok(saved)
    }

    pub async fn accept_quotation(&self, actor: &Actor, job_id: Uuid, quotation_id: Uuid) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::Assigned, actor, "accept_quotation")?;

        let quotation = job
            .quotations
            .iter()
            .find(|q| q.id == quotation_id && q.status == QuotationStatus::Submitted)
            .cloned()
            .ok_or_else(|| ServiceError::Validation(format!("Quotation {} is not open for acceptance", quotation_id)))?;

        let mut next = job;
        for q in next.quotations.iter_mut() {
            q.status = if q.id == quotation_id { QuotationStatus::Accepted } else { QuotationStatus::Declined };
        }
        next.worker_id = Some(quotation.worker_id);
        next.agreed_amount = Some(quotation.amount);
        next.assigned_at = Some(now);
        next.start_otp = Some(otp_gate::issue(now));
        let next = transition(
            next,
            JobStatus::Assigned,
            actor,
            "accept_quotation",
            "Quotation accepted, worker assigned",
            Some(json!({ "quotation_id": quotation_id, "worker_id": quotation.worker_id, "amount": quotation.amount })),
            now,
        )?;

        let saved = self.save(&next, version, "accept_quotation").await?;
        tracing::info!("Worker {} assigned to job {}", quotation.worker_id, saved.id);

        self.notify(Notification::to_user(
            quotation.worker_id,
            "job_assigned",
            &saved,
            format!("Your quotation for '{}' was accepted", saved.title),
        ));
        if let Some(otp) = saved.start_otp.as_ref() {
            self.notify(Notification::to_user(
                saved.client_id,
                "start_code_issued",
                &saved,
                format!("Share start code {} with your worker when they are ready to begin", otp.code),
            ));
        }
        Ok(saved)
    }

    pub async fn regenerate_otp(&self, actor: &Actor, job_id: Uuid) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        require_role(&job, actor, &[ActorRole::Client], "regenerate_otp")?;
        ensure_participant(&job, actor, "regenerate_otp")?;
        require_status(&job, &[JobStatus::Assigned], "regenerate_otp")?;
        if job.worker_id.is_none() {
            return Err(ServiceError::invalid_state(job.id, job.status, "regenerate_otp"));
        }
        // A new code must not lift a lockout in effect.
        if let Some(locked_until) = job.start_otp.as_ref().and_then(|otp| otp.locked_until).filter(|t| *t > now) {
            return Err(ServiceError::Security(format!(
                "Start code is locked until {}, try again later",
                locked_until.to_rfc3339()
            )));
        }

        let mut next = job;
        next.start_otp = Some(otp_gate::issue(now));
        let next = record_event(next, actor, "otp_regenerated", "Start code regenerated", None, now);

        let saved = self.save(&next, version, "regenerate_otp").await?;
        if let Some(otp) = saved.start_otp.as_ref() {
            self.notify(Notification::to_user(
                saved.client_id,
                "start_code_issued",
                &saved,
                format!("Your new start code is {}", otp.code),
            ));
        }
        Ok(saved)
    }

    pub async fn confirm_eta(&self, actor: &Actor, job_id: Uuid, dto: ConfirmEtaDto) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::EtaConfirmed, actor, "confirm_eta")?;

        if dto.eta <= now {
            return Err(ServiceError::Validation("Estimated arrival must be in the future".to_string()));
        }

        let mut next = job;
        next.journey.confirmed_eta = Some(dto.eta);
        let next = transition(
            next,
            JobStatus::EtaConfirmed,
            actor,
            "confirm_eta",
            "Worker confirmed arrival time",
            Some(json!({ "eta": dto.eta })),
            now,
        )?;

        let saved = self.save(&next, version, "confirm_eta").await?;
        self.notify(Notification::to_user(
            saved.client_id,
            "eta_confirmed",
            &saved,
            format!("Your worker expects to arrive at {}", dto.eta.to_rfc3339()),
        ));
        Ok(saved)
    }

    pub async fn start_journey(&self, actor: &Actor, job_id: Uuid, dto: StartJourneyDto) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::OnTheWay, actor, "start_journey")?;

        if dto.is_mock_location {
            return Err(self.reject_mock_location(job, actor, "start_journey", now).await);
        }
        if let Some(point) = dto.location {
            if !geofence::is_valid_point(point) {
                return Err(ServiceError::Validation("Coordinates are out of range".to_string()));
            }
        }

        let mut next = job;
        next.journey.started_at = Some(now);
        if dto.location.is_some() {
            next.journey.last_location = dto.location;
        }
        let next = transition(next, JobStatus::OnTheWay, actor, "start_journey", "Worker is on the way", None, now)?;

        let saved = self.save(&next, version, "start_journey").await?;
        self.notify(Notification::to_user(
            saved.client_id,
            "worker_on_the_way",
            &saved,
            "Your worker is on the way".to_string(),
        ));
        Ok(saved)
    }

    pub async fn arrive(&self, actor: &Actor, job_id: Uuid, dto: ArrivalDto) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::Arrived, actor, "arrive")?;

        if dto.is_mock_location {
            return Err(self.reject_mock_location(job, actor, "arrive", now).await);
        }
        if !geofence::is_valid_point(dto.location) {
            return Err(ServiceError::Validation("Coordinates are out of range".to_string()));
        }

        let arrival = geofence::evaluate_arrival(&job, dto.location, now);
        if !arrival.within_geofence {
            tracing::warn!(
                "Worker arrived {:.0}m from job {} location, accepting anyway",
                arrival.distance_meters,
                job.id
            );
        }

        let metadata = geofence::arrival_metadata(&arrival);
        let note = if arrival.is_late {
            format!("Worker arrived {} minutes late", arrival.delay_minutes)
        } else {
            "Worker arrived".to_string()
        };
        let mut next = job;
        next.journey.arrival = Some(arrival.clone());
        next.journey.last_location = Some(dto.location);
        let next = transition(next, JobStatus::Arrived, actor, "arrive", &note, Some(metadata), now)?;

        let saved = self.save(&next, version, "arrive").await?;
        if let Some(worker_id) = saved.worker_id {
            Self::log_reliability_failure(saved.id, self.trust_service.record_arrival(worker_id, &arrival).await);
        }
        self.notify(Notification::to_user(saved.client_id, "worker_arrived", &saved, note));
        Ok(saved)
    }

    /// Records a delay without moving the confirmed ETA.
    pub async fn report_delay(&self, actor: &Actor, job_id: Uuid, dto: ReportDelayDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        require_role(&job, actor, &[ActorRole::Worker], "report_delay")?;
        ensure_participant(&job, actor, "report_delay")?;
        require_status(&job, &[JobStatus::EtaConfirmed, JobStatus::OnTheWay], "report_delay")?;

        let reason = timeline::redact_pii(&dto.reason);
        let mut next = job;
        next.journey.delays.push(ReportedDelay {
            reason: reason.clone(),
            minutes: dto.minutes,
            reported_at: now,
        });
        let next = record_event(
            next,
            actor,
            "delay_reported",
            &reason,
            Some(json!({ "minutes": dto.minutes })),
            now,
        );

        let saved = self.save(&next, version, "report_delay").await?;
        self.notify(Notification::to_user(
            saved.client_id,
            "delay_reported",
            &saved,
            format!("Your worker is running about {} minutes late: {}", dto.minutes, reason),
        ));
        Ok(saved)
    }

    /// Verifies the client's start code. Wrong codes are persisted before the error is returned.
    pub async fn start_job(&self, actor: &Actor, job_id: Uuid, code: &str) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::InProgress, actor, "start_job")?;

        let otp = job
            .start_otp
            .clone()
            .ok_or_else(|| ServiceError::Security("No start code is active, ask the client to generate one".to_string()))?;

        let outcome = otp_gate::verify(&otp, code, now)?;
        let rejection = outcome.rejection_message();
        match outcome {
            OtpOutcome::Accepted => {
                let mut next = job;
                next.start_otp = None;
                let next = transition(next, JobStatus::InProgress, actor, "start_job", "Start code verified, work started", None, now)?;

                let saved = self.save(&next, version, "start_job").await?;
                tracing::info!("Work started on job {}", saved.id);
                self.notify(Notification::to_user(
                    saved.client_id,
                    "work_started",
                    &saved,
                    "Work has started on your job".to_string(),
                ));
                Ok(saved)
            }
            OtpOutcome::Rejected { otp, remaining_attempts, locked_until } => {
                let message = rejection.unwrap_or_else(|| "Incorrect start code".to_string());
                let mut next = job;
                next.start_otp = Some(otp);
                let next = record_event(
                    next,
                    actor,
                    "otp_failed",
                    "Incorrect start code entered",
                    Some(json!({ "remaining_attempts": remaining_attempts, "locked_until": locked_until })),
                    now,
                );
                let saved = self.save(&next, version, "start_job").await?;

                tracing::warn!("Incorrect start code on job {}, {} attempt(s) left", saved.id, remaining_attempts);
                if locked_until.is_some() {
                    self.notify(Notification::ops_alert(
                        "security_alert",
                        &saved,
                        format!("Start code entry locked on job '{}' after repeated failures", saved.title),
                    ));
                }
                Err(ServiceError::Security(message))
            }
        }
    }

    /// First submission moves the job into diagnosis mode; after a rejection the worker resubmits in place.
    pub async fn submit_diagnosis(&self, actor: &Actor, job_id: Uuid, dto: DiagnosisReportDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        let resubmission = job.status == JobStatus::DiagnosisMode;
        if resubmission {
            require_role(&job, actor, &[ActorRole::Worker], "submit_diagnosis")?;
            ensure_participant(&job, actor, "submit_diagnosis")?;
            if job
                .diagnosis_report
                .as_ref()
                .map(|r| r.approval_status == ApprovalStatus::Pending)
                .unwrap_or(false)
            {
                return Err(ServiceError::Validation(
                    "The current diagnosis is still awaiting the client's decision".to_string(),
                ));
            }
        } else {
            check_transition(&job, JobStatus::DiagnosisMode, actor, "submit_diagnosis")?;
        }

        let report = diagnosis::build_report(&dto, now)?;
        let metadata = json!({ "total_cost": report.total_cost, "warranty_offered": report.warranty_offered });
        let total = report.total_cost;

        let mut next = job;
        next.diagnosis_report = Some(report);
        let next = if resubmission {
            record_event(next, actor, "diagnosis_resubmitted", "Diagnosis resubmitted", Some(metadata), now)
        } else {
            transition(next, JobStatus::DiagnosisMode, actor, "submit_diagnosis", "Diagnosis submitted", Some(metadata), now)?
        };

        let saved = self.save(&next, version, "submit_diagnosis").await?;
        self.notify(Notification::to_user(
            saved.client_id,
            "diagnosis_submitted",
            &saved,
            format!("Diagnosis ready for review, total {:.2}", total),
        ));
        Ok(saved)
    }

    /// Approval holds the diagnosis total in escrow before the job moves on.
    pub async fn approve_diagnosis(
        &self,
        actor: &Actor,
        job_id: Uuid,
        approved: bool,
        reason: Option<String>,
    ) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        if approved {
            check_transition(&job, JobStatus::Diagnosed, actor, "approve_diagnosis")?;
        } else {
            require_role(&job, actor, &[ActorRole::Client], "approve_diagnosis")?;
            ensure_participant(&job, actor, "approve_diagnosis")?;
            require_status(&job, &[JobStatus::DiagnosisMode], "approve_diagnosis")?;
        }

        let total = job
            .diagnosis_report
            .as_ref()
            .filter(|r| r.approval_status == ApprovalStatus::Pending)
            .map(|r| r.total_cost)
            .ok_or_else(|| ServiceError::Validation("There is no diagnosis awaiting approval".to_string()))?;

        if !approved {
            let reason = reason
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .ok_or_else(|| ServiceError::Validation("A reason is required to reject a diagnosis".to_string()))?;

            let mut next = job;
            if let Some(report) = next.diagnosis_report.as_mut() {
                report.approval_status = ApprovalStatus::Rejected;
                report.rejection_reason = Some(timeline::redact_pii(&reason));
                report.decided_at = Some(now);
            }
            let next = record_event(next, actor, "diagnosis_rejected", &reason, None, now);

            let saved = self.save(&next, version, "approve_diagnosis").await?;
            if let Some(worker_id) = saved.worker_id {
                self.notify(Notification::to_user(
                    worker_id,
                    "diagnosis_rejected",
                    &saved,
                    "The client rejected your diagnosis, please revise and resubmit".to_string(),
                ));
            }
            return Ok(saved);
        }

        let (job, escrow) = self
            .with_ledger_claim(&job, now, "approve_diagnosis", move |claimed| async move {
                self.escrow_service.create_escrow(&claimed, total, now).await
            })
            .await?;
        let version = job.version;
        let reference = escrow.reference.clone();

        let mut next = job;
        next.escrow = Some(escrow);
        if let Some(report) = next.diagnosis_report.as_mut() {
            report.approval_status = ApprovalStatus::Approved;
            report.decided_at = Some(now);
        }
        let next = transition(
            next,
            JobStatus::Diagnosed,
            actor,
            "approve_diagnosis",
            "Diagnosis approved, funds held in escrow",
            Some(json!({ "escrow_reference": reference, "amount": total })),
            now,
        )?;

        let saved = self.save(&next, version, "approve_diagnosis").await?;
        tracing::info!("Diagnosis approved for job {}, {:.2} held", saved.id, total);
        if let Some(worker_id) = saved.worker_id {
            self.notify(Notification::to_user(
                worker_id,
                "diagnosis_approved",
                &saved,
                format!("Diagnosis approved, {:.2} is held in escrow", total),
            ));
        }
        Ok(saved)
    }

    pub async fn request_material(&self, actor: &Actor, job_id: Uuid, dto: MaterialRequestDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::MaterialPendingApproval, actor, "request_material")?;

        let request = diagnosis::new_material_request(&dto, now);
        let metadata = json!({ "request_id": request.id, "item": request.item, "cost": request.cost });
        let message = format!("Worker requests {} for {:.2}", request.item, request.cost);

        let mut next = job;
        next.material_requests.push(request);
        let next = transition(
            next,
            JobStatus::MaterialPendingApproval,
            actor,
            "request_material",
            "Additional material requested",
            Some(metadata),
            now,
        )?;

        let saved = self.save(&next, version, "request_material").await?;
        self.notify(Notification::to_user(saved.client_id, "material_requested", &saved, message));
        Ok(saved)
    }

    /// An approved request is topped up into escrow before the decision is stored.
    pub async fn respond_to_material(
        &self,
        actor: &Actor,
        job_id: Uuid,
        request_id: Uuid,
        approved: bool,
    ) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        require_role(&job, actor, &[ActorRole::Client], "respond_to_material")?;
        ensure_participant(&job, actor, "respond_to_material")?;
        require_status(&job, &[JobStatus::MaterialPendingApproval], "respond_to_material")?;
        let cost = diagnosis::pending_request(&job, request_id)?.cost;

        let (job, version, escrow) = if approved {
            let (claimed, escrow) = self
                .with_ledger_claim(&job, now, "respond_to_material", move |claimed| async move {
                    self.escrow_service.top_up(&claimed, cost, request_id, now).await
                })
                .await?;
            let version = claimed.version;
            (claimed, version, Some(escrow))
        } else {
            (job, version, None)
        };

        let mut next = diagnosis::decide_material_request(job, request_id, approved, now)?;
        if escrow.is_some() {
            next.escrow = escrow;
        }
        let note = if approved { "Material request approved" } else { "Material request declined" };
        let metadata = json!({ "request_id": request_id, "approved": approved, "cost": cost });
        let next = if next.has_pending_material_request() {
            record_event(next, actor, "material_decided", note, Some(metadata), now)
        } else {
            transition(next, JobStatus::InProgress, actor, "respond_to_material", note, Some(metadata), now)?
        };

        let saved = self.save(&next, version, "respond_to_material").await?;
        if let Some(worker_id) = saved.worker_id {
            self.notify(Notification::to_user(worker_id, "material_decided", &saved, note.to_string()));
        }
        Ok(saved)
    }

    pub async fn submit_completion(&self, actor: &Actor, job_id: Uuid, dto: SubmitCompletionDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        if dto.photos.iter().all(|p| p.trim().is_empty()) {
            return Err(ServiceError::Validation("At least one completion photo is required".to_string()));
        }
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::Reviewing, actor, "submit_completion")?;

        let photo_count = dto.photos.len();
        let mut next = job;
        next.completion = Some(CompletionProof {
            photos: dto.photos,
            summary: timeline::redact_pii(&dto.summary),
            submitted_at: now,
        });
        let next = transition(
            next,
            JobStatus::Reviewing,
            actor,
            "submit_completion",
            "Work submitted for review",
            Some(json!({ "photos": photo_count })),
            now,
        )?;

        let saved = self.save(&next, version, "submit_completion").await?;
        self.notify(Notification::to_user(
            saved.client_id,
            "completion_submitted",
            &saved,
            "Your worker marked the job as done, please review".to_string(),
        ));
        Ok(saved)
    }

    pub async fn confirm_completion(&self, actor: &Actor, job_id: Uuid) -> Result<Job, ServiceError> {
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::CoolingWindow, actor, "confirm_completion")?;

        let next = cooling::start_cooling(job, now)?;
        let ends_at = next.cooling_period.as_ref().map(|p| p.ends_at);
        let next = transition(
            next,
            JobStatus::CoolingWindow,
            actor,
            "confirm_completion",
            "Client confirmed completion, cooling window started",
            Some(json!({ "ends_at": ends_at })),
            now,
        )?;

        let saved = self.save(&next, version, "confirm_completion").await?;
        if let Some(worker_id) = saved.worker_id {
            self.notify(Notification::to_user(
                worker_id,
                "completion_confirmed",
                &saved,
                "The client confirmed the work, payment is released after the 24 hour cooling window".to_string(),
            ));
        }
        Ok(saved)
    }

    pub async fn raise_dispute(&self, actor: &Actor, job_id: Uuid, dto: RaiseDisputeDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;
        check_transition(&job, JobStatus::Disputed, actor, "raise_dispute")?;

        let next = cooling::open_dispute(job, &timeline::redact_pii(&dto.reason), now)?;
        let next = transition(next, JobStatus::Disputed, actor, "raise_dispute", &dto.reason, None, now)?;

        let saved = self.save(&next, version, "raise_dispute").await?;
        tracing::info!("Dispute raised on job {}", saved.id);
        if let Some(worker_id) = saved.worker_id {
            self.notify(Notification::to_user(
                worker_id,
                "dispute_raised",
                &saved,
                "The client raised a dispute, payment is on hold until it is resolved".to_string(),
            ));
        }
        self.notify(Notification::ops_alert(
            "dispute_raised",
            &saved,
            format!("Dispute raised on job '{}': {}", saved.title, timeline::redact_pii(&dto.reason)),
        ));
        Ok(saved)
    }

    /// Applies an admin decision. Money moves before the decision is stored.
    pub async fn resolve_dispute(&self, actor: &Actor, job_id: Uuid, dto: ResolveDisputeDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        require_role(&job, actor, &[ActorRole::Admin], "resolve_dispute")?;
        require_status(&job, &[JobStatus::Disputed], "resolve_dispute")?;
        let target = match dto.decision {
            DisputeDecision::ReleaseToWorker => JobStatus::Completed,
            DisputeDecision::RefundClient => JobStatus::Cancelled,
            DisputeDecision::ContinueMonitoring => JobStatus::CoolingWindow,
        };
        check_transition(&job, target, actor, "resolve_dispute")?;

        let decision = dto.decision;
        let (job, version, settled) = match decision {
            DisputeDecision::ContinueMonitoring => (job, version, None),
            DisputeDecision::ReleaseToWorker | DisputeDecision::RefundClient => {
                let (claimed, settled) = self
                    .with_ledger_claim(&job, now, "resolve_dispute", move |claimed| async move {
                        if decision == DisputeDecision::ReleaseToWorker {
                            self.escrow_service.release(&claimed, now).await
                        } else {
                            self.escrow_service.refund(&claimed, now).await
                        }
                    })
                    .await?;
                let version = claimed.version;
                (claimed, version, settled)
            }
        };

        let mut next = cooling::close_dispute(job, dto.decision, &timeline::redact_pii(&dto.notes), now)?;
        let moved_money = settled.is_some();
        if settled.is_some() {
            next.escrow = settled;
        }
        match dto.decision {
            DisputeDecision::ReleaseToWorker => {
                next.payment_released = moved_money;
                next.completed_at = Some(now);
            }
            DisputeDecision::RefundClient => {
                next.start_otp = None;
                next.cancellation = Some(CancellationRecord {
                    actor: actor.role,
                    actor_id: actor.id,
                    reason: timeline::redact_pii(&dto.notes),
                    stage: JobStatus::Disputed,
                    penalty_amount: 0.0,
                    worker_share: 0.0,
                    platform_share: 0.0,
                    score_penalty: 0,
                    refunded_escrow: moved_money,
                    penalty_outstanding: false,
                    at: now,
                });
            }
            DisputeDecision::ContinueMonitoring => {}
        }
        let next = transition(
            next,
            target,
            actor,
            "resolve_dispute",
            &dto.notes,
            Some(json!({ "decision": dto.decision.to_str(), "escrow_settled": moved_money })),
            now,
        )?;

        let saved = self.save(&next, version, "resolve_dispute").await?;
        tracing::info!("Dispute on job {} resolved: {}", saved.id, dto.decision.to_str());

        if let Some(worker_id) = saved.worker_id {
            Self::log_reliability_failure(
                saved.id,
                self.trust_service.record_dispute_outcome(worker_id, dto.decision, now).await,
            );
            if dto.decision == DisputeDecision::ReleaseToWorker {
                Self::log_reliability_failure(
                    saved.id,
                    self.trust_service.record_completion(worker_id, &saved.skill, now).await,
                );
            }
            self.notify(Notification::to_user(
                worker_id,
                "dispute_resolved",
                &saved,
                format!("Dispute resolved: {}", dto.decision.to_str()),
            ));
        }
        self.notify(Notification::to_user(
            saved.client_id,
            "dispute_resolved",
            &saved,
            format!("Dispute resolved: {}", dto.decision.to_str()),
        ));
        Ok(saved)
    }

    /// Client or worker cancellation. The escrow refund goes through the ledger
    /// first and the penalty second, both under the ledger claim. A refused
    /// refund leaves the job untouched. A refused penalty after a refund still
    /// cancels the job, with the fee flagged as outstanding.
    pub async fn cancel_job(&self, actor: &Actor, job_id: Uuid, dto: CancelJobDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        require_role(&job, actor, &[ActorRole::Client, ActorRole::Worker], "cancel")?;
        check_transition(&job, JobStatus::Cancelled, actor, "cancel")?;
        let payer_id = Self::actor_id(&job, actor, "cancel")?;
        let outcome = penalty::calculate(&self.penalties, &job, actor.role)?;

        let (job, version, refunded, penalty_outstanding) = if outcome.is_chargeable() || job.has_active_escrow() {
            let (claimed, (refunded, penalty_outstanding)) = self
                .with_ledger_claim(&job, now, "cancel", move |claimed| async move {
                    let refunded = if claimed.has_active_escrow() {
                        self.escrow_service.refund(&claimed, now).await?
                    } else {
                        None
                    };
                    match self.escrow_service.collect_penalty(&claimed, payer_id, &outcome).await {
                        Ok(_) => Ok((refunded, false)),
                        Err(e) if refunded.is_some() => {
                            tracing::error!("Penalty on job {} left outstanding after refund: {}", claimed.id, e);
                            Ok((refunded, true))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await?;
            let version = claimed.version;
            (claimed, version, refunded, penalty_outstanding)
        } else {
            (job, version, None, false)
        };

        let stage = job.status;
        let reason = timeline::redact_pii(&dto.reason);
        let mut next = job;
        let refunded_escrow = refunded.is_some();
        if refunded.is_some() {
            next.escrow = refunded;
        }
        next.start_otp = None;
        next.cancellation = Some(CancellationRecord {
            actor: actor.role,
            actor_id: actor.id,
            reason: reason.clone(),
            stage,
            penalty_amount: outcome.fee,
            worker_share: outcome.worker_share,
            platform_share: outcome.platform_share,
            score_penalty: outcome.score_penalty,
            refunded_escrow,
            penalty_outstanding,
            at: now,
        });
        let next = transition(
            next,
            JobStatus::Cancelled,
            actor,
            "cancel",
            &reason,
            Some(json!({
                "penalty": outcome.fee,
                "worker_share": outcome.worker_share,
                "platform_share": outcome.platform_share,
                "score_penalty": outcome.score_penalty,
                "refunded_escrow": refunded_escrow,
                "penalty_outstanding": penalty_outstanding,
            })),
            now,
        )?;

        let saved = self.save(&next, version, "cancel").await?;
        tracing::info!(
            "Job {} cancelled by {} at {}, penalty {:.2}",
            saved.id,
            actor.role.to_str(),
            stage,
            outcome.fee
        );
        if penalty_outstanding {
            self.notify(Notification::ops_alert(
                "penalty_outstanding",
                &saved,
                format!(
                    "Cancellation fee of {:.2} on job '{}' could not be collected, escrow was refunded",
                    outcome.fee, saved.title
                ),
            ));
        }

        if actor.role == ActorRole::Worker {
            Self::log_reliability_failure(
                saved.id,
                self.trust_service
                    .record_worker_cancellation(payer_id, outcome.score_penalty, now)
                    .await,
            );
            self.notify(Notification::to_user(
                saved.client_id,
                "job_cancelled",
                &saved,
                "Your worker cancelled the job".to_string(),
            ));
        } else if let Some(worker_id) = saved.worker_id {
            self.notify(Notification::to_user(
                worker_id,
                "job_cancelled",
                &saved,
                "The client cancelled the job".to_string(),
            ));
        }
        Ok(saved)
    }

    /// Releases payment once the cooling window has passed without a dispute.
    ///
    /// Runs under the ledger claim, so overlapping scheduler ticks release at
    /// most once. A failed release clears the claim.
    pub async fn finalize_job(&self, job_id: Uuid) -> Result<Job, ServiceError> {
        let system = Actor::system();
        let now = self.clock.now();
        let job = self.load(job_id).await?;

        cooling::ensure_finalizable(&job, now)?;
        check_transition(&job, JobStatus::Completed, &system, "finalize")?;

        let (claimed, released) = self
            .with_ledger_claim(&job, now, "finalize", move |claimed| async move {
                self.escrow_service.release(&claimed, now).await
            })
            .await?;

        let payment_released = released.is_some();
        let mut next = claimed.clone();
        if released.is_some() {
            next.escrow = released;
        }
        next.payment_released = payment_released;
        next.completed_at = Some(now);
        let next = transition(
            next,
            JobStatus::Completed,
            &system,
            "finalize",
            "Cooling window elapsed, payment released",
            Some(json!({ "payment_released": payment_released })),
            now,
        )?;

        let saved = self.save(&next, claimed.version, "finalize").await?;
        tracing::info!("Job {} finalized", saved.id);

        if let Some(worker_id) = saved.worker_id {
            Self::log_reliability_failure(
                saved.id,
                self.trust_service.record_completion(worker_id, &saved.skill, now).await,
            );
            self.notify(Notification::to_user(
                worker_id,
                "payment_released",
                &saved,
                format!("Payment for '{}' has been released", saved.title),
            ));
        }
        self.notify(Notification::to_user(
            saved.client_id,
            "job_completed",
            &saved,
            format!("'{}' is complete", saved.title),
        ));
        Ok(saved)
    }

    /// One scheduler pass over every job whose cooling window has elapsed.
    pub async fn finalize_due(&self, limit: i64) -> Result<FinalizeSummary, ServiceError> {
        let now = self.clock.now();
        let due = self.store.list_due_for_finalize(now, limit).await?;
        if due.is_empty() {
            return Ok(FinalizeSummary::default());
        }
        tracing::info!("Finalizing {} job(s) past their cooling window", due.len());

        let results: Vec<(Uuid, Result<Job, ServiceError>)> = stream::iter(due)
            .map(|job_id| async move { (job_id, self.finalize_job(job_id).await) })
            .buffer_unordered(FINALIZE_CONCURRENCY)
            .collect()
            .await;

        let mut summary = FinalizeSummary::default();
        for (job_id, result) in results {
            match result {
                Ok(_) => summary.finalized += 1,
                Err(
                    e @ (ServiceError::Conflict(_)
                    | ServiceError::AlreadySettled(_)
                    | ServiceError::InvalidState { .. }
                    | ServiceError::Validation(_)),
                ) => {
                    tracing::info!("Skipped finalizing job {}: {}", job_id, e);
                    summary.skipped += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to finalize job {}: {}", job_id, e);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    pub async fn claim_warranty(&self, actor: &Actor, job_id: Uuid, dto: ClaimWarrantyDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        require_role(&job, actor, &[ActorRole::Client], "claim_warranty")?;
        ensure_participant(&job, actor, "claim_warranty")?;
        require_status(&job, &[JobStatus::Completed], "claim_warranty")?;

        let days = job
            .diagnosis_report
            .as_ref()
            .filter(|r| r.warranty_offered)
            .and_then(|r| r.warranty_duration_days)
            .ok_or_else(|| ServiceError::Validation("This job has no warranty".to_string()))?;
        let completed_at = job.completed_at.unwrap_or(job.updated_at);
        let expires_at = completed_at + Duration::days(days);
        if now > expires_at {
            return Err(ServiceError::Validation(format!(
                "The warranty expired on {}",
                expires_at.to_rfc3339()
            )));
        }
        if job.warranty_claims.iter().any(|c| c.status == WarrantyStatus::Open) {
            return Err(ServiceError::Validation("A warranty claim is already open for this job".to_string()));
        }

        let reason = timeline::redact_pii(&dto.reason);
        let mut next = job;
        next.warranty_claims.push(WarrantyClaim {
            reason: reason.clone(),
            status: WarrantyStatus::Open,
            claimed_at: now,
            resolved_at: None,
            notes: None,
        });
        let next = record_event(next, actor, "warranty_claimed", &reason, None, now);

        let saved = self.save(&next, version, "claim_warranty").await?;
        if let Some(worker_id) = saved.worker_id {
            self.notify(Notification::to_user(
                worker_id,
                "warranty_claimed",
                &saved,
                format!("The client filed a warranty claim on '{}'", saved.title),
            ));
        }
        self.notify(Notification::ops_alert(
            "warranty_claimed",
            &saved,
            format!("Warranty claim on job '{}': {}", saved.title, reason),
        ));
        Ok(saved)
    }

    pub async fn resolve_warranty(&self, actor: &Actor, job_id: Uuid, dto: ResolveWarrantyDto) -> Result<Job, ServiceError> {
        dto.validate()?;
        let now = self.clock.now();
        let job = self.load(job_id).await?;
        let version = job.version;

        require_role(&job, actor, &[ActorRole::Admin], "resolve_warranty")?;
        require_status(&job, &[JobStatus::Completed], "resolve_warranty")?;

        let status = match dto.decision {
            WarrantyDecision::Honored => WarrantyStatus::Honored,
            WarrantyDecision::Rejected => WarrantyStatus::Rejected,
        };
        let notes = timeline::redact_pii(&dto.notes);

        let mut next = job;
        let claim = next
            .warranty_claims
            .iter_mut()
            .rev()
            .find(|c| c.status == WarrantyStatus::Open)
            .ok_or_else(|| ServiceError::Validation("There is no open warranty claim".to_string()))?;
        claim.status = status;
        claim.resolved_at = Some(now);
        claim.notes = Some(notes.clone());

        let next = record_event(
            next,
            actor,
            "warranty_resolved",
            &notes,
            Some(json!({ "decision": dto.decision })),
            now,
        );

        let saved = self.save(&next, version, "resolve_warranty").await?;
        let message = format!("Warranty claim {:?}", status).to_lowercase();
        self.notify(Notification::to_user(saved.client_id, "warranty_resolved", &saved, message.clone()));
        if let Some(worker_id) = saved.worker_id {
            self.notify(Notification::to_user(worker_id, "warranty_resolved", &saved, message));
        }
        Ok(saved)
    }

    /// Read access for participants and admins. Open jobs are visible to any worker.
    /// Workers never see the start code.
    pub async fn get_job(&self, actor: &Actor, job_id: Uuid) -> Result<Job, ServiceError> {
        let mut job = self.load(job_id).await?;
        let browsing_open_job = actor.role == ActorRole::Worker && job.status == JobStatus::Open;
        if !browsing_open_job {
            ensure_participant(&job, actor, "view")?;
        }

        if actor.role == ActorRole::Worker {
            if let Some(otp) = job.start_otp.as_mut() {
                otp.code = "*".repeat(otp.code.len());
            }
        }
        Ok(job)
    }

    pub async fn get_reliability(&self, worker_id: Uuid) -> Result<WorkerReliability, ServiceError> {
        self.trust_service.get_reliability(worker_id).await
    }
}
