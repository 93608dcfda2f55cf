use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
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
    CoolingWindow,
    Disputed,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 14] = [
        JobStatus::Open,
        JobStatus::Assigned,
        JobStatus::EtaConfirmed,
        JobStatus::OnTheWay,
        JobStatus::Arrived,
        JobStatus::DiagnosisMode,
        JobStatus::Diagnosed,
        JobStatus::MaterialPendingApproval,
        JobStatus::InProgress,
        JobStatus::Reviewing,
        JobStatus::CoolingWindow,
        JobStatus::Disputed,
        JobStatus::Completed,
        JobStatus::Cancelled,
    ];

    pub fn to_str(&self) -> &'static str {
        match self {
            JobStatus::Open => "open",
            JobStatus::Assigned => "assigned",
            JobStatus::EtaConfirmed => "eta_confirmed",
            JobStatus::OnTheWay => "on_the_way",
            JobStatus::Arrived => "arrived",
            JobStatus::DiagnosisMode => "diagnosis_mode",
            JobStatus::Diagnosed => "diagnosed",
            JobStatus::MaterialPendingApproval => "material_pending_approval",
            JobStatus::InProgress => "in_progress",
            JobStatus::Reviewing => "reviewing",
            JobStatus::CoolingWindow => "cooling_window",
            JobStatus::Disputed => "disputed",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Low,
    Medium,
    High,
    Emergency,
}

impl UrgencyLevel {
    /// Longest quotation window a job of this urgency may stay open for.
    pub fn max_quotation_hours(&self) -> i64 {
        match self {
            UrgencyLevel::Emergency => 2,
            UrgencyLevel::High => 6,
            UrgencyLevel::Medium => 24,
            UrgencyLevel::Low => 72,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Client,
    Worker,
    Admin,
    System,
}

impl ActorRole {
    pub fn to_str(&self) -> &'static str {
        match self {
            ActorRole::Client => "client",
            ActorRole::Worker => "worker",
            ActorRole::Admin => "admin",
            ActorRole::System => "system",
        }
    }
}

/// The party performing an operation on a job.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<Uuid>,
    pub role: ActorRole,
}

impl Actor {
    pub fn client(id: Uuid) -> Self {
        Self { id: Some(id), role: ActorRole::Client }
    }

    pub fn worker(id: Uuid) -> Self {
        Self { id: Some(id), role: ActorRole::Worker }
    }

    pub fn admin(id: Uuid) -> Self {
        Self { id: Some(id), role: ActorRole::Admin }
    }

    pub fn system() -> Self {
        Self { id: None, role: ActorRole::System }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TimelineEntry {
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub actor: ActorRole,
    pub actor_id: Option<Uuid>,
    pub note: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotationStatus {
    Submitted,
    Accepted,
    Declined,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Quotation {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub amount: f64,
    pub note: Option<String>,
    pub status: QuotationStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReportedDelay {
    pub reason: String,
    pub minutes: i64,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ArrivalRecord {
    pub arrived_at: DateTime<Utc>,
    pub expected_at: DateTime<Utc>,
    pub distance_meters: f64,
    pub within_geofence: bool,
    pub is_late: bool,
    pub delay_minutes: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Journey {
    pub confirmed_eta: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub arrival: Option<ArrivalRecord>,
    pub last_location: Option<GeoPoint>,
    pub delays: Vec<ReportedDelay>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StartOtp {
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MaterialLine {
    pub name: String,
    pub estimated_cost: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiagnosisReport {
    pub summary: String,
    pub materials: Vec<MaterialLine>,
    pub labor_cost: f64,
    pub warranty_offered: bool,
    pub warranty_duration_days: Option<i64>,
    pub warranty_cost: f64,
    pub total_cost: f64,
    pub approval_status: ApprovalStatus,
    pub rejection_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MaterialRequest {
    pub id: Uuid,
    pub item: String,
    pub cost: f64,
    pub proof_url: Option<String>,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionProof {
    pub photos: Vec<String>,
    pub summary: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CoolingPeriod {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub dispute_raised: bool,
    /// Set when an admin keeps a disputed job under observation. The original
    /// window stays on record and settlement waits for this instead.
    #[serde(default)]
    pub monitoring_until: Option<DateTime<Utc>>,
}

impl CoolingPeriod {
    /// When the scheduler may release payment.
    pub fn settles_at(&self) -> DateTime<Utc> {
        self.monitoring_until.unwrap_or(self.ends_at)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

/// Admin outcome for a disputed job.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeDecision {
    ReleaseToWorker,
    RefundClient,
    ContinueMonitoring,
}

impl DisputeDecision {
    pub fn to_str(&self) -> &'static str {
        match self {
            DisputeDecision::ReleaseToWorker => "release_to_worker",
            DisputeDecision::RefundClient => "refund_client",
            DisputeDecision::ContinueMonitoring => "continue_monitoring",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobDispute {
    pub reason: String,
    pub status: DisputeStatus,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub decision: Option<DisputeDecision>,
    pub resolution_notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CancellationRecord {
    pub actor: ActorRole,
    pub actor_id: Option<Uuid>,
    pub reason: String,
    pub stage: JobStatus,
    pub penalty_amount: f64,
    pub worker_share: f64,
    pub platform_share: f64,
    pub score_penalty: i32,
    pub refunded_escrow: bool,
    /// The escrow was refunded but the ledger refused the fee. Ops collect it by hand.
    #[serde(default)]
    pub penalty_outstanding: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    Held,
    Released,
    Refunded,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EscrowRecord {
    pub amount: f64,
    pub top_ups: Vec<f64>,
    pub state: EscrowState,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl EscrowRecord {
    pub fn total(&self) -> f64 {
        self.amount + self.top_ups.iter().sum::<f64>()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarrantyStatus {
    Open,
    Honored,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WarrantyClaim {
    pub reason: String,
    pub status: WarrantyStatus,
    pub claimed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub client_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub skill: String,
    pub urgency: UrgencyLevel,
    pub location: GeoPoint,
    pub quotation_window_start: DateTime<Utc>,
    pub quotation_window_end: DateTime<Utc>,
    pub quotations: Vec<Quotation>,
    pub agreed_amount: Option<f64>,
    pub status: JobStatus,
    pub timeline: Vec<TimelineEntry>,
    pub journey: Journey,
    pub start_otp: Option<StartOtp>,
    pub diagnosis_report: Option<DiagnosisReport>,
    pub material_requests: Vec<MaterialRequest>,
    pub completion: Option<CompletionProof>,
    pub cooling_period: Option<CoolingPeriod>,
    pub dispute: Option<JobDispute>,
    pub cancellation: Option<CancellationRecord>,
    pub escrow: Option<EscrowRecord>,
    pub payment_released: bool,
    // Set while the scheduler is settling the job.
    pub settlement_claimed_at: Option<DateTime<Utc>>,
    pub warranty_claims: Vec<WarrantyClaim>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Job {
    pub fn has_active_escrow(&self) -> bool {
        matches!(self.escrow.as_ref().map(|e| e.state), Some(EscrowState::Held))
    }

    pub fn has_pending_material_request(&self) -> bool {
        self.material_requests
            .iter()
            .any(|r| r.status == ApprovalStatus::Pending)
    }

    pub fn last_timeline_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timeline.last().map(|e| e.timestamp)
    }
}
