// services/escrow_service.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    models::jobmodel::{EscrowRecord, EscrowState, Job},
    service::{error::ServiceError, penalty::PenaltyOutcome},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerReceipt {
    pub reference: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger rejected {operation}: {message}")]
    Rejected { operation: String, message: String },

    #[error("ledger request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// The external wallet ledger that actually moves money. Every call is keyed
/// by job id so the ledger can deduplicate retries.
#[async_trait]
pub trait EscrowLedger: Send + Sync + std::fmt::Debug {
    async fn hold(&self, job_id: Uuid, payer_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError>;

    async fn top_up(
        &self,
        job_id: Uuid,
        payer_id: Uuid,
        amount: f64,
        reference: Uuid,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn release(&self, job_id: Uuid, payee_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError>;

    async fn refund(&self, job_id: Uuid, payer_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError>;

    async fn collect_penalty(
        &self,
        job_id: Uuid,
        payer_id: Uuid,
        worker_id: Option<Uuid>,
        penalty: &PenaltyOutcome,
    ) -> Result<LedgerReceipt, LedgerError>;
}

/// A fee is owed once per job and payer, so a client attempt never masks a later worker one.
fn penalty_key(job_id: Uuid, payer_id: Uuid) -> String {
    format!("{}:penalty:{}", job_id, payer_id)
}

#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn post(
        &self,
        job_id: Uuid,
        operation: &str,
        idempotency_key: String,
        body: serde_json::Value,
    ) -> Result<LedgerReceipt, LedgerError> {
        let response = self
            .client
            .post(format!("{}/escrows/{}/{}", self.base_url, job_id, operation))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected {
                operation: operation.to_string(),
                message: format!("{}: {}", status, message),
            });
        }

        Ok(response.json::<LedgerReceipt>().await?)
    }
}

#[async_trait]
impl EscrowLedger for HttpLedgerClient {
    async fn hold(&self, job_id: Uuid, payer_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError> {
        self.post(
            job_id,
            "hold",
            format!("{}:hold", job_id),
            serde_json::json!({ "payer_id": payer_id, "amount": amount }),
        )
        .await
    }

    async fn top_up(
        &self,
        job_id: Uuid,
        payer_id: Uuid,
        amount: f64,
        reference: Uuid,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.post(
            job_id,
            "top_up",
            format!("{}:top_up:{}", job_id, reference),
            serde_json::json!({ "payer_id": payer_id, "amount": amount, "reference": reference }),
        )
        .await
    }

    async fn release(&self, job_id: Uuid, payee_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError> {
        self.post(
            job_id,
            "release",
            format!("{}:release", job_id),
            serde_json::json!({ "payee_id": payee_id, "amount": amount }),
        )
        .await
    }

    async fn refund(&self, job_id: Uuid, payer_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError> {
        self.post(
            job_id,
            "refund",
            format!("{}:refund", job_id),
            serde_json::json!({ "payer_id": payer_id, "amount": amount }),
        )
        .await
    }

    async fn collect_penalty(
        &self,
        job_id: Uuid,
        payer_id: Uuid,
        worker_id: Option<Uuid>,
        penalty: &PenaltyOutcome,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.post(
            job_id,
            "penalty",
            penalty_key(job_id, payer_id),
            serde_json::json!({
                "payer_id": payer_id,
                "worker_id": worker_id,
                "fee": penalty.fee,
                "worker_share": penalty.worker_share,
                "platform_share": penalty.platform_share,
            }),
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxEntry {
    pub key: String,
    pub job_id: Uuid,
    pub party_id: Option<Uuid>,
    pub amount: f64,
}

#[derive(Debug, Default)]
struct SandboxState {
    entries: Vec<SandboxEntry>,
    receipts: HashMap<String, LedgerReceipt>,
    unavailable: bool,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

/// In-process ledger used when no ledger URL is configured. Deduplicates by
/// idempotency key the same way the real ledger does.
#[derive(Debug, Default)]
pub struct SandboxLedger {
    state: Mutex<SandboxState>,
}

impl SandboxLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a ledger outage: every call fails until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Fails only calls for one operation, such as `refund`.
    pub async fn set_failing(&self, operation: &str, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.failing.insert(operation.to_string());
        } else {
            state.failing.remove(operation);
        }
    }

    /// Simulates a slow ledger.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.delay = delay;
    }

    pub async fn entries(&self) -> Vec<SandboxEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| e.key.split(':').nth(1) == Some(operation))
            .count()
    }

    async fn record(
        &self,
        key: String,
        job_id: Uuid,
        party_id: Option<Uuid>,
        amount: f64,
    ) -> Result<LedgerReceipt, LedgerError> {
        let delay = self.state.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let operation = key.split(':').nth(1).unwrap_or_default();
        if state.unavailable || state.failing.contains(operation) {
            return Err(LedgerError::Rejected {
                operation: key,
                message: "sandbox ledger unavailable".to_string(),
            });
        }
        if let Some(receipt) = state.receipts.get(&key) {
            return Ok(receipt.clone());
        }

        let receipt = LedgerReceipt { reference: format!("sandbox-{}", Uuid::new_v4()) };
        state.entries.push(SandboxEntry { key: key.clone(), job_id, party_id, amount });
        state.receipts.insert(key, receipt.clone());
        Ok(receipt)
    }
}

#[async_trait]
impl EscrowLedger for SandboxLedger {
    async fn hold(&self, job_id: Uuid, payer_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError> {
        self.record(format!("{}:hold", job_id), job_id, Some(payer_id), amount).await
    }

    async fn top_up(
        &self,
        job_id: Uuid,
        payer_id: Uuid,
        amount: f64,
        reference: Uuid,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.record(format!("{}:top_up:{}", job_id, reference), job_id, Some(payer_id), amount).await
    }

    async fn release(&self, job_id: Uuid, payee_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError> {
        self.record(format!("{}:release", job_id), job_id, Some(payee_id), amount).await
    }

    async fn refund(&self, job_id: Uuid, payer_id: Uuid, amount: f64) -> Result<LedgerReceipt, LedgerError> {
        self.record(format!("{}:refund", job_id), job_id, Some(payer_id), amount).await
    }

    async fn collect_penalty(
        &self,
        job_id: Uuid,
        payer_id: Uuid,
        _worker_id: Option<Uuid>,
        penalty: &PenaltyOutcome,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.record(penalty_key(job_id, payer_id), job_id, Some(payer_id), penalty.fee).await
    }
}

/// Wraps the ledger with the job-level idempotency rules and a hard timeout.
///
/// Nothing here writes the job: callers persist the returned record only
/// after the ledger call succeeded.
#[derive(Debug, Clone)]
pub struct EscrowService {
    ledger: Arc<dyn EscrowLedger>,
    timeout: Duration,
}

impl EscrowService {
    pub fn new(ledger: Arc<dyn EscrowLedger>, timeout: Duration) -> Self {
        Self { ledger, timeout }
    }

    async fn call<F>(&self, operation: &str, job_id: Uuid, request: F) -> Result<LedgerReceipt, ServiceError>
    where
        F: std::future::Future<Output = Result<LedgerReceipt, LedgerError>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(receipt)) => {
                tracing::info!("Ledger {} for job {} succeeded ({})", operation, job_id, receipt.reference);
                Ok(receipt)
            }
            Ok(Err(e)) => {
                tracing::error!("Ledger {} for job {} failed: {}", operation, job_id, e);
                Err(ServiceError::ExternalService(format!("Escrow {} failed: {}", operation, e)))
            }
            Err(_) => {
                tracing::error!("Ledger {} for job {} timed out after {:?}", operation, job_id, self.timeout);
                Err(ServiceError::ExternalService(format!(
                    "Escrow {} timed out after {:?}",
                    operation, self.timeout
                )))
            }
        }
    }

    fn ensure_unsettled(job: &Job) -> Result<(), ServiceError> {
        let settled = job.payment_released
            || matches!(
                job.escrow.as_ref().map(|e| e.state),
                Some(EscrowState::Released) | Some(EscrowState::Refunded)
            );
        if settled {
            Err(ServiceError::AlreadySettled(job.id))
        } else {
            Ok(())
        }
    }

    /// Holds `amount` for the job. A job that already has a held escrow gets it back unchanged.
    pub async fn create_escrow(&self, job: &Job, amount: f64, now: DateTime<Utc>) -> Result<EscrowRecord, ServiceError> {
        Self::ensure_unsettled(job)?;
        if let Some(existing) = job.escrow.as_ref().filter(|e| e.state == EscrowState::Held) {
            tracing::info!("Escrow already held for job {}, skipping create", job.id);
            return Ok(existing.clone());
        }

        let receipt = self.call("hold", job.id, self.ledger.hold(job.id, job.client_id, amount)).await?;
        Ok(EscrowRecord {
            amount,
            top_ups: Vec::new(),
            state: EscrowState::Held,
            reference: receipt.reference,
            created_at: now,
            settled_at: None,
        })
    }

    /// Adds an approved material cost to the held amount, opening the escrow if none exists yet.
    pub async fn top_up(
        &self,
        job: &Job,
        amount: f64,
        reference: Uuid,
        now: DateTime<Utc>,
    ) -> Result<EscrowRecord, ServiceError> {
        Self::ensure_unsettled(job)?;
        let Some(existing) = job.escrow.as_ref() else {
            return self.create_escrow(job, amount, now).await;
        };

        self.call(
            "top_up",
            job.id,
            self.ledger.top_up(job.id, job.client_id, amount, reference),
        )
        .await?;

        let mut record = existing.clone();
        record.top_ups.push(amount);
        Ok(record)
    }

    /// Pays the held funds out to the worker. `Ok(None)` when the job never held funds.
    pub async fn release(&self, job: &Job, now: DateTime<Utc>) -> Result<Option<EscrowRecord>, ServiceError> {
        Self::ensure_unsettled(job)?;
        let Some(existing) = job.escrow.as_ref() else {
            return Ok(None);
        };
        let worker_id = job
            .worker_id
            .ok_or_else(|| ServiceError::Validation("Cannot release escrow without an assigned worker".to_string()))?;

        self.call("release", job.id, self.ledger.release(job.id, worker_id, existing.total()))
            .await?;

        let mut record = existing.clone();
        record.state = EscrowState::Released;
        record.settled_at = Some(now);
        Ok(Some(record))
    }

    /// Returns the held funds to the client. `Ok(None)` when the job never held funds.
    pub async fn refund(&self, job: &Job, now: DateTime<Utc>) -> Result<Option<EscrowRecord>, ServiceError> {
        Self::ensure_unsettled(job)?;
        let Some(existing) = job.escrow.as_ref() else {
            return Ok(None);
        };

        self.call("refund", job.id, self.ledger.refund(job.id, job.client_id, existing.total()))
            .await?;

        let mut record = existing.clone();
        record.state = EscrowState::Refunded;
        record.settled_at = Some(now);
        Ok(Some(record))
    }

    pub async fn collect_penalty(
        &self,
        job: &Job,
        payer_id: Uuid,
        penalty: &PenaltyOutcome,
    ) -> Result<Option<LedgerReceipt>, ServiceError> {
        if !penalty.is_chargeable() {
            return Ok(None);
        }
        let receipt = self
            .call(
                "penalty",
                job.id,
                self.ledger.collect_penalty(job.id, payer_id, job.worker_id, penalty),
            )
            .await?;
        Ok(Some(receipt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::jobmodel::ActorRole, service::{penalty::PenaltyStage, test_support::sample_job}};

    fn service(ledger: Arc<SandboxLedger>, timeout: Duration) -> EscrowService {
        EscrowService::new(ledger, timeout)
    }

    #[tokio::test]
    async fn test_duplicate_create_is_a_noop() {
        let ledger = Arc::new(SandboxLedger::new());
        let escrow = service(ledger.clone(), Duration::from_secs(1));
        let now = Utc::now();
        let mut job = sample_job(now);

        let record = escrow.create_escrow(&job, 1000.0, now).await.unwrap();
        job.escrow = Some(record.clone());
        let again = escrow.create_escrow(&job, 1000.0, now).await.unwrap();

        assert_eq!(record, again);
        assert_eq!(ledger.count("hold").await, 1);
    }

    #[tokio::test]
    async fn test_release_after_settlement_is_rejected() {
        let ledger = Arc::new(SandboxLedger::new());
        let escrow = service(ledger.clone(), Duration::from_secs(1));
        let now = Utc::now();
        let mut job = sample_job(now);
        job.worker_id = Some(Uuid::new_v4());
        job.escrow = Some(escrow.create_escrow(&job, 500.0, now).await.unwrap());

        job.escrow = escrow.release(&job, now).await.unwrap();
        job.payment_released = true;

        assert!(matches!(escrow.release(&job, now).await, Err(ServiceError::AlreadySettled(_))));
        assert!(matches!(escrow.refund(&job, now).await, Err(ServiceError::AlreadySettled(_))));
        assert_eq!(ledger.count("release").await, 1);
        assert_eq!(ledger.count("refund").await, 0);
    }

    #[tokio::test]
    async fn test_top_up_adds_to_total() {
        let ledger = Arc::new(SandboxLedger::new());
        let escrow = service(ledger.clone(), Duration::from_secs(1));
        let now = Utc::now();
        let mut job = sample_job(now);
        job.escrow = Some(escrow.create_escrow(&job, 1000.0, now).await.unwrap());

        let record = escrow.top_up(&job, 45.0, Uuid::new_v4(), now).await.unwrap();
        assert_eq!(record.total(), 1045.0);
        assert_eq!(ledger.count("top_up").await, 1);
    }

    #[tokio::test]
    async fn test_ledger_outage_surfaces_external_error() {
        let ledger = Arc::new(SandboxLedger::new());
        ledger.set_unavailable(true).await;
        let escrow = service(ledger.clone(), Duration::from_secs(1));
        let job = sample_job(Utc::now());

        let err = escrow.create_escrow(&job, 10.0, Utc::now()).await.unwrap_err();
        assert!(matches!(err, ServiceError::ExternalService(_)));
        assert!(ledger.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_ledger_times_out() {
        let ledger = Arc::new(SandboxLedger::new());
        ledger.set_delay(Some(Duration::from_millis(200))).await;
        let escrow = service(ledger, Duration::from_millis(20));
        let job = sample_job(Utc::now());

        let err = escrow.create_escrow(&job, 10.0, Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_penalty_is_keyed_per_payer() {
        let ledger = Arc::new(SandboxLedger::new());
        let escrow = service(ledger.clone(), Duration::from_secs(1));
        let mut job = sample_job(Utc::now());
        let worker = Uuid::new_v4();
        job.worker_id = Some(worker);
        let fee = PenaltyOutcome {
            stage: PenaltyStage::EnRoute,
            payer: ActorRole::Client,
            fee: 100.0,
            worker_share: 80.0,
            platform_share: 20.0,
            score_penalty: 0,
        };

        escrow.collect_penalty(&job, job.client_id, &fee).await.unwrap();
        escrow.collect_penalty(&job, job.client_id, &fee).await.unwrap();
        escrow.collect_penalty(&job, worker, &fee).await.unwrap();

        assert_eq!(ledger.count("penalty").await, 2);
        let payers: Vec<_> = ledger.entries().await.iter().map(|e| e.party_id).collect();
        assert_eq!(payers, vec![Some(job.client_id), Some(worker)]);
    }

    #[tokio::test]
    async fn test_single_operation_outage() {
        let ledger = Arc::new(SandboxLedger::new());
        ledger.set_failing("refund", true).await;
        let escrow = service(ledger.clone(), Duration::from_secs(1));
        let now = Utc::now();
        let mut job = sample_job(now);
        job.escrow = Some(escrow.create_escrow(&job, 200.0, now).await.unwrap());

        assert!(matches!(escrow.refund(&job, now).await, Err(ServiceError::ExternalService(_))));
        assert_eq!(ledger.count("refund").await, 0);

        ledger.set_failing("refund", false).await;
        assert!(escrow.refund(&job, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_without_escrow_moves_nothing() {
        let ledger = Arc::new(SandboxLedger::new());
        let escrow = service(ledger.clone(), Duration::from_secs(1));
        let job = sample_job(Utc::now());
        assert!(escrow.release(&job, Utc::now()).await.unwrap().is_none());
        assert!(ledger.entries().await.is_empty());
    }
}
