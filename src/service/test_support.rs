// Shared fixtures for unit tests.
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    models::jobmodel::*,
    service::notification_service::{Notification, NotificationSink},
};

pub fn sample_job(now: DateTime<Utc>) -> Job {
    let client_id = Uuid::new_v4();
    Job {
        id: Uuid::new_v4(),
        client_id,
        worker_id: None,
        title: "Fix leaking kitchen tap".to_string(),
        description: "Kitchen tap drips constantly even when closed".to_string(),
        skill: "plumbing".to_string(),
        urgency: UrgencyLevel::Medium,
        location: GeoPoint { latitude: 6.4281, longitude: 3.4219 },
        quotation_window_start: now,
        quotation_window_end: now + Duration::hours(24),
        quotations: Vec::new(),
        agreed_amount: None,
        status: JobStatus::Open,
        timeline: vec![TimelineEntry {
            status: JobStatus::Open,
            timestamp: now,
            actor: ActorRole::Client,
            actor_id: Some(client_id),
            note: "Job created".to_string(),
            metadata: None,
        }],
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
    }
}

/// Keeps every delivered notification for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub async fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().await.clone()
    }

    /// Waits for spawned deliveries to land, up to one second.
    pub async fn wait_for(&self, count: usize) -> Vec<Notification> {
        for _ in 0..100 {
            let delivered = self.delivered().await;
            if delivered.len() >= count {
                return delivered;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        self.delivered().await
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        self.delivered.lock().await.push(notification.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FailingSink;

#[async_trait]
impl NotificationSink for FailingSink {
    async fn deliver(&self, _notification: &Notification) -> Result<(), String> {
        Err("mailbox unavailable".to_string())
    }
}
