// services/notification_service.rs
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    mail::sendmail::{send_email, SmtpSettings},
    models::jobmodel::Job,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub recipient_id: Option<Uuid>,
    pub kind: &'static str,
    pub job_id: Uuid,
    pub message: String,
    /// Needs attention from the operations team, not just the parties.
    pub alert: bool,
}

impl Notification {
    pub fn to_user(recipient_id: Uuid, kind: &'static str, job: &Job, message: String) -> Self {
        Self {
            recipient_id: Some(recipient_id),
            kind,
            job_id: job.id,
            message,
            alert: false,
        }
    }

    pub fn ops_alert(kind: &'static str, job: &Job, message: String) -> Self {
        Self {
            recipient_id: None,
            kind,
            job_id: job.id,
            message,
            alert: true,
        }
    }
}

/// A delivery channel for notifications. Delivery is best effort.
#[async_trait]
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    async fn deliver(&self, notification: &Notification) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        tracing::info!(
            "Notification {} for {:?} on job {}: {}",
            notification.kind,
            notification.recipient_id,
            notification.job_id,
            notification.message
        );
        Ok(())
    }
}

/// Emails operational alerts (disputes, security events, warranty claims) to the ops mailbox.
#[derive(Debug)]
pub struct EmailAlertSink {
    settings: SmtpSettings,
    alert_email: String,
}

impl EmailAlertSink {
    pub fn new(settings: SmtpSettings, alert_email: String) -> Self {
        Self { settings, alert_email }
    }
}

#[async_trait]
impl NotificationSink for EmailAlertSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), String> {
        if !notification.alert {
            return Ok(());
        }
        let subject = format!("[{}] job {}", notification.kind, notification.job_id);
        send_email(&self.settings, &self.alert_email, &subject, &notification.message)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Fire-and-forget dispatcher: deliveries run on spawned tasks, failures are
/// logged and never reach the operation that triggered them.
#[derive(Debug, Clone)]
pub struct NotificationService {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationService {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub fn dispatch(&self, notification: Notification) {
        for sink in &self.sinks {
            let sink = sink.clone();
            let notification = notification.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.deliver(&notification).await {
                    tracing::warn!(
                        "Failed to deliver {} notification for job {}: {}",
                        notification.kind,
                        notification.job_id,
                        e
                    );
                }
            });
        }
    }
}
