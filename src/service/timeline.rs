// service/timeline.rs
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::models::jobmodel::{Actor, Job, TimelineEntry};

pub const PHONE_MASK: &str = "[PHONE-REDACTED]";
pub const EMAIL_MASK: &str = "[EMAIL-REDACTED]";

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern is valid")
    })
}

fn phone_regex() -> &'static Regex {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    PHONE.get_or_init(|| {
        Regex::new(r"(\+?[0-9]{1,3}[- ]?)?[0-9]{3}[- ]?[0-9]{3}[- ]?[0-9]{4}").expect("phone pattern is valid")
    })
}

/// Masks phone numbers and email addresses so contact details never reach the audit trail.
pub fn redact_pii(note: &str) -> String {
    let without_emails = email_regex().replace_all(note, EMAIL_MASK);
    phone_regex().replace_all(&without_emails, PHONE_MASK).into_owned()
}

/// Returns `job` with one more timeline entry stamped with its current status.
///
/// Entries are never reordered: if the clock reads earlier than the last
/// entry, the new entry reuses the last timestamp.
pub fn append_entry(
    mut job: Job,
    actor: &Actor,
    note: &str,
    metadata: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Job {
    let timestamp = match job.last_timeline_timestamp() {
        Some(last) if last > now => last,
        _ => now,
    };

    job.timeline.push(TimelineEntry {
        status: job.status,
        timestamp,
        actor: actor.role,
        actor_id: actor.id,
        note: redact_pii(note),
        metadata,
    });
    job.updated_at = timestamp;
    job
}
