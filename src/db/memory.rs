// db/memory.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{jobdb::JobStore, reliabilitydb::ReliabilityStore};
use crate::{
    models::{
        jobmodel::{Job, JobStatus},
        reliabilitymodel::{ReliabilityEvent, WorkerReliability},
    },
    service::error::ServiceError,
};

/// Process-local store used when no database is configured and in tests.
/// Same compare-and-swap contract as the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    reliability: RwLock<HashMap<Uuid, WorkerReliability>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_duplicate(jobs: &HashMap<Uuid, Job>, client_id: Uuid, title: &str, skill: &str, since: DateTime<Utc>) -> bool {
    let title = title.trim().to_lowercase();
    let skill = skill.trim().to_lowercase();
    jobs.values().any(|job| {
        job.client_id == client_id
            && job.title.to_lowercase() == title
            && job.skill.to_lowercase() == skill
            && job.status != JobStatus::Cancelled
            && job.created_at >= since
    })
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<Job, ServiceError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(ServiceError::Conflict(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, ServiceError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_job(&self, job: &Job, expected_version: i64) -> Result<Job, ServiceError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get_mut(&job.id).ok_or(ServiceError::JobNotFound(job.id))?;
        if current.version != expected_version {
            return Err(ServiceError::Conflict(job.id));
        }

        let mut stored = job.clone();
        stored.version = expected_version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn has_recent_duplicate(
        &self,
        client_id: Uuid,
        title: &str,
        skill: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        Ok(is_duplicate(&*self.jobs.read().await, client_id, title, skill, since))
    }

    async fn insert_unless_duplicate(&self, job: &Job, since: DateTime<Utc>) -> Result<Option<Job>, ServiceError> {
        let mut jobs = self.jobs.write().await;
        if is_duplicate(&jobs, job.client_id, &job.title, &job.skill, since) {
            return Ok(None);
        }
        if jobs.contains_key(&job.id) {
            return Err(ServiceError::Conflict(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(Some(job.clone()))
    }

    async fn list_due_for_finalize(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, ServiceError> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|job| job.status == JobStatus::CoolingWindow)
            .filter_map(|job| job.cooling_period.as_ref().map(|p| (p.settles_at(), job.id)))
            .filter(|(settles_at, _)| *settles_at <= now)
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }
}

#[async_trait]
impl ReliabilityStore for InMemoryStore {
    async fn get_reliability(&self, worker_id: Uuid) -> Result<WorkerReliability, ServiceError> {
        Ok(self
            .reliability
            .read()
            .await
            .get(&worker_id)
            .cloned()
            .unwrap_or_else(|| WorkerReliability::new(worker_id)))
    }

    async fn apply_reliability_event(
        &self,
        worker_id: Uuid,
        event: &ReliabilityEvent,
        at: DateTime<Utc>,
    ) -> Result<WorkerReliability, ServiceError> {
        let mut profiles = self.reliability.write().await;
        let current = profiles
            .remove(&worker_id)
            .unwrap_or_else(|| WorkerReliability::new(worker_id));
        let updated = current.apply(event, at);
        profiles.insert(worker_id, updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::sample_job;
    use chrono::Duration;

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let store = InMemoryStore::new();
        let job = store.insert_job(&sample_job(Utc::now())).await.unwrap();

        let mut first = job.clone();
        first.title = "first writer".to_string();
        let stored = store.update_job(&first, job.version).await.unwrap();
        assert_eq!(stored.version, job.version + 1);

        let mut second = job.clone();
        second.title = "second writer".to_string();
        let err = store.update_job(&second, job.version).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let current = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.title, "first writer");
    }

    #[tokio::test]
    async fn test_duplicate_lookup_ignores_cancelled_and_old_jobs() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let job = sample_job(now);
        store.insert_job(&job).await.unwrap();

        let since = now - Duration::minutes(10);
        assert!(store.has_recent_duplicate(job.client_id, &job.title.to_uppercase(), &job.skill, since).await.unwrap());
        assert!(!store.has_recent_duplicate(job.client_id, "Other", &job.skill, since).await.unwrap());
        assert!(!store.has_recent_duplicate(job.client_id, &job.title, &job.skill, now + Duration::seconds(1)).await.unwrap());

        let mut cancelled = job.clone();
        cancelled.status = JobStatus::Cancelled;
        store.update_job(&cancelled, job.version).await.unwrap();
        assert!(!store.has_recent_duplicate(job.client_id, &job.title, &job.skill, since).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_posts_insert_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let first = sample_job(now);
        let mut second = sample_job(now);
        second.client_id = first.client_id;
        let since = now - Duration::minutes(10);

        let (a, b) = tokio::join!(
            store.insert_unless_duplicate(&first, since),
            store.insert_unless_duplicate(&second, since)
        );
        let inserted = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_events_are_both_applied() {
        let store = InMemoryStore::new();
        let worker = Uuid::new_v4();
        let now = Utc::now();

        let (a, b) = tokio::join!(
            store.apply_reliability_event(worker, &ReliabilityEvent::ArrivedOnTime, now),
            store.apply_reliability_event(worker, &ReliabilityEvent::ArrivedOnTime, now)
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(store.get_reliability(worker).await.unwrap().score, 54);
    }

    #[tokio::test]
    async fn test_reliability_defaults_and_updates() {
        let store = InMemoryStore::new();
        let worker = Uuid::new_v4();
        assert_eq!(store.get_reliability(worker).await.unwrap().score, 50);

        store.apply_reliability_event(worker, &ReliabilityEvent::ArrivedOnTime, Utc::now()).await.unwrap();
        assert_eq!(store.get_reliability(worker).await.unwrap().score, 52);
    }
}
