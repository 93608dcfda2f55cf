// db/jobdb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgArguments, query::Query, types::Json, Postgres};
use uuid::Uuid;

use super::{db::DBClient, query_timeout::QueryTimeout};
use crate::{
    models::jobmodel::{Job, JobStatus},
    service::error::ServiceError,
};

/// Durable home of job records.
///
/// `update_job` is the only write path after creation and is a compare-and-swap
/// on `version`: it succeeds only if nobody wrote the job since it was read.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    async fn insert_job(&self, job: &Job) -> Result<Job, ServiceError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, ServiceError>;

    /// Persists `job` with `version = expected_version + 1`, or fails with
    /// `Conflict` when the stored version is no longer `expected_version`.
    async fn update_job(&self, job: &Job, expected_version: i64) -> Result<Job, ServiceError>;

    async fn has_recent_duplicate(
        &self,
        client_id: Uuid,
        title: &str,
        skill: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;

    /// Inserts `job` unless the same client posted the same title and skill at
    /// or after `since`. Check and insert are a single atomic step, so two
    /// concurrent posts cannot both pass. `Ok(None)` means a duplicate exists.
    async fn insert_unless_duplicate(&self, job: &Job, since: DateTime<Utc>) -> Result<Option<Job>, ServiceError>;

    /// Jobs in `cooling_window` whose window ended at or before `now`.
    async fn list_due_for_finalize(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, ServiceError>;
}

fn cooling_ends_at(job: &Job) -> Option<DateTime<Utc>> {
    job.cooling_period.as_ref().map(|p| p.settles_at())
}

/// Advisory lock key shared by every post of the same job by the same client.
fn duplicate_lock_key(client_id: Uuid, title: &str, skill: &str) -> String {
    format!("{}:{}:{}", client_id, title.trim().to_lowercase(), skill.trim().to_lowercase())
}

const INSERT_JOB: &str = r#"
    INSERT INTO jobs
    (id, client_id, worker_id, title, skill, status, version, cooling_ends_at, document, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

const DUPLICATE_EXISTS: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM jobs
        WHERE client_id = $1
        AND LOWER(title) = LOWER($2)
        AND LOWER(skill) = LOWER($3)
        AND status <> $4
        AND created_at >= $5
    )
"#;

fn insert_query(job: &Job) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(INSERT_JOB)
        .bind(job.id)
        .bind(job.client_id)
        .bind(job.worker_id)
        .bind(&job.title)
        .bind(&job.skill)
        .bind(job.status.to_str())
        .bind(job.version)
        .bind(cooling_ends_at(job))
        .bind(Json(job))
        .bind(job.created_at)
        .bind(job.updated_at)
}

#[async_trait]
impl JobStore for DBClient {
    async fn insert_job(&self, job: &Job) -> Result<Job, ServiceError> {
        QueryTimeout::execute_with_timeout(insert_query(job).execute(&self.pool), QueryTimeout::DEFAULT_TIMEOUT)
            .await?;

        Ok(job.clone())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, ServiceError> {
        let row = QueryTimeout::execute_with_timeout(
            sqlx::query_as::<_, (Json<Job>, i64)>("SELECT document, version FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool),
            QueryTimeout::LOOKUP_TIMEOUT,
        )
        .await?;

        Ok(row.map(|(Json(mut job), version)| {
            job.version = version;
            job
        }))
    }

    async fn update_job(&self, job: &Job, expected_version: i64) -> Result<Job, ServiceError> {
        let mut stored = job.clone();
        stored.version = expected_version + 1;

        let result = QueryTimeout::execute_with_timeout(
            sqlx::query(
                r#"
                UPDATE jobs
                SET worker_id = $2, status = $3, version = $4, cooling_ends_at = $5,
                    document = $6, updated_at = $7
                WHERE id = $1 AND version = $8
                "#,
            )
            .bind(stored.id)
            .bind(stored.worker_id)
            .bind(stored.status.to_str())
            .bind(stored.version)
            .bind(cooling_ends_at(&stored))
            .bind(Json(&stored))
            .bind(stored.updated_at)
            .bind(expected_version)
            .execute(&self.pool),
            QueryTimeout::DEFAULT_TIMEOUT,
        )
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_job(job.id).await? {
                Some(_) => Err(ServiceError::Conflict(job.id)),
                None => Err(ServiceError::JobNotFound(job.id)),
            };
        }

        Ok(stored)
    }

    async fn has_recent_duplicate(
        &self,
        client_id: Uuid,
        title: &str,
        skill: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let exists = QueryTimeout::execute_with_timeout(
            sqlx::query_scalar::<_, bool>(DUPLICATE_EXISTS)
                .bind(client_id)
                .bind(title.trim())
                .bind(skill.trim())
                .bind(JobStatus::Cancelled.to_str())
                .bind(since)
                .fetch_one(&self.pool),
            QueryTimeout::LOOKUP_TIMEOUT,
        )
        .await?;

        Ok(exists)
    }

    async fn insert_unless_duplicate(&self, job: &Job, since: DateTime<Utc>) -> Result<Option<Job>, ServiceError> {
        let transaction = async {
            let mut tx = self.pool.begin().await?;

            // Held until commit, so a concurrent post of the same job waits here.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(duplicate_lock_key(job.client_id, &job.title, &job.skill))
                .execute(&mut *tx)
                .await?;

            let exists = sqlx::query_scalar::<_, bool>(DUPLICATE_EXISTS)
                .bind(job.client_id)
                .bind(job.title.trim())
                .bind(job.skill.trim())
                .bind(JobStatus::Cancelled.to_str())
                .bind(since)
                .fetch_one(&mut *tx)
                .await?;
            if exists {
                tx.rollback().await?;
                return Ok::<_, sqlx::Error>(None);
            }

            insert_query(job).execute(&mut *tx).await?;
            tx.commit().await?;
            Ok(Some(job.clone()))
        };

        QueryTimeout::execute_with_timeout(transaction, QueryTimeout::DEFAULT_TIMEOUT).await
    }

    async fn list_due_for_finalize(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, ServiceError> {
        QueryTimeout::execute_with_timeout(
            sqlx::query_scalar::<_, Uuid>(
                r#"
                SELECT id FROM jobs
                WHERE status = $1 AND cooling_ends_at <= $2
                ORDER BY cooling_ends_at ASC
                LIMIT $3
                "#,
            )
            .bind(JobStatus::CoolingWindow.to_str())
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool),
            QueryTimeout::DEFAULT_TIMEOUT,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_lock_key_ignores_case_and_padding() {
        let client = Uuid::new_v4();
        assert_eq!(
            duplicate_lock_key(client, " Fix Kitchen Sink ", "Plumbing"),
            duplicate_lock_key(client, "fix kitchen sink", "plumbing")
        );
        assert_ne!(
            duplicate_lock_key(client, "Fix kitchen sink", "plumbing"),
            duplicate_lock_key(Uuid::new_v4(), "Fix kitchen sink", "plumbing")
        );
    }
}
