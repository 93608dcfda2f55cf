// db/reliabilitydb.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::{db::DBClient, query_timeout::QueryTimeout};
use crate::{
    models::reliabilitymodel::{ReliabilityEvent, ReliabilityStats, WorkerReliability, INITIAL_RELIABILITY_SCORE},
    service::error::ServiceError,
};

/// Worker reputation fields. Profiles that were never written read as the initial profile.
#[async_trait]
pub trait ReliabilityStore: Send + Sync + std::fmt::Debug {
    async fn get_reliability(&self, worker_id: Uuid) -> Result<WorkerReliability, ServiceError>;

    /// Applies `event` atomically and returns the updated profile.
    async fn apply_reliability_event(
        &self,
        worker_id: Uuid,
        event: &ReliabilityEvent,
        at: DateTime<Utc>,
    ) -> Result<WorkerReliability, ServiceError>;
}

#[derive(Debug, sqlx::FromRow)]
struct ReliabilityRow {
    worker_id: Uuid,
    score: i32,
    stats: Json<ReliabilityStats>,
    skill_confidence: Json<HashMap<String, f64>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<ReliabilityRow> for WorkerReliability {
    fn from(row: ReliabilityRow) -> Self {
        WorkerReliability {
            worker_id: row.worker_id,
            score: row.score,
            stats: row.stats.0,
            skill_confidence: row.skill_confidence.0,
            updated_at: row.updated_at,
        }
    }
}

const SEED_RELIABILITY: &str = r#"
    INSERT INTO worker_reliability (worker_id, score)
    VALUES ($1, $2)
    ON CONFLICT (worker_id) DO NOTHING
"#;

const SELECT_RELIABILITY: &str = r#"
    SELECT worker_id, score, stats, skill_confidence, updated_at
    FROM worker_reliability
    WHERE worker_id = $1
"#;

#[async_trait]
impl ReliabilityStore for DBClient {
    async fn get_reliability(&self, worker_id: Uuid) -> Result<WorkerReliability, ServiceError> {
        let row = QueryTimeout::execute_with_timeout(
            sqlx::query_as::<_, ReliabilityRow>(SELECT_RELIABILITY)
                .bind(worker_id)
                .fetch_optional(&self.pool),
            QueryTimeout::LOOKUP_TIMEOUT,
        )
        .await?;

        Ok(row.map(WorkerReliability::from).unwrap_or_else(|| WorkerReliability::new(worker_id)))
    }

    async fn apply_reliability_event(
        &self,
        worker_id: Uuid,
        event: &ReliabilityEvent,
        at: DateTime<Utc>,
    ) -> Result<WorkerReliability, ServiceError> {
        let transaction = async {
            let mut tx = self.pool.begin().await?;

            // Seed the row first so FOR UPDATE has something to lock even on a
            // worker's first event.
            sqlx::query(SEED_RELIABILITY)
                .bind(worker_id)
                .bind(INITIAL_RELIABILITY_SCORE)
                .execute(&mut *tx)
                .await?;

            let current: WorkerReliability =
                sqlx::query_as::<_, ReliabilityRow>(&format!("{} FOR UPDATE", SELECT_RELIABILITY))
                    .bind(worker_id)
                    .fetch_one(&mut *tx)
                    .await?
                    .into();

            let updated = current.apply(event, at);

            sqlx::query(
                r#"
                UPDATE worker_reliability
                SET score = $2, stats = $3, skill_confidence = $4, updated_at = $5
                WHERE worker_id = $1
                "#,
            )
            .bind(worker_id)
            .bind(updated.score)
            .bind(Json(&updated.stats))
            .bind(Json(&updated.skill_confidence))
            .bind(updated.updated_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(updated)
        };

        QueryTimeout::execute_with_timeout(transaction, QueryTimeout::DEFAULT_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    // Needs a migrated Postgres; skipped unless TEST_DATABASE_URL is set.
    #[tokio::test]
    async fn test_concurrent_first_events_are_both_applied() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.unwrap();
        let db = DBClient::new(pool);
        let worker = Uuid::new_v4();
        let now = Utc::now();

        let (a, b) = tokio::join!(
            db.apply_reliability_event(worker, &ReliabilityEvent::ArrivedOnTime, now),
            db.apply_reliability_event(worker, &ReliabilityEvent::ArrivedOnTime, now)
        );
        a.unwrap();
        b.unwrap();

        let profile = db.get_reliability(worker).await.unwrap();
        assert_eq!(profile.stats.on_time_arrivals, 2);
        assert_eq!(profile.score, INITIAL_RELIABILITY_SCORE + 4);
    }
}
