// Database query timeout protection
use std::time::Duration;

use tokio::time::timeout;

use crate::service::error::ServiceError;

pub struct QueryTimeout;

impl QueryTimeout {
    /// Execute a query with a timeout to prevent slow queries from blocking
    pub async fn execute_with_timeout<F, T>(query_fn: F, timeout_duration: Duration) -> Result<T, ServiceError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match timeout(timeout_duration, query_fn).await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(_) => Err(ServiceError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("Query timed out after {:?}", timeout_duration),
            )))),
        }
    }

    /// Default timeout for most queries (5 seconds)
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Short timeout for simple lookups (2 seconds)
    pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);
}
