use std::time::Duration;

use ::redis::{Pipeline, Value, aio::MultiplexedConnection};

use crate::txm::store::{TransactionStoreError, redis::RedisTxStore};

const MAX_RETRIES: u32 = 10;
const RETRY_BASE_DELAY_MS: u64 = 10;
const MAX_IDLE_CONNECTIONS: usize = 16;

/// One optimistic read-modify-write against Redis.
///
/// `validation` runs after every key in `watch_keys` is WATCHed; `operation`
/// queues the writes into a MULTI/EXEC pipeline. A concurrent change to any
/// watched key aborts EXEC and the whole unit is retried.
pub(super) trait SafeRedisTransaction: Send + Sync {
    type ValidationData: Send;
    type OperationResult: Send;

    fn name(&self) -> &str;
    fn operation(
        &self,
        pipeline: &mut Pipeline,
        validation_data: Self::ValidationData,
    ) -> Self::OperationResult;
    fn validation(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> impl Future<Output = Result<Self::ValidationData, TransactionStoreError>> + Send;
    fn watch_keys(&self) -> Vec<String>;
}

impl RedisTxStore {
    /// WATCH state lives on the connection, so atomic units never share one.
    async fn checkout(&self) -> Result<MultiplexedConnection, TransactionStoreError> {
        if let Some(conn) = self.watch_connections.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn checkin(&self, conn: MultiplexedConnection) {
        let mut idle = self.watch_connections.lock().await;
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    /// Run `safe_tx` with WATCH/MULTI/EXEC, retrying with exponential backoff
    /// while other writers keep invalidating the watched keys.
    pub(super) async fn execute_with_watch_and_retry<T: SafeRedisTransaction>(
        &self,
        safe_tx: &T,
    ) -> Result<T::OperationResult, TransactionStoreError> {
        let mut conn = self.checkout().await?;
        let result = self.watch_and_retry(&mut conn, safe_tx).await;

        // a connection that failed mid-transaction may still hold a WATCH
        if !matches!(result, Err(TransactionStoreError::RedisError { .. })) {
            self.checkin(conn).await;
        }
        result
    }

    async fn watch_and_retry<T: SafeRedisTransaction>(
        &self,
        conn: &mut MultiplexedConnection,
        safe_tx: &T,
    ) -> Result<T::OperationResult, TransactionStoreError> {
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = conflict_backoff(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    chain_id = self.keys.chain_id,
                    operation = safe_tx.name(),
                    "Watched keys changed, retrying"
                );
                tokio::time::sleep(delay).await;
            }

            if let Some(result) = self.try_once(conn, safe_tx).await? {
                return Ok(result);
            }
        }

        Err(TransactionStoreError::InternalError {
            message: format!(
                "{} on chain {} kept conflicting after {MAX_RETRIES} attempts",
                safe_tx.name(),
                self.keys.chain_id
            ),
        })
    }

    /// One WATCH, validate, EXEC round. `None` means EXEC was aborted.
    async fn try_once<T: SafeRedisTransaction>(
        &self,
        conn: &mut MultiplexedConnection,
        safe_tx: &T,
    ) -> Result<Option<T::OperationResult>, TransactionStoreError> {
        let mut watch = ::redis::cmd("WATCH");
        watch.arg(safe_tx.watch_keys());
        let _: () = watch.query_async(conn).await?;

        let validation_data = match safe_tx.validation(conn).await {
            Ok(data) => data,
            Err(e) => {
                let _: () = ::redis::cmd("UNWATCH").query_async(conn).await?;
                return Err(e);
            }
        };

        let mut pipeline = ::redis::pipe();
        pipeline.atomic();
        let result = safe_tx.operation(&mut pipeline, validation_data);

        let Some(replies) = pipeline.query_async::<Option<Vec<Value>>>(conn).await? else {
            return Ok(None);
        };
        // nothing was queued, so no EXEC cleared the WATCH
        if replies.is_empty() {
            let _: () = ::redis::cmd("UNWATCH").query_async(conn).await?;
        }
        Ok(Some(result))
    }
}

fn conflict_backoff(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS << (attempt - 1).min(6))
}
