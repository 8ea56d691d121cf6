//! Storage collaborators consumed by the workflow engine.
//!
//! The engine never talks to a database directly. It reads instances through
//! [`InstanceRepository`], reads history through [`HistoryRepository`], and
//! writes every transition inside a [`Transaction`] obtained from a
//! [`TransactionManager`].
//!
//! [`InstanceRepository::update_status`] and [`HistoryRepository::create`]
//! write outside any transaction. They serve collaborators that own their
//! own consistency, such as imports and admin corrections, and the engine
//! never calls them. After such a write, call
//! [`WorkflowEngine::invalidate`](crate::WorkflowEngine::invalidate) so a
//! cached machine does not outlive its status.
//!
//! Two implementations ship with the crate:
//!
//! - [`testing::InMemoryStore`](crate::testing::InMemoryStore) (feature `testing`)
//! - [`PgStore`] (feature `postgres`), backed by `sqlx`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::Context;
use crate::error::{ParseStateError, RepositoryError};
use crate::states::{State, Trigger};

/// An approval instance as stored.
///
/// `status` is kept as the raw stored string; [`ApprovalInstance::state`]
/// parses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct ApprovalInstance {
    pub id: i64,
    pub external_instance_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalInstance {
    pub fn new(id: i64, external_instance_id: impl Into<String>, status: State) -> Self {
        let now = Utc::now();
        Self {
            id,
            external_instance_id: external_instance_id.into(),
            status: status.as_str().to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> Result<State, ParseStateError> {
        self.status.parse()
    }
}

/// A history row to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewApprovalHistory {
    pub instance_id: i64,
    pub reviewer_id: String,
    pub previous_status: String,
    pub new_status: String,
    pub action_type: String,
    pub action_data: Value,
    pub created_at: DateTime<Utc>,
}

impl NewApprovalHistory {
    /// History record for a state change caused by `trigger`.
    pub fn transition(
        instance_id: i64,
        actor: impl Into<String>,
        from: State,
        to: State,
        trigger: Trigger,
    ) -> Self {
        Self {
            instance_id,
            reviewer_id: actor.into(),
            previous_status: from.as_str().to_string(),
            new_status: to.as_str().to_string(),
            action_type: trigger.as_str().to_string(),
            action_data: json!({ "trigger": trigger.as_str() }),
            created_at: Utc::now(),
        }
    }
}

/// A stored history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct ApprovalHistory {
    pub id: i64,
    pub instance_id: i64,
    pub reviewer_id: String,
    pub previous_status: String,
    pub new_status: String,
    pub action_type: String,
    pub action_data: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Fails with [`RepositoryError::NotFound`] when no row has this id.
    async fn get_by_id(&self, id: i64) -> Result<ApprovalInstance, RepositoryError>;

    async fn get_by_external_id(
        &self,
        external_instance_id: &str,
    ) -> Result<Option<ApprovalInstance>, RepositoryError>;

    /// Write `status` immediately, outside any transaction. No history row
    /// is recorded; transitions go through [`Transaction::update_status`].
    async fn update_status(&self, id: i64, status: State) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Append `record` immediately, outside any transaction.
    async fn create(&self, record: &NewApprovalHistory) -> Result<(), RepositoryError>;

    /// History of one instance, oldest first.
    async fn list_for_instance(&self, instance_id: i64)
        -> Result<Vec<ApprovalHistory>, RepositoryError>;
}

/// A unit of work. Writes become visible only after [`Transaction::commit`].
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait Transaction: Send {
    async fn update_status(&mut self, id: i64, status: State) -> Result<(), RepositoryError>;

    async fn create_history(&mut self, record: &NewApprovalHistory)
        -> Result<(), RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction>, RepositoryError>;
}

// =============================================================================
// Postgres
// =============================================================================

#[cfg(feature = "postgres")]
pub use postgres::PgStore;

#[cfg(feature = "postgres")]
mod postgres {
    use async_trait::async_trait;
    use sqlx::{PgPool, Postgres};
    use tracing::debug;

    use super::*;

    /// `sqlx` implementation of every storage collaborator.
    ///
    /// Expects these tables:
    ///
    /// ```sql
    /// CREATE TABLE approval_instances (
    ///     id                   BIGSERIAL PRIMARY KEY,
    ///     external_instance_id TEXT NOT NULL UNIQUE,
    ///     status               TEXT NOT NULL,
    ///     created_at           TIMESTAMPTZ NOT NULL DEFAULT now(),
    ///     updated_at           TIMESTAMPTZ NOT NULL DEFAULT now()
    /// );
    ///
    /// CREATE TABLE approval_history (
    ///     id              BIGSERIAL PRIMARY KEY,
    ///     instance_id     BIGINT NOT NULL REFERENCES approval_instances(id),
    ///     reviewer_id     TEXT NOT NULL,
    ///     previous_status TEXT NOT NULL,
    ///     new_status      TEXT NOT NULL,
    ///     action_type     TEXT NOT NULL,
    ///     action_data     JSONB NOT NULL DEFAULT '{}',
    ///     created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    /// );
    /// ```
    #[derive(Debug, Clone)]
    pub struct PgStore {
        pool: PgPool,
    }

    impl PgStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub fn pool(&self) -> &PgPool {
            &self.pool
        }
    }

    const UPDATE_STATUS: &str =
        "UPDATE approval_instances SET status = $2, updated_at = now() WHERE id = $1";

    const INSERT_HISTORY: &str = r#"
        INSERT INTO approval_history
            (instance_id, reviewer_id, previous_status, new_status, action_type, action_data, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
    "#;

    fn bind_history<'q>(
        record: &'q NewApprovalHistory,
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        sqlx::query(INSERT_HISTORY)
            .bind(record.instance_id)
            .bind(&record.reviewer_id)
            .bind(&record.previous_status)
            .bind(&record.new_status)
            .bind(&record.action_type)
            .bind(&record.action_data)
            .bind(record.created_at)
    }

    fn not_found_if_untouched(rows: u64, id: i64) -> Result<(), RepositoryError> {
        if rows == 0 {
            return Err(RepositoryError::NotFound(format!("instance {}", id)));
        }
        Ok(())
    }

    #[async_trait]
    impl InstanceRepository for PgStore {
        async fn get_by_id(&self, id: i64) -> Result<ApprovalInstance, RepositoryError> {
            sqlx::query_as::<_, ApprovalInstance>(
                "SELECT * FROM approval_instances WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {}", id)))
        }

        async fn get_by_external_id(
            &self,
            external_instance_id: &str,
        ) -> Result<Option<ApprovalInstance>, RepositoryError> {
            sqlx::query_as::<_, ApprovalInstance>(
                "SELECT * FROM approval_instances WHERE external_instance_id = $1",
            )
            .bind(external_instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
        }

        async fn update_status(&self, id: i64, status: State) -> Result<(), RepositoryError> {
            let result = sqlx::query(UPDATE_STATUS)
                .bind(id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;
            not_found_if_untouched(result.rows_affected(), id)
        }
    }

    #[async_trait]
    impl HistoryRepository for PgStore {
        async fn create(&self, record: &NewApprovalHistory) -> Result<(), RepositoryError> {
            bind_history(record).execute(&self.pool).await?;
            Ok(())
        }

        async fn list_for_instance(
            &self,
            instance_id: i64,
        ) -> Result<Vec<ApprovalHistory>, RepositoryError> {
            sqlx::query_as::<_, ApprovalHistory>(
                "SELECT * FROM approval_history WHERE instance_id = $1 ORDER BY created_at, id",
            )
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
        }
    }

    struct PgTransaction {
        tx: sqlx::Transaction<'static, Postgres>,
    }

    #[async_trait]
    impl Transaction for PgTransaction {
        async fn update_status(&mut self, id: i64, status: State) -> Result<(), RepositoryError> {
            let result = sqlx::query(UPDATE_STATUS)
                .bind(id)
                .bind(status.as_str())
                .execute(&mut *self.tx)
                .await?;
            not_found_if_untouched(result.rows_affected(), id)
        }

        async fn create_history(
            &mut self,
            record: &NewApprovalHistory,
        ) -> Result<(), RepositoryError> {
            bind_history(record).execute(&mut *self.tx).await?;
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
            self.tx.commit().await?;
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
            self.tx.rollback().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl TransactionManager for PgStore {
        async fn begin(&self, _ctx: &Context) -> Result<Box<dyn Transaction>, RepositoryError> {
            let tx = self.pool.begin().await?;
            debug!("transaction started");
            Ok(Box::new(PgTransaction { tx }))
        }
    }
}
