use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    CorrelationId, InstanceQuery, Payload, Result, SagaInstance, SagaState, StateCount,
    StoreError, Version,
    store::{InsertOutcome, InstanceStore, validate_insert_version, validate_update_version},
};

const SELECT_COLUMNS: &str = "SELECT correlation_id, process_type, current_state, payload, \
     completed_steps, compensated_steps, abandoned_compensations, failure_reason, attempt, \
     version, deadline_at, created_at, updated_at FROM saga_instances";

/// PostgreSQL-backed instance store implementation.
///
/// Conditional writes are expressed as `UPDATE .. WHERE version = $expected`;
/// creation relies on the primary key with `ON CONFLICT DO NOTHING`.
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

impl PostgresInstanceStore {
    /// Creates a new PostgreSQL instance store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        let payload: Payload =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("payload")?)?;
        let attempt: i32 = row.try_get("attempt")?;

        Ok(SagaInstance {
            correlation_id: CorrelationId::new(row.try_get::<String, _>("correlation_id")?),
            process_type: row.try_get("process_type")?,
            current_state: SagaState::parse(&row.try_get::<String, _>("current_state")?),
            payload,
            completed_steps: row.try_get("completed_steps")?,
            compensated_steps: row.try_get("compensated_steps")?,
            abandoned_compensations: row.try_get("abandoned_compensations")?,
            failure_reason: row.try_get("failure_reason")?,
            attempt: u32::try_from(attempt).unwrap_or_default(),
            version: Version::new(row.try_get("version")?),
            deadline_at: row.try_get::<Option<DateTime<Utc>>, _>("deadline_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn terminal_states() -> Vec<String> {
        SagaState::terminal_names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    }
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    async fn insert_if_absent(&self, instance: &SagaInstance) -> Result<InsertOutcome> {
        validate_insert_version(instance)?;

        let result = sqlx::query(
            r#"
            INSERT INTO saga_instances (
                correlation_id, process_type, current_state, payload, completed_steps,
                compensated_steps, abandoned_compensations, failure_reason, attempt,
                version, deadline_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(instance.correlation_id.as_str())
        .bind(&instance.process_type)
        .bind(instance.current_state.name())
        .bind(serde_json::Value::Object(instance.payload.clone()))
        .bind(&instance.completed_steps)
        .bind(&instance.compensated_steps)
        .bind(&instance.abandoned_compensations)
        .bind(&instance.failure_reason)
        .bind(i32::try_from(instance.attempt).unwrap_or(i32::MAX))
        .bind(instance.version.as_i64())
        .bind(instance.deadline_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn get(&self, correlation_id: &CorrelationId) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE correlation_id = $1"))
            .bind(correlation_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn update(&self, instance: &SagaInstance, expected_version: Version) -> Result<Version> {
        validate_update_version(instance, expected_version)?;

        let result = sqlx::query(
            r#"
            UPDATE saga_instances SET
                current_state = $2,
                payload = $3,
                completed_steps = $4,
                compensated_steps = $5,
                abandoned_compensations = $6,
                failure_reason = $7,
                attempt = $8,
                version = $9,
                deadline_at = $10,
                updated_at = $11
            WHERE correlation_id = $1 AND version = $12
            "#,
        )
        .bind(instance.correlation_id.as_str())
        .bind(instance.current_state.name())
        .bind(serde_json::Value::Object(instance.payload.clone()))
        .bind(&instance.completed_steps)
        .bind(&instance.compensated_steps)
        .bind(&instance.abandoned_compensations)
        .bind(&instance.failure_reason)
        .bind(i32::try_from(instance.attempt).unwrap_or(i32::MAX))
        .bind(instance.version.as_i64())
        .bind(instance.deadline_at)
        .bind(instance.updated_at)
        .bind(expected_version.as_i64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(instance.version);
        }

        // Nothing matched: either the record is gone or someone else wrote first.
        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE correlation_id = $1")
                .bind(instance.correlation_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match actual {
            None => Err(StoreError::NotFound(instance.correlation_id.clone())),
            Some(actual) => {
                tracing::debug!(
                    correlation_id = %instance.correlation_id,
                    expected = %expected_version,
                    actual,
                    "version check failed"
                );
                Err(StoreError::ConcurrencyConflict {
                    correlation_id: instance.correlation_id.clone(),
                    expected: expected_version,
                    actual: Version::new(actual),
                })
            }
        }
    }

    async fn query(&self, query: InstanceQuery) -> Result<Vec<SagaInstance>> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.process_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND process_type = ${param_count}"));
        }
        if query.state.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND current_state = ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, correlation_id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(process_type) = query.process_type {
            sqlx_query = sqlx_query.bind(process_type);
        }
        if let Some(state) = query.state {
            sqlx_query = sqlx_query.bind(state.name());
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_instance).collect()
    }

    async fn count_by_state(&self, process_type: &str) -> Result<Vec<StateCount>> {
        let rows = sqlx::query(
            r#"
            SELECT current_state, COUNT(*) AS count
            FROM saga_instances
            WHERE process_type = $1
            GROUP BY current_state
            ORDER BY current_state ASC
            "#,
        )
        .bind(process_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StateCount {
                    state: row.try_get("current_state")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn find_pending_deadlines(&self) -> Result<Vec<SagaInstance>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE deadline_at IS NOT NULL \
             AND NOT (current_state = ANY($1)) ORDER BY deadline_at ASC"
        ))
        .bind(Self::terminal_states())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_instance).collect()
    }
}
