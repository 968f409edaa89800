// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL implementation of the [`Store`] trait.
//!
//! Entities are stored as JSONB documents alongside the columns the
//! runtime queries on. The task-claim primitive is a single conditional
//! `UPDATE … RETURNING`, which is what makes at-most-one-claim hold
//! across worker processes.

use crate::models::{
    FlowRecord, PublishedSourceRecord, RunnerRecord, StepRecord, TaskRecord, TaskState,
    WorkflowRecord, now_ms, EXECUTE_TASK_NAME,
};
use crate::traits::{ChangeSet, Store, StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// PostgreSQL-backed document store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with pooling and apply migrations.
    pub async fn new(
        database_url: impl AsRef<str>,
        max_connections: Option<u32>,
    ) -> StoreResult<Self> {
        let max_conn = max_connections.unwrap_or(10);

        info!(max_connections = max_conn, "Initializing PostgreSQL store");

        let pool = PgPoolOptions::new()
            .max_connections(max_conn)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Some(Duration::from_secs(300)))
            .connect(database_url.as_ref())
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create connection pool: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Apply the schema migration.
    async fn run_migrations(&self) -> StoreResult<()> {
        let migration = include_str!("../migrations/001_initial_schema.sql");
        sqlx::raw_sql(migration)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// The underlying pool, for advanced use.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_task(row: &PgRow) -> StoreResult<TaskRecord> {
        let state_text: String = row.try_get("state")?;
        let data: Value = row.try_get("data")?;
        let result: Option<Value> = row.try_get("result")?;

        Ok(TaskRecord {
            task_id: row.try_get("id")?,
            name: row.try_get("name")?,
            runner_id: row.try_get("runner_id")?,
            workflow_id: row.try_get("workflow_id")?,
            flow_id: row.try_get("flow_id")?,
            step_id: row.try_get("step_id")?,
            state: TaskState::from_str(&state_text).map_err(StoreError::Serialization)?,
            created: row.try_get("created")?,
            updated: row.try_get("updated")?,
            lease_expiry: row.try_get("lease_expiry")?,
            claimed_by: row.try_get("claimed_by")?,
            task_list_name: row.try_get("task_list_name")?,
            data: value_to_map(data)?,
            result: result.map(value_to_map).transpose()?,
            error: row.try_get("error")?,
        })
    }

    fn row_to_step(row: &PgRow) -> StoreResult<StepRecord> {
        let doc: Value = row.try_get("doc")?;
        let mut step: StepRecord = serde_json::from_value(doc)?;
        // The column is authoritative for optimistic concurrency.
        step.seq = row.try_get("seq")?;
        Ok(step)
    }

    async fn insert_step(&self, step: &StepRecord) -> StoreResult<bool> {
        let doc = serde_json::to_value(step)?;
        let result = sqlx::query(
            r#"
            INSERT INTO afl_steps
                (id, runner_id, workflow_id, block_id, container_id,
                 statement_id, is_block, state, seq, doc, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(step.step_id)
        .bind(step.runner_id)
        .bind(step.workflow_id)
        .bind(step.block_id)
        .bind(step.container_id)
        .bind(&step.statement_id)
        .bind(step.is_block())
        .bind(step.state.to_string())
        .bind(step.seq)
        .bind(doc)
        .bind(step.created)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_step_guarded(&self, step: &StepRecord) -> StoreResult<()> {
        let mut next = step.clone();
        next.seq = step.seq + 1;
        let doc = serde_json::to_value(&next)?;

        let result = sqlx::query(
            r#"
            UPDATE afl_steps
            SET doc = $1, state = $2, seq = seq + 1
            WHERE id = $3 AND seq = $4
            "#,
        )
        .bind(doc)
        .bind(step.state.to_string())
        .bind(step.step_id)
        .bind(step.seq)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "step {} was modified concurrently",
                step.step_id
            )));
        }
        Ok(())
    }

    async fn query_steps(&self, sql: &str, id: Uuid) -> StoreResult<Vec<StepRecord>> {
        let rows = sqlx::query(sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_step).collect()
    }

    /// Insert a task, leaving any existing record untouched. Change-set
    /// re-application must not overwrite a task that has since been
    /// leased or completed.
    async fn insert_task_if_absent(&self, task: &TaskRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO afl_tasks
                (id, name, runner_id, workflow_id, flow_id, step_id, state,
                 created, updated, lease_expiry, claimed_by, task_list_name,
                 data, result, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(task.task_id)
        .bind(&task.name)
        .bind(task.runner_id)
        .bind(task.workflow_id)
        .bind(task.flow_id)
        .bind(task.step_id)
        .bind(task.state.to_string())
        .bind(task.created)
        .bind(task.updated)
        .bind(task.lease_expiry)
        .bind(&task.claimed_by)
        .bind(&task.task_list_name)
        .bind(Value::Object(task.data.clone()))
        .bind(task.result.clone().map(Value::Object))
        .bind(&task.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn value_to_map(value: Value) -> StoreResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(StoreError::Serialization(format!(
            "expected JSON object, got {other}"
        ))),
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn save_flow(&self, flow: &FlowRecord) -> StoreResult<()> {
        let doc = serde_json::to_value(flow)?;
        sqlx::query(
            r#"
            INSERT INTO afl_flows (id, doc, created) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(flow.flow_id)
        .bind(doc)
        .bind(flow.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_flow(&self, flow_id: Uuid) -> StoreResult<Option<FlowRecord>> {
        let row = sqlx::query("SELECT doc FROM afl_flows WHERE id = $1")
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let doc: Value = r.try_get("doc")?;
            Ok(serde_json::from_value(doc)?)
        })
        .transpose()
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> StoreResult<()> {
        let doc = serde_json::to_value(workflow)?;
        sqlx::query(
            r#"
            INSERT INTO afl_workflows (id, flow_id, doc, created) VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(workflow.workflow_id)
        .bind(workflow.flow_id)
        .bind(doc)
        .bind(workflow.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> StoreResult<Option<WorkflowRecord>> {
        let row = sqlx::query("SELECT doc FROM afl_workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let doc: Value = r.try_get("doc")?;
            Ok(serde_json::from_value(doc)?)
        })
        .transpose()
    }

    async fn save_runner(&self, runner: &RunnerRecord) -> StoreResult<()> {
        let doc = serde_json::to_value(runner)?;
        sqlx::query(
            r#"
            INSERT INTO afl_runners (id, workflow_id, state, doc, created)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, doc = EXCLUDED.doc
            "#,
        )
        .bind(runner.runner_id)
        .bind(runner.workflow_id)
        .bind(runner.state.to_string())
        .bind(doc)
        .bind(runner.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_runner(&self, runner_id: Uuid) -> StoreResult<Option<RunnerRecord>> {
        let row = sqlx::query("SELECT doc FROM afl_runners WHERE id = $1")
            .bind(runner_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let doc: Value = r.try_get("doc")?;
            Ok(serde_json::from_value(doc)?)
        })
        .transpose()
    }

    async fn list_runners(&self) -> StoreResult<Vec<RunnerRecord>> {
        let rows = sqlx::query("SELECT doc FROM afl_runners ORDER BY created")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let doc: Value = r.try_get("doc")?;
                Ok(serde_json::from_value(doc)?)
            })
            .collect()
    }

    async fn save_step(&self, step: &StepRecord) -> StoreResult<()> {
        if !self.insert_step(step).await? {
            let doc = serde_json::to_value(step)?;
            sqlx::query("UPDATE afl_steps SET doc = $1, state = $2, seq = $3 WHERE id = $4")
                .bind(doc)
                .bind(step.state.to_string())
                .bind(step.seq)
                .bind(step.step_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn get_step(&self, step_id: Uuid) -> StoreResult<Option<StepRecord>> {
        let row = sqlx::query("SELECT doc, seq FROM afl_steps WHERE id = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_step).transpose()
    }

    async fn get_steps_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        self.query_steps(
            "SELECT doc, seq FROM afl_steps WHERE runner_id = $1 ORDER BY created, id",
            runner_id,
        )
        .await
    }

    async fn get_steps_by_workflow(&self, workflow_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        self.query_steps(
            "SELECT doc, seq FROM afl_steps WHERE workflow_id = $1 ORDER BY created, id",
            workflow_id,
        )
        .await
    }

    async fn get_steps_by_block(&self, block_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        self.query_steps(
            "SELECT doc, seq FROM afl_steps WHERE block_id = $1 ORDER BY created, id",
            block_id,
        )
        .await
    }

    async fn get_blocks_by_step(&self, container_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        self.query_steps(
            "SELECT doc, seq FROM afl_steps WHERE container_id = $1 AND is_block ORDER BY created, id",
            container_id,
        )
        .await
    }

    async fn step_exists(&self, statement_id: &str, block_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM afl_steps WHERE block_id = $1 AND statement_id = $2 LIMIT 1",
        )
        .bind(block_id)
        .bind(statement_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn block_step_exists(&self, statement_id: &str, container_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM afl_steps
            WHERE container_id = $1 AND statement_id = $2 AND is_block
            LIMIT 1
            "#,
        )
        .bind(container_id)
        .bind(statement_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn save_task(&self, task: &TaskRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO afl_tasks
                (id, name, runner_id, workflow_id, flow_id, step_id, state,
                 created, updated, lease_expiry, claimed_by, task_list_name,
                 data, result, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                updated = EXCLUDED.updated,
                lease_expiry = EXCLUDED.lease_expiry,
                claimed_by = EXCLUDED.claimed_by,
                result = EXCLUDED.result,
                error = EXCLUDED.error
            "#,
        )
        .bind(task.task_id)
        .bind(&task.name)
        .bind(task.runner_id)
        .bind(task.workflow_id)
        .bind(task.flow_id)
        .bind(task.step_id)
        .bind(task.state.to_string())
        .bind(task.created)
        .bind(task.updated)
        .bind(task.lease_expiry)
        .bind(&task.claimed_by)
        .bind(&task.task_list_name)
        .bind(Value::Object(task.data.clone()))
        .bind(task.result.clone().map(Value::Object))
        .bind(&task.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM afl_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn get_tasks_by_step(&self, step_id: Uuid) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM afl_tasks WHERE step_id = $1 ORDER BY created")
            .bind(step_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_tasks_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM afl_tasks WHERE runner_id = $1 ORDER BY created")
            .bind(runner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn has_pending_execute_task(&self, runner_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS one FROM afl_tasks
            WHERE runner_id = $1 AND name = $2 AND state = 'pending'
            LIMIT 1
            "#,
        )
        .bind(runner_id)
        .bind(EXECUTE_TASK_NAME)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn claim_next_task(
        &self,
        task_list: &str,
        lease: Duration,
        claimer: &str,
    ) -> StoreResult<Option<TaskRecord>> {
        let now = now_ms();
        let expiry = now + lease.as_millis() as i64;

        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT id FROM afl_tasks
                WHERE task_list_name = $1
                  AND (state = 'pending' OR (state = 'leased' AND lease_expiry < $2))
                ORDER BY created
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE afl_tasks t
            SET state = 'leased', lease_expiry = $3, claimed_by = $4, updated = $2
            FROM candidate c
            WHERE t.id = c.id
            RETURNING t.*
            "#,
        )
        .bind(task_list)
        .bind(now)
        .bind(expiry)
        .bind(claimer)
        .fetch_optional(&self.pool)
        .await?;

        let task = row.as_ref().map(Self::row_to_task).transpose()?;
        if let Some(task) = &task {
            debug!(task_id = %task.task_id, name = %task.name, claimer, "Task claimed");
        }
        Ok(task)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        claimer: &str,
        result: Map<String, Value>,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE afl_tasks
            SET state = 'completed', result = $1, updated = $2
            WHERE id = $3 AND state = 'leased' AND claimed_by = $4
            "#,
        )
        .bind(Value::Object(result))
        .bind(now_ms())
        .bind(task_id)
        .bind(claimer)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(task_id));
        }
        Ok(())
    }

    async fn fail_task(&self, task_id: Uuid, claimer: &str, error: &str) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE afl_tasks
            SET state = 'failed', error = $1, updated = $2
            WHERE id = $3 AND state = 'leased' AND claimed_by = $4
            "#,
        )
        .bind(error)
        .bind(now_ms())
        .bind(task_id)
        .bind(claimer)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(task_id));
        }
        Ok(())
    }

    async fn cancel_tasks_by_runner(&self, runner_id: Uuid) -> StoreResult<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE afl_tasks
            SET state = 'cancelled', updated = $1
            WHERE runner_id = $2 AND state IN ('pending', 'leased')
            "#,
        )
        .bind(now_ms())
        .bind(runner_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn apply(&self, changes: &ChangeSet) -> StoreResult<()> {
        // Creations land before guarded updates: a partial commit then
        // leaves parents in their pre-transition state, and the re-driven
        // tick skips the already-created children.
        for created in &changes.created_steps {
            if !self.insert_step(created).await? {
                debug!(
                    statement_id = %created.statement_id,
                    "Skipping duplicate step creation"
                );
            }
        }
        for task in &changes.created_tasks {
            self.insert_task_if_absent(task).await?;
        }
        for updated in &changes.updated_steps {
            self.update_step_guarded(updated).await?;
        }
        if let Some(runner) = &changes.runner {
            self.save_runner(runner).await?;
        }
        Ok(())
    }

    async fn save_published_source(
        &self,
        source: &PublishedSourceRecord,
        force: bool,
    ) -> StoreResult<()> {
        if let Some(existing) = self
            .get_published_source(&source.namespace_name, &source.version)
            .await?
        {
            if existing.content == source.content {
                return Ok(());
            }
            if !force {
                return Err(StoreError::AlreadyPublished(format!(
                    "{}@{}",
                    source.namespace_name, source.version
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO afl_published_sources (id, namespace_name, version, content, created)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (namespace_name, version) DO UPDATE SET content = EXCLUDED.content
            "#,
        )
        .bind(source.id)
        .bind(&source.namespace_name)
        .bind(&source.version)
        .bind(&source.content)
        .bind(source.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_published_source(
        &self,
        namespace_name: &str,
        version: &str,
    ) -> StoreResult<Option<PublishedSourceRecord>> {
        let row = sqlx::query(
            "SELECT * FROM afl_published_sources WHERE namespace_name = $1 AND version = $2",
        )
        .bind(namespace_name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(PublishedSourceRecord {
                id: r.try_get("id")?,
                namespace_name: r.try_get("namespace_name")?,
                version: r.try_get("version")?,
                content: r.try_get("content")?,
                created: r.try_get("created")?,
            })
        })
        .transpose()
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Connects only when `AFL_TEST_DATABASE_URL` is set; otherwise the
    /// test is skipped so the suite stays green without a database.
    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("AFL_TEST_DATABASE_URL").ok()?;
        Some(
            PostgresStore::new(&url, Some(4))
                .await
                .expect("failed to connect to test database"),
        )
    }

    #[tokio::test]
    async fn test_task_claim_round_trip() {
        let Some(store) = test_store().await else {
            return;
        };

        let task = TaskRecord::create(
            "ns.AddOne",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            "pg-test-list",
            Map::new(),
        );
        store.save_task(&task).await.unwrap();

        let claimed = store
            .claim_next_task("pg-test-list", Duration::from_secs(30), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task_id, task.task_id);
        assert_eq!(claimed.state, TaskState::Leased);

        let mut result = Map::new();
        result.insert("output".into(), serde_json::json!(2));
        store
            .complete_task(task.task_id, "w1", result)
            .await
            .unwrap();

        let stored = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Completed);

        // Completing again loses the lease check.
        let err = store
            .complete_task(task.task_id, "w1", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_health_check() {
        let Some(store) = test_store().await else {
            return;
        };
        store.health_check().await.unwrap();
    }
}
