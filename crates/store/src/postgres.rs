//! PostgreSQL store.
//!
//! Claims use a single `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP
//! LOCKED) RETURNING` statement: rows locked by another worker are skipped
//! rather than waited on, so concurrent sweepers split a batch between them.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use journey_core::config::DatabaseConfig;
use journey_core::types::{
    ReEntryPolicy, ScheduledMessage, ScheduledPayload, ScheduledStatus, Session, SessionStatus,
    StatusCode, Step, StepKind, Trigger, TriggerType, WorkflowDefinition, WorkflowStatus,
};

use crate::{DefinitionStore, ScheduledMessageStore, SessionStore};

const WORKFLOW_COLUMNS: &str = "id, tenant_id, bot_id, name, status, re_entry_policy, \
     welcome_message, welcome_delay_secs, priority, locked, inactivity_timeout_days, \
     created_at, updated_at";

const STEP_COLUMNS: &str = "id, workflow_id, step_order, config, sent_count";

const TRIGGER_COLUMNS: &str =
    "id, workflow_id, tenant_id, trigger_type, config, is_active, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, tenant_id, workflow_id, conversation_id, user_id, \
     current_step_id, status, answers, started_at, completed_at, last_activity_at, \
     welcome_sent_at, reply_received_at, wait_timeout_at, version";

const SCHEDULED_COLUMNS: &str = "id, tenant_id, session_id, step_id, conversation_id, payload, \
     fire_at, status, claimed_at, sent_at, error, created_at";

const OPEN_STATUSES: &str = "('active', 'waiting_delay', 'awaiting_reply')";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool sized from `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        tracing::info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.url)
            .await
            .context("Failed to connect to database")?;
        tracing::info!(
            max_connections = config.max_connections,
            "Database connected successfully"
        );
        Ok(Self { pool })
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ─── Row mapping ────────────────────────────────────────────────────────

fn parse_code<T: StatusCode>(column: &str, code: &str) -> Result<T> {
    T::from_code(code).ok_or_else(|| anyhow!("Unknown {} value: {}", column, code))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    tenant_id: Uuid,
    bot_id: Uuid,
    name: String,
    status: String,
    re_entry_policy: String,
    welcome_message: Option<String>,
    welcome_delay_secs: i32,
    priority: i32,
    locked: bool,
    inactivity_timeout_days: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for WorkflowDefinition {
    type Error = anyhow::Error;

    fn try_from(row: WorkflowRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            bot_id: row.bot_id,
            name: row.name,
            status: parse_code::<WorkflowStatus>("status", &row.status)?,
            re_entry_policy: parse_code::<ReEntryPolicy>("re_entry_policy", &row.re_entry_policy)?,
            welcome_message: row.welcome_message,
            welcome_delay_secs: to_u32(row.welcome_delay_secs),
            priority: row.priority,
            locked: row.locked,
            inactivity_timeout_days: row.inactivity_timeout_days.map(to_u32),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    workflow_id: Uuid,
    step_order: i32,
    config: Json<StepKind>,
    sent_count: i64,
}

impl From<StepRow> for Step {
    fn from(row: StepRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            order: row.step_order,
            kind: row.config.0,
            sent_count: row.sent_count,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TriggerRow {
    id: Uuid,
    workflow_id: Uuid,
    tenant_id: Uuid,
    trigger_type: String,
    config: Json<serde_json::Value>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TriggerRow> for Trigger {
    type Error = anyhow::Error;

    fn try_from(row: TriggerRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            tenant_id: row.tenant_id,
            trigger_type: parse_code::<TriggerType>("trigger_type", &row.trigger_type)?,
            config: row.config.0,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Workflow joined with one of its triggers.
#[derive(sqlx::FromRow)]
struct TriggerMatchRow {
    #[sqlx(flatten)]
    workflow: WorkflowRow,
    trigger_id: Uuid,
    trigger_tenant_id: Uuid,
    trigger_type: String,
    trigger_config: Json<serde_json::Value>,
    trigger_is_active: bool,
    trigger_created_at: DateTime<Utc>,
    trigger_updated_at: DateTime<Utc>,
}

impl TryFrom<TriggerMatchRow> for (WorkflowDefinition, Trigger) {
    type Error = anyhow::Error;

    fn try_from(row: TriggerMatchRow) -> Result<Self> {
        let workflow = WorkflowDefinition::try_from(row.workflow)?;
        let trigger = Trigger {
            id: row.trigger_id,
            workflow_id: workflow.id,
            tenant_id: row.trigger_tenant_id,
            trigger_type: parse_code::<TriggerType>("trigger_type", &row.trigger_type)?,
            config: row.trigger_config.0,
            is_active: row.trigger_is_active,
            created_at: row.trigger_created_at,
            updated_at: row.trigger_updated_at,
        };
        Ok((workflow, trigger))
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    tenant_id: Uuid,
    workflow_id: Uuid,
    conversation_id: i64,
    user_id: i64,
    current_step_id: Option<Uuid>,
    status: String,
    answers: Json<HashMap<String, serde_json::Value>>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
    welcome_sent_at: Option<DateTime<Utc>>,
    reply_received_at: Option<DateTime<Utc>>,
    wait_timeout_at: Option<DateTime<Utc>>,
    version: i64,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            workflow_id: row.workflow_id,
            conversation_id: row.conversation_id,
            user_id: row.user_id,
            current_step_id: row.current_step_id,
            status: parse_code::<SessionStatus>("status", &row.status)?,
            answers: row.answers.0,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_activity_at: row.last_activity_at,
            welcome_sent_at: row.welcome_sent_at,
            reply_received_at: row.reply_received_at,
            wait_timeout_at: row.wait_timeout_at,
            version: row.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduledRow {
    id: Uuid,
    tenant_id: Uuid,
    session_id: Uuid,
    step_id: Uuid,
    conversation_id: i64,
    payload: Json<ScheduledPayload>,
    fire_at: DateTime<Utc>,
    status: String,
    claimed_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ScheduledRow> for ScheduledMessage {
    type Error = anyhow::Error;

    fn try_from(row: ScheduledRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            session_id: row.session_id,
            step_id: row.step_id,
            conversation_id: row.conversation_id,
            payload: row.payload.0,
            fire_at: row.fire_at,
            status: parse_code::<ScheduledStatus>("status", &row.status)?,
            claimed_at: row.claimed_at,
            sent_at: row.sent_at,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ─── Definitions ────────────────────────────────────────────────────────

#[async_trait]
impl DefinitionStore for PgStore {
    async fn create_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO journey_workflows ({WORKFLOW_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(workflow.id)
        .bind(workflow.tenant_id)
        .bind(workflow.bot_id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(workflow.re_entry_policy.as_str())
        .bind(&workflow.welcome_message)
        .bind(to_i32(workflow.welcome_delay_secs))
        .bind(workflow.priority)
        .bind(workflow.locked)
        .bind(workflow.inactivity_timeout_days.map(to_i32))
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to create workflow")?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>> {
        let row = sqlx::query_as::<Postgres, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM journey_workflows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get workflow")?;
        row.map(WorkflowDefinition::try_from).transpose()
    }

    async fn list_workflows(&self, tenant_id: Uuid) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query_as::<Postgres, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM journey_workflows \
             WHERE tenant_id = $1 ORDER BY created_at DESC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workflows")?;
        convert_all(rows)
    }

    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE journey_workflows
            SET name = $2,
                status = $3,
                re_entry_policy = $4,
                welcome_message = $5,
                welcome_delay_secs = $6,
                priority = $7,
                locked = $8,
                inactivity_timeout_days = $9,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(workflow.re_entry_policy.as_str())
        .bind(&workflow.welcome_message)
        .bind(to_i32(workflow.welcome_delay_secs))
        .bind(workflow.priority)
        .bind(workflow.locked)
        .bind(workflow.inactivity_timeout_days.map(to_i32))
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to update workflow")?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<bool> {
        // Steps, triggers, sessions and their scheduled messages cascade.
        let result = sqlx::query("DELETE FROM journey_workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete workflow")?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_workflows_with_inactivity_timeout(&self) -> Result<Vec<WorkflowDefinition>> {
        let rows = sqlx::query_as::<Postgres, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM journey_workflows \
             WHERE inactivity_timeout_days IS NOT NULL AND inactivity_timeout_days > 0"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workflows with inactivity timeout")?;
        convert_all(rows)
    }

    async fn replace_steps(&self, workflow_id: Uuid, steps: &[Step]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM journey_steps WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete steps")?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO journey_steps (id, workflow_id, step_order, step_type, config, sent_count)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(step.id)
            .bind(workflow_id)
            .bind(step.order)
            .bind(step.kind.step_type().as_str())
            .bind(Json(&step.kind))
            .bind(step.sent_count)
            .execute(&mut *tx)
            .await
            .context("Failed to insert step")?;
        }

        tx.commit().await.context("Failed to commit step replacement")?;
        Ok(())
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<Step>> {
        let rows = sqlx::query_as::<Postgres, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM journey_steps \
             WHERE workflow_id = $1 ORDER BY step_order ASC"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list steps")?;
        Ok(rows.into_iter().map(Step::from).collect())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>> {
        let row = sqlx::query_as::<Postgres, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM journey_steps WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get step")?;
        Ok(row.map(Step::from))
    }

    async fn record_step_sent(&self, step_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE journey_steps SET sent_count = sent_count + 1 WHERE id = $1")
            .bind(step_id)
            .execute(&self.pool)
            .await
            .context("Failed to record step send")?;
        Ok(())
    }

    async fn upsert_trigger(&self, trigger: &Trigger) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        if trigger.is_active {
            sqlx::query(
                r#"
                UPDATE journey_triggers
                SET is_active = FALSE, updated_at = $3
                WHERE workflow_id = $1 AND id <> $2 AND is_active
                "#,
            )
            .bind(trigger.workflow_id)
            .bind(trigger.id)
            .bind(trigger.updated_at)
            .execute(&mut *tx)
            .await
            .context("Failed to deactivate previous trigger")?;
        }

        sqlx::query(&format!(
            "INSERT INTO journey_triggers ({TRIGGER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET \
                trigger_type = EXCLUDED.trigger_type, \
                config = EXCLUDED.config, \
                is_active = EXCLUDED.is_active, \
                updated_at = EXCLUDED.updated_at"
        ))
        .bind(trigger.id)
        .bind(trigger.workflow_id)
        .bind(trigger.tenant_id)
        .bind(trigger.trigger_type.as_str())
        .bind(Json(&trigger.config))
        .bind(trigger.is_active)
        .bind(trigger.created_at)
        .bind(trigger.updated_at)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert trigger")?;

        tx.commit().await.context("Failed to commit trigger upsert")?;
        Ok(())
    }

    async fn list_triggers(&self, workflow_id: Uuid) -> Result<Vec<Trigger>> {
        let rows = sqlx::query_as::<Postgres, TriggerRow>(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM journey_triggers \
             WHERE workflow_id = $1 ORDER BY created_at DESC"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list triggers")?;
        convert_all(rows)
    }

    async fn find_active_triggers(
        &self,
        tenant_id: Uuid,
        trigger_type: TriggerType,
    ) -> Result<Vec<(WorkflowDefinition, Trigger)>> {
        let rows = sqlx::query_as::<Postgres, TriggerMatchRow>(
            r#"
            SELECT
                w.id, w.tenant_id, w.bot_id, w.name, w.status, w.re_entry_policy,
                w.welcome_message, w.welcome_delay_secs, w.priority, w.locked,
                w.inactivity_timeout_days, w.created_at, w.updated_at,
                t.id AS trigger_id,
                t.tenant_id AS trigger_tenant_id,
                t.trigger_type,
                t.config AS trigger_config,
                t.is_active AS trigger_is_active,
                t.created_at AS trigger_created_at,
                t.updated_at AS trigger_updated_at
            FROM journey_triggers t
            JOIN journey_workflows w ON w.id = t.workflow_id
            WHERE t.tenant_id = $1
                AND t.trigger_type = $2
                AND t.is_active
                AND w.status = 'active'
            ORDER BY w.priority DESC, w.created_at DESC
            "#,
        )
        .bind(tenant_id)
        .bind(trigger_type.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to find active triggers")?;
        convert_all(rows)
    }
}

// ─── Sessions ───────────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO journey_sessions ({SESSION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(session.id)
        .bind(session.tenant_id)
        .bind(session.workflow_id)
        .bind(session.conversation_id)
        .bind(session.user_id)
        .bind(session.current_step_id)
        .bind(session.status.as_str())
        .bind(Json(&session.answers))
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.last_activity_at)
        .bind(session.welcome_sent_at)
        .bind(session.reply_received_at)
        .bind(session.wait_timeout_at)
        .bind(session.version)
        .execute(&self.pool)
        .await
        .context("Failed to insert session")?;
        Ok(())
    }

    async fn save_session(&self, session: &Session) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE journey_sessions
            SET current_step_id = $3,
                status = $4,
                answers = $5,
                completed_at = $6,
                last_activity_at = $7,
                welcome_sent_at = $8,
                reply_received_at = $9,
                wait_timeout_at = $10,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(session.id)
        .bind(session.version)
        .bind(session.current_step_id)
        .bind(session.status.as_str())
        .bind(Json(&session.answers))
        .bind(session.completed_at)
        .bind(session.last_activity_at)
        .bind(session.welcome_sent_at)
        .bind(session.reply_received_at)
        .bind(session.wait_timeout_at)
        .execute(&self.pool)
        .await
        .context("Failed to save session")?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query_as::<Postgres, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM journey_sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to get session")?;
        row.map(Session::try_from).transpose()
    }

    async fn find_open_session(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
        user_id: i64,
    ) -> Result<Option<Session>> {
        let row = sqlx::query_as::<Postgres, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM journey_sessions \
             WHERE tenant_id = $1 AND workflow_id = $2 AND user_id = $3 \
                AND status IN {OPEN_STATUSES} \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to find open session")?;
        row.map(Session::try_from).transpose()
    }

    async fn find_sessions_in_status(
        &self,
        tenant_id: Uuid,
        conversation_id: i64,
        user_id: i64,
        status: SessionStatus,
    ) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<Postgres, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM journey_sessions \
             WHERE tenant_id = $1 AND conversation_id = $2 AND user_id = $3 AND status = $4 \
             ORDER BY last_activity_at DESC"
        ))
        .bind(tenant_id)
        .bind(conversation_id)
        .bind(user_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to find sessions by status")?;
        convert_all(rows)
    }

    async fn list_sessions(
        &self,
        tenant_id: Uuid,
        workflow_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<Postgres, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM journey_sessions \
             WHERE tenant_id = $1 AND ($2::uuid IS NULL OR workflow_id = $2) \
             ORDER BY started_at DESC LIMIT $3"
        ))
        .bind(tenant_id)
        .bind(workflow_id)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list sessions")?;
        convert_all(rows)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE journey_sessions
            SET status = $3, last_activity_at = $4, version = version + 1
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to update session status")?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_expired_waits(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<Postgres, SessionRow>(&format!(
            "UPDATE journey_sessions SET wait_timeout_at = NULL, version = version + 1 \
             WHERE id IN ( \
                SELECT id FROM journey_sessions \
                WHERE status = 'awaiting_reply' AND wait_timeout_at <= $1 \
                ORDER BY wait_timeout_at \
                LIMIT $2 \
                FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(now)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim expired waits")?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_stale_delays(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<Postgres, SessionRow>(&format!(
            "UPDATE journey_sessions \
             SET status = 'active', last_activity_at = $2, version = version + 1 \
             WHERE id IN ( \
                SELECT s.id FROM journey_sessions s \
                WHERE s.status = 'waiting_delay' \
                    AND s.last_activity_at <= $1 \
                    AND NOT EXISTS ( \
                        SELECT 1 FROM journey_scheduled_messages m \
                        WHERE m.session_id = s.id \
                            AND m.status IN ('pending', 'processing') \
                    ) \
                ORDER BY s.last_activity_at \
                LIMIT $3 \
                FOR UPDATE SKIP LOCKED \
             ) \
             AND status = 'waiting_delay' \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(cutoff)
        .bind(now)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim stale delayed sessions")?;
        convert_all(rows)
    }

    async fn break_inactive_sessions(
        &self,
        workflow_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(&format!(
            "UPDATE journey_sessions SET status = 'broken', version = version + 1 \
             WHERE workflow_id = $1 AND status IN {OPEN_STATUSES} AND last_activity_at < $2 \
             RETURNING id"
        ))
        .bind(workflow_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to break inactive sessions")?;
        Ok(ids)
    }
}

// ─── Scheduled messages ─────────────────────────────────────────────────

#[async_trait]
impl ScheduledMessageStore for PgStore {
    async fn insert_scheduled(&self, message: &ScheduledMessage) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO journey_scheduled_messages ({SCHEDULED_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(message.id)
        .bind(message.tenant_id)
        .bind(message.session_id)
        .bind(message.step_id)
        .bind(message.conversation_id)
        .bind(Json(&message.payload))
        .bind(message.fire_at)
        .bind(message.status.as_str())
        .bind(message.claimed_at)
        .bind(message.sent_at)
        .bind(&message.error)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert scheduled message")?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn claim_due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<Postgres, ScheduledRow>(&format!(
            "UPDATE journey_scheduled_messages SET status = 'processing', claimed_at = $1 \
             WHERE id IN ( \
                SELECT id FROM journey_scheduled_messages \
                WHERE status = 'pending' AND fire_at <= $1 \
                ORDER BY fire_at \
                LIMIT $2 \
                FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {SCHEDULED_COLUMNS}"
        ))
        .bind(now)
        .bind(to_i64(limit))
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim due scheduled messages")?;
        convert_all(rows)
    }

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE journey_scheduled_messages SET status = 'sent', sent_at = $2, error = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to mark scheduled message sent")?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, _now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE journey_scheduled_messages SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .context("Failed to mark scheduled message failed")?;
        Ok(())
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE journey_scheduled_messages SET status = 'cancelled' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark scheduled message cancelled")?;
        Ok(())
    }

    async fn cancel_pending_for_session(&self, session_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE journey_scheduled_messages SET status = 'cancelled' \
             WHERE session_id = $1 AND status = 'pending'",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("Failed to cancel pending scheduled messages")?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn reconcile_expired_claims(
        &self,
        lease_cutoff: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE journey_scheduled_messages
            SET status = 'failed', error = 'processing lease expired'
            WHERE status = 'processing' AND claimed_at < $1
            "#,
        )
        .bind(lease_cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to reconcile expired claims")?;
        Ok(result.rows_affected())
    }

    async fn list_for_session(&self, session_id: Uuid) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<Postgres, ScheduledRow>(&format!(
            "SELECT {SCHEDULED_COLUMNS} FROM journey_scheduled_messages \
             WHERE session_id = $1 ORDER BY created_at ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list scheduled messages")?;
        convert_all(rows)
    }
}
