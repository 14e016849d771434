//! Persistence for workflow definitions, sessions and scheduled messages.
//!
//! The engine only talks to the three store traits. Two backends implement
//! all of them: [`MemoryStore`] (process-local, used by tests and demos) and
//! [`PgStore`] (PostgreSQL, durable across restarts).
//!
//! Every `claim_*` method is an atomic conditional transition: when several
//! workers race for the same row, exactly one of them receives it.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use journey_core::types::{
    ScheduledMessage, Session, SessionStatus, Step, Trigger, TriggerType, WorkflowDefinition,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Workflow definitions with their steps and triggers.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn create_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>>;

    async fn list_workflows(&self, tenant_id: Uuid) -> Result<Vec<WorkflowDefinition>>;

    /// Returns `false` when the workflow does not exist.
    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<bool>;

    /// Deletes the workflow together with its steps, triggers, sessions and
    /// scheduled messages. Returns `false` when it did not exist.
    async fn delete_workflow(&self, id: Uuid) -> Result<bool>;

    /// Workflows that configure an inactivity timeout.
    async fn list_workflows_with_inactivity_timeout(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Deletes every step of the workflow and inserts `steps` in one unit.
    async fn replace_steps(&self, workflow_id: Uuid, steps: &[Step]) -> Result<()>;

    /// Steps ordered by ascending `order`.
    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<Step>>;

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>>;

    /// Increments the step's send counter.
    async fn record_step_sent(&self, step_id: Uuid) -> Result<()>;

    /// Inserts or updates a trigger. When the trigger is active, every other
    /// active trigger of the same workflow is deactivated in the same unit.
    async fn upsert_trigger(&self, trigger: &Trigger) -> Result<()>;

    async fn list_triggers(&self, workflow_id: Uuid) -> Result<Vec<Trigger>>;

    /// Active workflows of the tenant that have an active trigger of the
    /// given type, ordered by priority (highest first) then newest first.
    async fn find_active_triggers(
        &self,
        tenant_id: Uuid,
        trigger_type: TriggerType,
    ) -> Result<Vec<(WorkflowDefinition, Trigger)>>;
}

/// Per-user execution records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<()>;

    /// Writes `session` only if the stored version still equals
    /// `session.version`, then bumps the stored version. Returns false when
    /// another writer got there first or the session no longer exists.
    async fn save_session(&self, session: &Session) -> Result<bool>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>>;

    /// The user's non-terminal session in the workflow, if any.
    async fn find_open_session(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
        user_id: i64,
    ) -> Result<Option<Session>>;

    /// Sessions of the user in the conversation with `status`, most
    /// recently active first.
    async fn find_sessions_in_status(
        &self,
        tenant_id: Uuid,
        conversation_id: i64,
        user_id: i64,
        status: SessionStatus,
    ) -> Result<Vec<Session>>;

    async fn list_sessions(
        &self,
        tenant_id: Uuid,
        workflow_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Session>>;

    /// Moves the session from `from` to `to` only if it is still in `from`.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Claims `awaiting_reply` sessions whose deadline is at or before `now`
    /// by clearing the deadline.
    async fn claim_expired_waits(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Session>>;

    /// Claims `waiting_delay` sessions idle since `cutoff` that have no
    /// pending or processing scheduled message, moving them to `active`.
    async fn claim_stale_delays(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Session>>;

    /// Marks the workflow's non-terminal sessions idle since before `cutoff`
    /// as `broken` and returns their ids.
    async fn break_inactive_sessions(
        &self,
        workflow_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;
}

/// Durable "continue this session at time T" jobs.
#[async_trait]
pub trait ScheduledMessageStore: Send + Sync {
    async fn insert_scheduled(&self, message: &ScheduledMessage) -> Result<()>;

    /// Claims up to `limit` due `pending` rows, moving them to `processing`.
    async fn claim_due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>>;

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;

    async fn mark_cancelled(&self, id: Uuid) -> Result<()>;

    /// Cancels the session's `pending` rows. Rows already claimed are left alone.
    async fn cancel_pending_for_session(&self, session_id: Uuid) -> Result<u64>;

    /// Fails `processing` rows claimed before `lease_cutoff`.
    async fn reconcile_expired_claims(
        &self,
        lease_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn list_for_session(&self, session_id: Uuid) -> Result<Vec<ScheduledMessage>>;
}

/// The three stores the engine and sweeper work against.
#[derive(Clone)]
pub struct Stores {
    pub definitions: Arc<dyn DefinitionStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub scheduled: Arc<dyn ScheduledMessageStore>,
}

impl Stores {
    /// Uses one backend for all three stores.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: DefinitionStore + SessionStore + ScheduledMessageStore + 'static,
    {
        Self {
            definitions: backend.clone(),
            sessions: backend.clone(),
            scheduled: backend,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
