//! Process-local store backed by `DashMap`.
//!
//! Claims re-check the row's state under the entry's write lock before
//! changing it, so concurrent claimants never both win the same row.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use journey_core::types::{
    ScheduledMessage, ScheduledStatus, Session, SessionStatus, Step, Trigger, TriggerType,
    WorkflowDefinition,
};

use crate::{DefinitionStore, ScheduledMessageStore, SessionStore};

#[derive(Clone, Default)]
pub struct MemoryStore {
    workflows: Arc<DashMap<Uuid, WorkflowDefinition>>,
    /// Step sets keyed by workflow id; replaced as a whole.
    steps: Arc<DashMap<Uuid, Vec<Step>>>,
    /// Triggers keyed by workflow id.
    triggers: Arc<DashMap<Uuid, Vec<Trigger>>>,
    sessions: Arc<DashMap<Uuid, Session>>,
    scheduled: Arc<DashMap<Uuid, ScheduledMessage>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("workflows", &self.workflows.len())
            .field("sessions", &self.sessions.len())
            .field("scheduled", &self.scheduled.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_open_row(&self, session_id: Uuid) -> bool {
        self.scheduled.iter().any(|m| {
            m.session_id == session_id
                && matches!(
                    m.status,
                    ScheduledStatus::Pending | ScheduledStatus::Processing
                )
        })
    }

    fn set_scheduled_status(
        &self,
        id: Uuid,
        status: ScheduledStatus,
        update: impl FnOnce(&mut ScheduledMessage),
    ) -> Result<()> {
        let mut row = self
            .scheduled
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Scheduled message {} not found", id))?;
        row.status = status;
        update(&mut row);
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn create_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>> {
        Ok(self.workflows.get(&id).map(|w| w.clone()))
    }

    async fn list_workflows(&self, tenant_id: Uuid) -> Result<Vec<WorkflowDefinition>> {
        let mut workflows: Vec<WorkflowDefinition> = self
            .workflows
            .iter()
            .filter(|w| w.tenant_id == tenant_id)
            .map(|w| w.value().clone())
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<bool> {
        match self.workflows.get_mut(&workflow.id) {
            Some(mut entry) => {
                *entry = workflow.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<bool> {
        if self.workflows.remove(&id).is_none() {
            return Ok(false);
        }
        self.steps.remove(&id);
        self.triggers.remove(&id);

        let session_ids: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.workflow_id == id)
            .map(|s| s.id)
            .collect();
        for session_id in &session_ids {
            self.sessions.remove(session_id);
        }
        self.scheduled
            .retain(|_, m| !session_ids.contains(&m.session_id));
        Ok(true)
    }

    async fn list_workflows_with_inactivity_timeout(&self) -> Result<Vec<WorkflowDefinition>> {
        Ok(self
            .workflows
            .iter()
            .filter(|w| w.inactivity_timeout_days.is_some_and(|d| d > 0))
            .map(|w| w.value().clone())
            .collect())
    }

    async fn replace_steps(&self, workflow_id: Uuid, steps: &[Step]) -> Result<()> {
        let mut sorted = steps.to_vec();
        sorted.sort_by_key(|s| s.order);
        self.steps.insert(workflow_id, sorted);
        Ok(())
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<Step>> {
        Ok(self
            .steps
            .get(&workflow_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<Step>> {
        Ok(self
            .steps
            .iter()
            .find_map(|set| set.iter().find(|s| s.id == id).cloned()))
    }

    async fn record_step_sent(&self, step_id: Uuid) -> Result<()> {
        for mut set in self.steps.iter_mut() {
            if let Some(step) = set.iter_mut().find(|s| s.id == step_id) {
                step.sent_count += 1;
                break;
            }
        }
        Ok(())
    }

    async fn upsert_trigger(&self, trigger: &Trigger) -> Result<()> {
        let mut set = self.triggers.entry(trigger.workflow_id).or_default();
        if trigger.is_active {
            for other in set.iter_mut().filter(|t| t.id != trigger.id) {
                other.is_active = false;
            }
        }
        match set.iter().position(|t| t.id == trigger.id) {
            Some(idx) => set[idx] = trigger.clone(),
            None => set.push(trigger.clone()),
        }
        Ok(())
    }

    async fn list_triggers(&self, workflow_id: Uuid) -> Result<Vec<Trigger>> {
        Ok(self
            .triggers
            .get(&workflow_id)
            .map(|t| t.clone())
            .unwrap_or_default())
    }

    async fn find_active_triggers(
        &self,
        tenant_id: Uuid,
        trigger_type: TriggerType,
    ) -> Result<Vec<(WorkflowDefinition, Trigger)>> {
        let mut matches = Vec::new();
        for workflow in self.workflows.iter() {
            if workflow.tenant_id != tenant_id || !workflow.is_active() {
                continue;
            }
            let Some(triggers) = self.triggers.get(&workflow.id) else {
                continue;
            };
            if let Some(trigger) = triggers
                .iter()
                .find(|t| t.is_active && t.trigger_type == trigger_type)
            {
                matches.push((workflow.value().clone(), trigger.clone()));
            }
        }
        matches.sort_by(|(a, _), (b, _)| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(matches)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn save_session(&self, session: &Session) -> Result<bool> {
        let Some(mut stored) = self.sessions.get_mut(&session.id) else {
            return Ok(false);
        };
        if stored.version != session.version {
            debug!(session_id = %session.id, "Stale session write rejected");
            return Ok(false);
        }
        *stored = session.clone();
        stored.version += 1;
        Ok(true)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.sessions.get(&id).map(|s| s.clone()))
    }

    async fn find_open_session(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
        user_id: i64,
    ) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && s.workflow_id == workflow_id
                    && s.user_id == user_id
                    && !s.status.is_terminal()
            })
            .max_by_key(|s| s.started_at)
            .map(|s| s.value().clone()))
    }

    async fn find_sessions_in_status(
        &self,
        tenant_id: Uuid,
        conversation_id: i64,
        user_id: i64,
        status: SessionStatus,
    ) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| {
                s.tenant_id == tenant_id
                    && s.conversation_id == conversation_id
                    && s.user_id == user_id
                    && s.status == status
            })
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    async fn list_sessions(
        &self,
        tenant_id: Uuid,
        workflow_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.tenant_id == tenant_id && workflow_id.map_or(true, |w| s.workflow_id == w))
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return Ok(false);
        };
        if session.status != from {
            return Ok(false);
        }
        session.status = to;
        session.last_activity_at = now;
        session.version += 1;
        Ok(true)
    }

    async fn claim_expired_waits(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Session>> {
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = self
            .sessions
            .iter()
            .filter_map(|s| match (s.status, s.wait_timeout_at) {
                (SessionStatus::AwaitingReply, Some(deadline)) if deadline <= now => {
                    Some((deadline, s.id))
                }
                _ => None,
            })
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            let Some(mut session) = self.sessions.get_mut(&id) else {
                continue;
            };
            let due = session.status == SessionStatus::AwaitingReply
                && session.wait_timeout_at.is_some_and(|d| d <= now);
            if !due {
                debug!(session_id = %id, "Expired wait already claimed");
                continue;
            }
            session.wait_timeout_at = None;
            session.version += 1;
            claimed.push(session.clone());
        }
        Ok(claimed)
    }

    async fn claim_stale_delays(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Session>> {
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = self
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::WaitingDelay && s.last_activity_at <= cutoff)
            .map(|s| (s.last_activity_at, s.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            if self.has_open_row(id) {
                continue;
            }
            let Some(mut session) = self.sessions.get_mut(&id) else {
                continue;
            };
            if session.status != SessionStatus::WaitingDelay || session.last_activity_at > cutoff {
                continue;
            }
            session.status = SessionStatus::Active;
            session.last_activity_at = now;
            session.version += 1;
            claimed.push(session.clone());
        }
        Ok(claimed)
    }

    async fn break_inactive_sessions(
        &self,
        workflow_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut broken = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if session.workflow_id == workflow_id
                && !session.status.is_terminal()
                && session.last_activity_at < cutoff
            {
                session.status = SessionStatus::Broken;
                session.version += 1;
                broken.push(session.id);
            }
        }
        Ok(broken)
    }
}

#[async_trait]
impl ScheduledMessageStore for MemoryStore {
    async fn insert_scheduled(&self, message: &ScheduledMessage) -> Result<()> {
        self.scheduled.insert(message.id, message.clone());
        Ok(())
    }

    async fn claim_due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>> {
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = self
            .scheduled
            .iter()
            .filter(|m| m.status == ScheduledStatus::Pending && m.fire_at <= now)
            .map(|m| (m.fire_at, m.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            let Some(mut row) = self.scheduled.get_mut(&id) else {
                continue;
            };
            if row.status != ScheduledStatus::Pending {
                debug!(message_id = %id, "Scheduled message claimed by another worker");
                continue;
            }
            row.status = ScheduledStatus::Processing;
            row.claimed_at = Some(now);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.set_scheduled_status(id, ScheduledStatus::Sent, |row| {
            row.sent_at = Some(now);
            row.error = None;
        })
    }

    async fn mark_failed(&self, id: Uuid, error: &str, _now: DateTime<Utc>) -> Result<()> {
        self.set_scheduled_status(id, ScheduledStatus::Failed, |row| {
            row.error = Some(error.to_string());
        })
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<()> {
        self.set_scheduled_status(id, ScheduledStatus::Cancelled, |_| {})
    }

    async fn cancel_pending_for_session(&self, session_id: Uuid) -> Result<u64> {
        let mut cancelled = 0;
        for mut row in self.scheduled.iter_mut() {
            if row.session_id == session_id && row.status == ScheduledStatus::Pending {
                row.status = ScheduledStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn reconcile_expired_claims(
        &self,
        lease_cutoff: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut reconciled = 0;
        for mut row in self.scheduled.iter_mut() {
            let expired = row.status == ScheduledStatus::Processing
                && row.claimed_at.is_some_and(|at| at < lease_cutoff);
            if expired {
                row.status = ScheduledStatus::Failed;
                row.error = Some("processing lease expired".to_string());
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    async fn list_for_session(&self, session_id: Uuid) -> Result<Vec<ScheduledMessage>> {
        let mut rows: Vec<ScheduledMessage> = self
            .scheduled
            .iter()
            .filter(|m| m.session_id == session_id)
            .map(|m| m.value().clone())
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }
}
