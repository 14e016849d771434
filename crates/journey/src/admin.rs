//! Plain data operations for authoring workflows and inspecting sessions.

use std::collections::HashSet;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use journey_core::error::{JourneyError, JourneyResult};
use journey_core::types::{
    ReEntryPolicy, Session, Step, StepDraft, StepKind, Trigger, TriggerType, WorkflowDefinition,
    WorkflowStatus, RESERVED_ANSWER_KEYS,
};
use journey_store::Stores;

/// Partial update of a workflow's configuration. `None` leaves a field as
/// it is; the nested options of the welcome and timeout fields clear them.
#[derive(Debug, Clone, Default)]
pub struct WorkflowConfigUpdate {
    pub name: Option<String>,
    pub re_entry_policy: Option<ReEntryPolicy>,
    pub welcome_message: Option<Option<String>>,
    pub welcome_delay_secs: Option<u32>,
    pub priority: Option<i32>,
    pub locked: Option<bool>,
    pub inactivity_timeout_days: Option<Option<u32>>,
}

#[derive(Clone)]
pub struct JourneyAdmin {
    stores: Stores,
}

impl std::fmt::Debug for JourneyAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyAdmin").finish_non_exhaustive()
    }
}

impl JourneyAdmin {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn create_workflow(
        &self,
        workflow: WorkflowDefinition,
    ) -> JourneyResult<WorkflowDefinition> {
        if workflow.name.trim().is_empty() {
            return Err(JourneyError::Validation("workflow name is required".into()));
        }
        self.stores.definitions.create_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, name = %workflow.name, "Creating workflow");
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: Uuid) -> JourneyResult<WorkflowDefinition> {
        self.stores
            .definitions
            .get_workflow(id)
            .await?
            .ok_or_else(|| JourneyError::not_found("Workflow", id))
    }

    pub async fn list_workflows(&self, tenant_id: Uuid) -> JourneyResult<Vec<WorkflowDefinition>> {
        Ok(self.stores.definitions.list_workflows(tenant_id).await?)
    }

    pub async fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
    ) -> JourneyResult<WorkflowDefinition> {
        let mut workflow = self.get_workflow(id).await?;
        info!(workflow_id = %id, ?status, "Updating workflow status");
        workflow.status = status;
        self.persist(workflow).await
    }

    pub async fn update_workflow_config(
        &self,
        id: Uuid,
        update: WorkflowConfigUpdate,
    ) -> JourneyResult<WorkflowDefinition> {
        let mut workflow = self.get_workflow(id).await?;
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(JourneyError::Validation("workflow name is required".into()));
            }
            workflow.name = name;
        }
        if let Some(policy) = update.re_entry_policy {
            workflow.re_entry_policy = policy;
        }
        if let Some(welcome) = update.welcome_message {
            workflow.welcome_message = welcome;
        }
        if let Some(delay) = update.welcome_delay_secs {
            workflow.welcome_delay_secs = delay;
        }
        if let Some(priority) = update.priority {
            workflow.priority = priority;
        }
        if let Some(locked) = update.locked {
            workflow.locked = locked;
        }
        if let Some(days) = update.inactivity_timeout_days {
            workflow.inactivity_timeout_days = days;
        }
        self.persist(workflow).await
    }

    async fn persist(&self, mut workflow: WorkflowDefinition) -> JourneyResult<WorkflowDefinition> {
        workflow.updated_at = Utc::now();
        if !self.stores.definitions.update_workflow(&workflow).await? {
            return Err(JourneyError::not_found("Workflow", workflow.id));
        }
        Ok(workflow)
    }

    /// Deletes the workflow with its steps, triggers, sessions and scheduled
    /// messages.
    pub async fn delete_workflow(&self, id: Uuid) -> JourneyResult<()> {
        if !self.stores.definitions.delete_workflow(id).await? {
            return Err(JourneyError::not_found("Workflow", id));
        }
        info!(workflow_id = %id, "Deleted workflow");
        Ok(())
    }

    /// Validates `drafts` and replaces the workflow's whole step set with
    /// them under fresh ids. Sessions still pointing at an old step break on
    /// their next execution.
    pub async fn replace_steps(
        &self,
        workflow_id: Uuid,
        drafts: Vec<StepDraft>,
    ) -> JourneyResult<Vec<Step>> {
        self.get_workflow(workflow_id).await?;
        validate_steps(&drafts)?;

        let mut steps: Vec<Step> = drafts
            .into_iter()
            .map(|draft| Step {
                id: Uuid::new_v4(),
                workflow_id,
                order: draft.order,
                kind: draft.kind,
                sent_count: 0,
            })
            .collect();
        steps.sort_by_key(|s| s.order);

        self.stores
            .definitions
            .replace_steps(workflow_id, &steps)
            .await?;
        info!(workflow_id = %workflow_id, count = steps.len(), "Replaced workflow steps");
        Ok(steps)
    }

    pub async fn list_steps(&self, workflow_id: Uuid) -> JourneyResult<Vec<Step>> {
        Ok(self.stores.definitions.list_steps(workflow_id).await?)
    }

    /// Saves the trigger. Activating it deactivates any other active trigger
    /// of the same workflow.
    pub async fn upsert_trigger(&self, mut trigger: Trigger) -> JourneyResult<Trigger> {
        let workflow = self.get_workflow(trigger.workflow_id).await?;
        if workflow.tenant_id != trigger.tenant_id {
            return Err(JourneyError::Validation(
                "trigger tenant does not match workflow".into(),
            ));
        }
        if trigger.trigger_type == TriggerType::DeeplinkParam && trigger.deeplink_param().is_none()
        {
            return Err(JourneyError::Validation(
                "deep-link trigger needs a start parameter".into(),
            ));
        }
        trigger.updated_at = Utc::now();
        self.stores.definitions.upsert_trigger(&trigger).await?;
        info!(
            trigger_id = %trigger.id,
            workflow_id = %trigger.workflow_id,
            active = trigger.is_active,
            "Saved trigger"
        );
        Ok(trigger)
    }

    pub async fn list_triggers(&self, workflow_id: Uuid) -> JourneyResult<Vec<Trigger>> {
        Ok(self.stores.definitions.list_triggers(workflow_id).await?)
    }

    pub async fn list_sessions(
        &self,
        tenant_id: Uuid,
        workflow_id: Option<Uuid>,
        limit: usize,
    ) -> JourneyResult<Vec<Session>> {
        Ok(self
            .stores
            .sessions
            .list_sessions(tenant_id, workflow_id, limit)
            .await?)
    }
}

/// Rejects duplicate orders, dangling branch targets, bad answer keys and
/// inverted delay ranges.
pub fn validate_steps(drafts: &[StepDraft]) -> JourneyResult<()> {
    let mut orders = HashSet::new();
    for draft in drafts {
        if !orders.insert(draft.order) {
            return Err(JourneyError::Validation(format!(
                "duplicate step order {}",
                draft.order
            )));
        }
    }

    for draft in drafts {
        match &draft.kind {
            StepKind::Question(q) => {
                let key = q.answer_key.trim();
                if key.is_empty() {
                    return Err(JourneyError::Validation(format!(
                        "question at order {} needs an answer key",
                        draft.order
                    )));
                }
                if RESERVED_ANSWER_KEYS.contains(&key) {
                    return Err(JourneyError::Validation(format!(
                        "answer key '{key}' is reserved"
                    )));
                }
            }
            StepKind::Delay(d) if d.min_minutes > d.max_minutes => {
                return Err(JourneyError::Validation(format!(
                    "delay at order {} has min {} above max {}",
                    draft.order, d.min_minutes, d.max_minutes
                )));
            }
            _ => {}
        }

        if let Some(rule) = draft.kind.branch() {
            if let Some(target) = rule.targets().find(|t| !orders.contains(t)) {
                return Err(JourneyError::Validation(format!(
                    "step at order {} branches to missing order {target}",
                    draft.order
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use journey_core::types::{
        BranchRule, DelayStep, MessageStep, QuestionStep, WaitForReplyStep,
    };
    use journey_store::MemoryStore;

    fn message(order: i32, text: &str) -> StepDraft {
        StepDraft {
            order,
            kind: StepKind::Message(MessageStep {
                text: text.into(),
                delay_secs: 0,
            }),
        }
    }

    fn admin() -> JourneyAdmin {
        JourneyAdmin::new(Stores::from_backend(Arc::new(MemoryStore::new())))
    }

    #[test]
    fn test_validate_rejects_duplicates_and_dangling_targets() {
        let dup = vec![message(1, "a"), message(1, "b")];
        assert!(matches!(validate_steps(&dup), Err(JourneyError::Validation(_))));

        let dangling = vec![
            message(1, "a"),
            StepDraft {
                order: 2,
                kind: StepKind::WaitForReply(WaitForReplyStep {
                    text: None,
                    delay_secs: 0,
                    timeout_minutes: None,
                    timeout_action: Default::default(),
                    timeout_message: None,
                    branch: Some(BranchRule {
                        keyword: "yes".into(),
                        on_match: Some(1),
                        on_miss: Some(9),
                    }),
                }),
            },
        ];
        let err = validate_steps(&dangling).unwrap_err();
        assert!(err.to_string().contains("missing order 9"));
    }

    #[test]
    fn test_validate_answer_keys_and_delay_range() {
        let reserved = vec![StepDraft {
            order: 1,
            kind: StepKind::Question(QuestionStep {
                text: "Name?".into(),
                delay_secs: 0,
                answer_key: "first_name".into(),
                validation: Default::default(),
            }),
        }];
        assert!(validate_steps(&reserved).is_err());

        let inverted = vec![StepDraft {
            order: 1,
            kind: StepKind::Delay(DelayStep {
                min_minutes: 10,
                max_minutes: 5,
            }),
        }];
        assert!(validate_steps(&inverted).is_err());
        assert!(validate_steps(&[message(3, "ok"), message(1, "ok")]).is_ok());
    }

    #[tokio::test]
    async fn test_replace_steps_assigns_fresh_ids() {
        let admin = admin();
        let tenant = Uuid::new_v4();
        let wf = admin
            .create_workflow(WorkflowDefinition::new(tenant, Uuid::new_v4(), "Onboarding"))
            .await
            .unwrap();

        let first = admin
            .replace_steps(wf.id, vec![message(2, "b"), message(1, "a"), message(3, "c")])
            .await
            .unwrap();
        let second = admin
            .replace_steps(wf.id, vec![message(1, "x"), message(2, "y"), message(3, "z")])
            .await
            .unwrap();

        let listed = admin.list_steps(wf.id).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(
            listed.iter().map(|s| s.order).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(listed, second);
        assert!(first.iter().all(|old| listed.iter().all(|s| s.id != old.id)));
    }

    #[tokio::test]
    async fn test_update_config_and_status() {
        let admin = admin();
        let wf = admin
            .create_workflow(WorkflowDefinition::new(Uuid::new_v4(), Uuid::new_v4(), "Promo"))
            .await
            .unwrap();

        let updated = admin
            .update_workflow_config(
                wf.id,
                WorkflowConfigUpdate {
                    welcome_message: Some(Some("Hi {name}".into())),
                    welcome_delay_secs: Some(30),
                    re_entry_policy: Some(ReEntryPolicy::Restart),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.welcome_text(), Some("Hi {name}"));
        assert_eq!(updated.re_entry_policy, ReEntryPolicy::Restart);

        let active = admin
            .update_workflow_status(wf.id, WorkflowStatus::Active)
            .await
            .unwrap();
        assert!(active.is_active());

        admin.delete_workflow(wf.id).await.unwrap();
        assert!(matches!(
            admin.get_workflow(wf.id).await,
            Err(JourneyError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_upsert_trigger_requires_param() {
        let admin = admin();
        let tenant = Uuid::new_v4();
        let wf = admin
            .create_workflow(WorkflowDefinition::new(tenant, Uuid::new_v4(), "Deep link"))
            .await
            .unwrap();

        let empty = Trigger::new(tenant, wf.id, TriggerType::DeeplinkParam, serde_json::json!({}));
        assert!(admin.upsert_trigger(empty).await.is_err());

        let first = Trigger::new(
            tenant,
            wf.id,
            TriggerType::DeeplinkParam,
            serde_json::json!({"start_param": "a"}),
        );
        let second = Trigger::new(
            tenant,
            wf.id,
            TriggerType::KeywordDm,
            serde_json::json!({"keyword": "hi"}),
        );
        admin.upsert_trigger(first).await.unwrap();
        admin.upsert_trigger(second.clone()).await.unwrap();

        let triggers = admin.list_triggers(wf.id).await.unwrap();
        let active: Vec<_> = triggers.iter().filter(|t| t.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }
}
