//! Maps inbound events to the workflow they start.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use journey_core::error::JourneyResult;
use journey_core::types::{TriggerType, WorkflowDefinition};
use journey_store::DefinitionStore;

use crate::evaluator::matches_keyword;

const START_COMMAND: &str = "/start";

/// A workflow selected by a trigger, with the trigger's raw configuration.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub workflow: WorkflowDefinition,
    pub trigger_id: Uuid,
    pub config: serde_json::Value,
}

/// Extracts the parameter of a `/start <param>` (or `/start@bot <param>`)
/// command. A missing or empty parameter yields `None`.
pub fn parse_start_param(raw_text: &str) -> Option<&str> {
    let mut tokens = raw_text.split_whitespace();
    let command = tokens.next()?;
    let is_start = command == START_COMMAND
        || command
            .strip_prefix(START_COMMAND)
            .is_some_and(|rest| rest.starts_with('@'));
    if !is_start {
        return None;
    }
    tokens.next().filter(|p| !p.is_empty())
}

#[derive(Clone)]
pub struct TriggerResolver {
    definitions: Arc<dyn DefinitionStore>,
}

impl std::fmt::Debug for TriggerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerResolver").finish_non_exhaustive()
    }
}

impl TriggerResolver {
    pub fn new(definitions: Arc<dyn DefinitionStore>) -> Self {
        Self { definitions }
    }

    /// Active workflow of `bot_id` whose deep-link trigger parameter equals
    /// `param`.
    pub async fn resolve_deeplink(
        &self,
        tenant_id: Uuid,
        bot_id: Uuid,
        param: &str,
    ) -> JourneyResult<Option<TriggerMatch>> {
        let param = param.trim();
        if param.is_empty() {
            return Ok(None);
        }

        let candidates = self
            .definitions
            .find_active_triggers(tenant_id, TriggerType::DeeplinkParam)
            .await?;

        let found = candidates
            .into_iter()
            .find(|(workflow, trigger)| {
                workflow.bot_id == bot_id && trigger.deeplink_param() == Some(param)
            })
            .map(|(workflow, trigger)| TriggerMatch {
                workflow,
                trigger_id: trigger.id,
                config: trigger.config,
            });

        if found.is_none() {
            debug!(tenant_id = %tenant_id, param = %param, "No deep-link trigger matched");
        }
        Ok(found)
    }

    /// First unlocked workflow, by priority then recency, whose keyword is
    /// empty or contained in `text` (case-insensitive).
    pub async fn resolve_keyword(
        &self,
        tenant_id: Uuid,
        text: &str,
    ) -> JourneyResult<Option<TriggerMatch>> {
        let candidates = self
            .definitions
            .find_active_triggers(tenant_id, TriggerType::KeywordDm)
            .await?;

        let found = candidates
            .into_iter()
            .filter(|(workflow, _)| !workflow.locked)
            .find(|(_, trigger)| matches_keyword(trigger.keyword(), text))
            .map(|(workflow, trigger)| TriggerMatch {
                workflow,
                trigger_id: trigger.id,
                config: trigger.config,
            });
        Ok(found)
    }
}
