//! Entry points for the webhook layer: start commands and plain messages.

use tracing::debug;
use uuid::Uuid;

use journey_core::error::JourneyResult;
use journey_core::types::SessionStatus;

use crate::engine::{JourneyEngine, ReplyOutcome, StartRequest};
use crate::trigger::{parse_start_param, TriggerMatch, TriggerResolver};

#[derive(Debug, Clone)]
pub struct InboundRouter {
    engine: JourneyEngine,
    resolver: TriggerResolver,
}

impl InboundRouter {
    pub fn new(engine: JourneyEngine) -> Self {
        let resolver = TriggerResolver::new(engine.stores().definitions.clone());
        Self { engine, resolver }
    }

    pub fn engine(&self) -> &JourneyEngine {
        &self.engine
    }

    /// Handles `/start <param>`. Returns `false` when no workflow matched.
    pub async fn on_start_command(
        &self,
        tenant_id: Uuid,
        bot_id: Uuid,
        conversation_id: i64,
        user_id: i64,
        raw_text: &str,
        display_name: &str,
    ) -> JourneyResult<bool> {
        let Some(param) = parse_start_param(raw_text) else {
            return Ok(false);
        };
        let Some(found) = self
            .resolver
            .resolve_deeplink(tenant_id, bot_id, param)
            .await?
        else {
            return Ok(false);
        };
        self.start(tenant_id, conversation_id, user_id, display_name, found)
            .await
    }

    /// Routes a plain message: first to a session awaiting a reply, then to
    /// a session asking a question, then to a keyword trigger. Returns
    /// `false` when nothing consumed the message.
    pub async fn on_plain_message(
        &self,
        tenant_id: Uuid,
        conversation_id: i64,
        user_id: i64,
        raw_text: &str,
    ) -> JourneyResult<bool> {
        let sessions = &self.engine.stores().sessions;

        let waiting = sessions
            .find_sessions_in_status(
                tenant_id,
                conversation_id,
                user_id,
                SessionStatus::AwaitingReply,
            )
            .await?;
        for mut session in waiting {
            let outcome = self
                .engine
                .handle_wait_for_reply_response(&mut session, raw_text)
                .await?;
            if outcome != ReplyOutcome::NotApplicable {
                return Ok(true);
            }
        }

        let active = sessions
            .find_sessions_in_status(tenant_id, conversation_id, user_id, SessionStatus::Active)
            .await?;
        for mut session in active {
            let outcome = self.engine.handle_user_reply(&mut session, raw_text).await?;
            if outcome != ReplyOutcome::NotApplicable {
                return Ok(true);
            }
        }

        let Some(found) = self.resolver.resolve_keyword(tenant_id, raw_text).await? else {
            debug!(user_id, "Plain message matched no journey");
            return Ok(false);
        };
        self.start(tenant_id, conversation_id, user_id, "", found)
            .await
    }

    async fn start(
        &self,
        tenant_id: Uuid,
        conversation_id: i64,
        user_id: i64,
        display_name: &str,
        found: TriggerMatch,
    ) -> JourneyResult<bool> {
        debug!(
            workflow_id = %found.workflow.id,
            trigger_id = %found.trigger_id,
            "Trigger matched"
        );
        self.engine
            .start_journey_for_user(StartRequest {
                tenant_id,
                workflow_id: found.workflow.id,
                conversation_id,
                user_id,
                display_name: display_name.to_string(),
            })
            .await?;
        Ok(true)
    }
}
