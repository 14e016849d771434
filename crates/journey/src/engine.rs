use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use journey_core::config::EngineConfig;
use journey_core::error::{JourneyError, JourneyResult};
use journey_core::event_bus::{make_event, noop_sink, EventSink, JourneyEventType};
use journey_core::templates::render;
use journey_core::types::{
    DelayStep, ReEntryPolicy, ScheduledMessage, ScheduledPayload, Session, SessionStatus, Step,
    StepKind, TimeoutAction, WorkflowDefinition, ANSWER_FIRST_NAME,
};
use journey_store::Stores;

use crate::capabilities::{Clock, LinkTracker, MessageSender, PassthroughLinks, SystemClock};
use crate::evaluator::ReplyEvaluator;
use crate::links::rewrite_links;
use crate::state_machine::SessionStateMachine;

/// Who is starting which workflow.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub conversation_id: i64,
    pub user_id: i64,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A new session was created.
    Started(Session),
    /// The `block` policy kept the user's running session.
    AlreadyRunning(Session),
}

impl StartOutcome {
    pub fn session(&self) -> &Session {
        match self {
            StartOutcome::Started(s) | StartOutcome::AlreadyRunning(s) => s,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }
}

/// Result of routing a user's message to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The reply was stored (and the session moved on where applicable).
    Recorded,
    /// The answer failed validation; a corrective prompt was sent.
    Rejected,
    /// The session is not waiting for this kind of input.
    NotApplicable,
}

/// Result of firing a scheduled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Continued,
    /// The session was already terminal; nothing was sent.
    SessionClosed,
    /// The scheduled step no longer exists; the session is now broken.
    Broken,
}

/// How the first step of a run is entered.
#[derive(Debug, Clone, Default)]
struct Entry {
    skip_delay: bool,
    /// Snapshot text to send instead of re-rendering the step.
    text: Option<String>,
}

/// Executes workflow steps for sessions and decides their transitions.
#[derive(Clone)]
pub struct JourneyEngine {
    stores: Stores,
    sender: Arc<dyn MessageSender>,
    links: Arc<dyn LinkTracker>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    evaluator: ReplyEvaluator,
    state_machine: Arc<SessionStateMachine>,
    config: EngineConfig,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JourneyEngine {
    /// Creates an engine with pass-through links, the system clock and no
    /// analytics sink.
    pub fn new(stores: Stores, sender: Arc<dyn MessageSender>, config: EngineConfig) -> Self {
        Self {
            stores,
            sender,
            links: Arc::new(PassthroughLinks),
            clock: Arc::new(SystemClock),
            event_sink: noop_sink(),
            evaluator: ReplyEvaluator::new(),
            state_machine: Arc::new(SessionStateMachine::new()),
            config,
        }
    }

    pub fn with_link_tracker(mut self, links: Arc<dyn LinkTracker>) -> Self {
        self.links = links;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ─── Start ──────────────────────────────────────────────────────────

    /// Starts (or, under the `block` policy, keeps) the user's session in
    /// the workflow and runs it until the first wait.
    pub async fn start_journey_for_user(&self, request: StartRequest) -> JourneyResult<StartOutcome> {
        let workflow = self
            .stores
            .definitions
            .get_workflow(request.workflow_id)
            .await?
            .filter(|w| w.tenant_id == request.tenant_id)
            .ok_or_else(|| JourneyError::not_found("Workflow", request.workflow_id))?;

        if !workflow.is_active() {
            return Err(JourneyError::Validation(format!(
                "workflow {} is not active",
                workflow.id
            )));
        }

        let existing = self
            .stores
            .sessions
            .find_open_session(request.tenant_id, workflow.id, request.user_id)
            .await?;
        if let Some(mut existing) = existing {
            match workflow.re_entry_policy {
                ReEntryPolicy::Block => {
                    debug!(
                        session_id = %existing.id,
                        user_id = request.user_id,
                        "Re-entry blocked, keeping running session"
                    );
                    return Ok(StartOutcome::AlreadyRunning(existing));
                }
                ReEntryPolicy::Restart => {
                    info!(
                        session_id = %existing.id,
                        user_id = request.user_id,
                        "Re-entry restarts journey, cancelling running session"
                    );
                    self.cancel_for_restart(&mut existing).await?;
                }
            }
        }

        let first = self
            .stores
            .definitions
            .list_steps(workflow.id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| JourneyError::Config(format!("workflow {} has no steps", workflow.id)))?;

        let now = self.clock.now();
        let mut session = Session::new(
            request.tenant_id,
            workflow.id,
            request.conversation_id,
            request.user_id,
            now,
        );
        session.current_step_id = Some(first.id);
        session.answers.insert(
            ANSWER_FIRST_NAME.to_string(),
            serde_json::Value::from(request.display_name.trim()),
        );
        self.stores.sessions.insert_session(&session).await?;

        info!(
            session_id = %session.id,
            workflow_id = %workflow.id,
            user_id = request.user_id,
            "User entered journey"
        );
        self.emit(JourneyEventType::SessionStarted, &session, None);

        let result = self.begin(&workflow, &mut session, first).await;
        self.absorb_conflict(session.id, result, ())?;
        Ok(StartOutcome::Started(session))
    }

    /// Cancels the running session. If another writer moved it in between,
    /// re-reads it once and cancels it only if it is still open.
    async fn cancel_for_restart(&self, existing: &mut Session) -> JourneyResult<()> {
        match self.cancel_session(existing).await {
            Err(e) if e.is_conflict() => {
                let fresh = self.stores.sessions.get_session(existing.id).await?;
                match fresh.filter(|s| !s.status.is_terminal()) {
                    Some(mut fresh) => self.cancel_session(&mut fresh).await,
                    None => Ok(()),
                }
            }
            other => other,
        }
    }

    /// Sends the welcome (now, soon, or later) and runs the first step.
    async fn begin(
        &self,
        workflow: &WorkflowDefinition,
        session: &mut Session,
        first: Step,
    ) -> JourneyResult<()> {
        let Some(welcome) = workflow.welcome_text().map(|t| render(t, &session.answers)) else {
            let result = self.run_from(session, first, Entry::default()).await;
            return self.tolerate_transport(session, result);
        };

        let delay = workflow.welcome_delay_secs;
        if delay == 0 {
            self.send_welcome_with_retry(session, first.id, &welcome)
                .await?;
            let result = self.run_from(session, first, Entry::default()).await;
            return self.tolerate_transport(session, result);
        }

        if delay <= self.config.inline_welcome_delay_max_secs {
            self.transition(session, SessionStatus::WaitingDelay)?;
            self.save(session).await?;

            let engine = self.clone();
            let session_id = session.id;
            tokio::spawn(async move {
                engine
                    .clock
                    .sleep(Duration::from_secs(u64::from(delay)))
                    .await;
                let result = engine.finish_delayed_welcome(session_id, welcome).await;
                if let Err(e) = engine.absorb_conflict(session_id, result, ()) {
                    warn!(session_id = %session_id, error = %e, "Delayed welcome failed");
                }
            });
            return Ok(());
        }

        let now = self.clock.now();
        let payload = ScheduledPayload::WelcomeAndStep {
            welcome_text: welcome,
            text: self.step_text(session, &first),
            step_type: first.kind.step_type(),
        };
        let fire_at = now + chrono::Duration::seconds(i64::from(delay));
        let row = ScheduledMessage::new(session, first.id, payload, fire_at, now);
        self.stores.scheduled.insert_scheduled(&row).await?;
        self.transition(session, SessionStatus::WaitingDelay)?;
        self.save(session).await?;
        info!(
            session_id = %session.id,
            fire_at = %fire_at,
            "Welcome and first step scheduled"
        );
        Ok(())
    }

    /// Wakes a session after a short in-process welcome delay. Does nothing
    /// if the session already left `waiting_delay`.
    async fn finish_delayed_welcome(&self, session_id: Uuid, welcome: String) -> JourneyResult<()> {
        let claimed = self
            .stores
            .sessions
            .compare_and_set_status(
                session_id,
                SessionStatus::WaitingDelay,
                SessionStatus::Active,
                self.clock.now(),
            )
            .await?;
        if !claimed {
            debug!(session_id = %session_id, "Session resumed elsewhere, skipping delayed welcome");
            return Ok(());
        }

        let Some(mut session) = self.stores.sessions.get_session(session_id).await? else {
            return Ok(());
        };
        let Some(step) = self.current_step(&session).await? else {
            return self
                .break_session(&mut session, "current step no longer exists")
                .await;
        };

        if session.welcome_sent_at.is_none() {
            self.send_welcome_with_retry(&mut session, step.id, &welcome)
                .await?;
        }
        let result = self.run_from(&mut session, step, Entry::default()).await;
        self.tolerate_transport(&session, result)
    }

    /// Sends the welcome with escalating backoff. Exhausting every attempt is
    /// logged and does not fail the start.
    async fn send_welcome_with_retry(
        &self,
        session: &mut Session,
        first_step_id: Uuid,
        text: &str,
    ) -> JourneyResult<()> {
        let attempts = self.config.welcome_send_attempts.max(1);
        for attempt in 1..=attempts {
            match self.send_text(session, first_step_id, text).await {
                Ok(()) => return self.mark_welcome_sent(session).await,
                Err(e) if attempt < attempts => {
                    let backoff_secs = self.config.welcome_backoff_secs(attempt);
                    warn!(
                        session_id = %session.id,
                        attempt,
                        backoff_secs,
                        error = %e,
                        "Welcome send failed, retrying"
                    );
                    self.clock.sleep(Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => {
                    error!(
                        session_id = %session.id,
                        attempts,
                        error = %e,
                        "Welcome send failed after all attempts, continuing with first step"
                    );
                }
            }
        }
        Ok(())
    }

    async fn mark_welcome_sent(&self, session: &mut Session) -> JourneyResult<()> {
        let now = self.clock.now();
        session.welcome_sent_at = Some(now);
        session.last_activity_at = now;
        self.save(session).await
    }

    // ─── Step execution ─────────────────────────────────────────────────

    /// Runs `step` for the session and keeps going until a step waits.
    pub async fn execute_step(&self, session: &mut Session, step: &Step) -> JourneyResult<()> {
        self.run_from(session, step.clone(), Entry::default()).await
    }

    /// Moves past `current`: completes the session when it was the last
    /// step, otherwise runs the next one.
    pub async fn advance_to_next_step(
        &self,
        session: &mut Session,
        current: &Step,
    ) -> JourneyResult<()> {
        match self.advance_pointer(session, current).await? {
            Some(next) => self.run_from(session, next, Entry::default()).await,
            None => Ok(()),
        }
    }

    /// Steps chain in a loop rather than by recursion.
    async fn run_from(&self, session: &mut Session, step: Step, entry: Entry) -> JourneyResult<()> {
        let mut next = Some((step, entry));
        while let Some((step, entry)) = next.take() {
            next = self
                .execute_once(session, &step, entry)
                .await?
                .map(|following| (following, Entry::default()));
        }
        Ok(())
    }

    /// Performs one step. Returns the step to run immediately after it, if
    /// any.
    async fn execute_once(
        &self,
        session: &mut Session,
        step: &Step,
        entry: Entry,
    ) -> JourneyResult<Option<Step>> {
        session.current_step_id = Some(step.id);

        let delay = step.kind.delay_secs();
        if delay > 0 && !entry.skip_delay && !self.wait_before_send(session, step, delay).await? {
            return Ok(None);
        }

        match &step.kind {
            StepKind::Message(_) => {
                let Some(text) = entry.text.or_else(|| self.step_text(session, step)) else {
                    warn!(step_id = %step.id, "Message step has no text, skipping");
                    return self.advance_pointer(session, step).await;
                };
                self.send_text(session, step.id, &text).await?;
                self.record_sent(session, step).await;
                self.advance_pointer(session, step).await
            }
            StepKind::Question(_) => {
                match entry.text.or_else(|| self.step_text(session, step)) {
                    Some(text) => {
                        self.send_text(session, step.id, &text).await?;
                        self.record_sent(session, step).await;
                    }
                    None => warn!(step_id = %step.id, "Question step has no prompt text"),
                }
                self.transition(session, SessionStatus::Active)?;
                self.save(session).await?;
                Ok(None)
            }
            StepKind::Delay(delay) => {
                self.schedule_after_delay(session, step, delay).await?;
                Ok(None)
            }
            StepKind::WaitForReply(wait) => {
                if let Some(text) = entry.text.or_else(|| self.step_text(session, step)) {
                    self.send_text(session, step.id, &text).await?;
                    self.record_sent(session, step).await;
                }
                let now = self.clock.now();
                self.transition(session, SessionStatus::AwaitingReply)?;
                session.reply_received_at = None;
                session.wait_timeout_at = wait
                    .timeout_minutes
                    .filter(|m| *m > 0)
                    .map(|m| now + chrono::Duration::minutes(i64::from(m)));
                self.save(session).await?;
                debug!(
                    session_id = %session.id,
                    step_id = %step.id,
                    deadline = ?session.wait_timeout_at,
                    "Awaiting reply"
                );
                Ok(None)
            }
            StepKind::Conditional(_) => {
                warn!(
                    step_id = %step.id,
                    "Conditional steps are not executed, continuing with next step"
                );
                self.advance_pointer(session, step).await
            }
        }
    }

    /// Applies a step's pre-send delay. Long delays are scheduled and return
    /// `false`; short ones are slept in process. Returns `false` as well when
    /// the session was taken over while sleeping.
    async fn wait_before_send(
        &self,
        session: &mut Session,
        step: &Step,
        delay_secs: u32,
    ) -> JourneyResult<bool> {
        let now = self.clock.now();
        if delay_secs > self.config.inline_step_delay_max_secs {
            let payload = ScheduledPayload::Step {
                text: self.step_text(session, step),
                step_type: step.kind.step_type(),
            };
            let fire_at = now + chrono::Duration::seconds(i64::from(delay_secs));
            let row = ScheduledMessage::new(session, step.id, payload, fire_at, now);
            self.stores.scheduled.insert_scheduled(&row).await?;
            self.transition(session, SessionStatus::WaitingDelay)?;
            self.save(session).await?;
            info!(
                session_id = %session.id,
                step_id = %step.id,
                fire_at = %fire_at,
                "Step scheduled"
            );
            return Ok(false);
        }

        self.transition(session, SessionStatus::WaitingDelay)?;
        self.save(session).await?;
        self.clock
            .sleep(Duration::from_secs(u64::from(delay_secs)))
            .await;

        let woke_at = self.clock.now();
        let claimed = self
            .stores
            .sessions
            .compare_and_set_status(
                session.id,
                SessionStatus::WaitingDelay,
                SessionStatus::Active,
                woke_at,
            )
            .await?;
        if !claimed {
            debug!(session_id = %session.id, "Session left waiting_delay during inline delay");
            return Ok(false);
        }
        session.status = SessionStatus::Active;
        session.last_activity_at = woke_at;
        session.version += 1;
        Ok(true)
    }

    async fn schedule_after_delay(
        &self,
        session: &mut Session,
        step: &Step,
        delay: &DelayStep,
    ) -> JourneyResult<()> {
        let low = delay.min_minutes.min(delay.max_minutes);
        let high = delay.min_minutes.max(delay.max_minutes);
        let minutes = rand::thread_rng().gen_range(low..=high);

        let Some(next) = self.next_step_after(session.workflow_id, step.order).await? else {
            info!(session_id = %session.id, "Delay is the last step, completing journey");
            return self.complete_session(session).await;
        };

        let now = self.clock.now();
        let fire_at = now + chrono::Duration::minutes(i64::from(minutes));
        let payload = ScheduledPayload::Step {
            text: self.step_text(session, &next),
            step_type: next.kind.step_type(),
        };
        let row = ScheduledMessage::new(session, next.id, payload, fire_at, now);
        self.stores.scheduled.insert_scheduled(&row).await?;

        session.current_step_id = Some(next.id);
        self.transition(session, SessionStatus::WaitingDelay)?;
        self.save(session).await?;
        info!(
            session_id = %session.id,
            minutes,
            next_step_id = %next.id,
            "Delay scheduled"
        );
        Ok(())
    }

    /// Points the session at the step after `current`, or completes it.
    async fn advance_pointer(
        &self,
        session: &mut Session,
        current: &Step,
    ) -> JourneyResult<Option<Step>> {
        match self.next_step_after(session.workflow_id, current.order).await? {
            None => {
                self.complete_session(session).await?;
                Ok(None)
            }
            Some(next) => {
                session.current_step_id = Some(next.id);
                self.transition(session, SessionStatus::Active)?;
                self.save(session).await?;
                Ok(Some(next))
            }
        }
    }

    /// Jumps to the step with `target` order, or advances linearly.
    async fn jump_or_advance(
        &self,
        session: &mut Session,
        current: &Step,
        target: Option<i32>,
    ) -> JourneyResult<()> {
        if let Some(order) = target {
            if let Some(step) = self.step_by_order(session.workflow_id, order).await? {
                debug!(session_id = %session.id, order, "Branching to step");
                session.current_step_id = Some(step.id);
                self.save(session).await?;
                return self.run_from(session, step, Entry::default()).await;
            }
            warn!(
                session_id = %session.id,
                order,
                "Branch target no longer exists, continuing with next step"
            );
        }
        self.advance_to_next_step(session, current).await
    }

    // ─── Replies ────────────────────────────────────────────────────────

    /// Validates an answer to the session's current question step. Invalid
    /// answers get a corrective prompt and leave the session in place.
    pub async fn handle_user_reply(
        &self,
        session: &mut Session,
        text: &str,
    ) -> JourneyResult<ReplyOutcome> {
        let result = self.answer_question(session, text).await;
        self.absorb_conflict(session.id, result, ReplyOutcome::NotApplicable)
    }

    async fn answer_question(
        &self,
        session: &mut Session,
        text: &str,
    ) -> JourneyResult<ReplyOutcome> {
        if session.status != SessionStatus::Active {
            return Ok(ReplyOutcome::NotApplicable);
        }
        let Some(step) = self.current_step(session).await? else {
            self.break_session(session, "current step no longer exists")
                .await?;
            return Ok(ReplyOutcome::NotApplicable);
        };
        let StepKind::Question(question) = &step.kind else {
            return Ok(ReplyOutcome::NotApplicable);
        };

        match self.evaluator.validate_answer(question.validation, text) {
            Err(rejection) => {
                debug!(
                    session_id = %session.id,
                    step_id = %step.id,
                    kind = ?rejection.kind,
                    "Answer rejected"
                );
                self.send_text(session, step.id, rejection.prompt()).await?;
                Ok(ReplyOutcome::Rejected)
            }
            Ok(value) => {
                session
                    .answers
                    .insert(question.answer_key.clone(), value);
                session.last_activity_at = self.clock.now();
                self.emit(JourneyEventType::AnswerRecorded, session, Some(step.id));
                self.advance_to_next_step(session, &step).await?;
                Ok(ReplyOutcome::Recorded)
            }
        }
    }

    /// Stores a reply for an `awaiting_reply` session. Without a deadline the
    /// session moves on right away; with one, it waits for the timeout sweep.
    pub async fn handle_wait_for_reply_response(
        &self,
        session: &mut Session,
        text: &str,
    ) -> JourneyResult<ReplyOutcome> {
        let result = self.store_wait_reply(session, text).await;
        self.absorb_conflict(session.id, result, ReplyOutcome::NotApplicable)
    }

    async fn store_wait_reply(
        &self,
        session: &mut Session,
        text: &str,
    ) -> JourneyResult<ReplyOutcome> {
        if session.status != SessionStatus::AwaitingReply {
            return Ok(ReplyOutcome::NotApplicable);
        }

        session.record_reply(text, self.clock.now());

        if session.wait_timeout_at.is_some() {
            self.save(session).await?;
            self.emit(JourneyEventType::ReplyReceived, session, session.current_step_id);
            debug!(session_id = %session.id, "Reply stored until the wait deadline");
            return Ok(ReplyOutcome::Recorded);
        }
        self.emit(JourneyEventType::ReplyReceived, session, session.current_step_id);

        let Some(step) = self.current_step(session).await? else {
            self.break_session(session, "current step no longer exists")
                .await?;
            return Ok(ReplyOutcome::Recorded);
        };
        self.transition(session, SessionStatus::Active)?;
        let target = self.branch_target(&step, text);
        self.jump_or_advance(session, &step, target).await?;
        Ok(ReplyOutcome::Recorded)
    }

    /// Resolves a `wait_for_reply` whose deadline passed. Called by the
    /// sweeper after it claimed the session.
    pub async fn timeout_wait_for_reply(&self, session: &mut Session) -> JourneyResult<()> {
        let result = self.resolve_wait_timeout(session).await;
        self.absorb_conflict(session.id, result, ())
    }

    async fn resolve_wait_timeout(&self, session: &mut Session) -> JourneyResult<()> {
        if session.status != SessionStatus::AwaitingReply {
            debug!(session_id = %session.id, status = ?session.status, "Session no longer awaiting reply");
            return Ok(());
        }
        let Some(step) = self.current_step(session).await? else {
            return self
                .break_session(session, "current step no longer exists")
                .await;
        };
        session.wait_timeout_at = None;

        if session.reply_received_at.take().is_some() {
            self.transition(session, SessionStatus::Active)?;
            let reply = session.last_reply().unwrap_or_default().to_string();
            let target = self.branch_target(&step, &reply);
            return self.jump_or_advance(session, &step, target).await;
        }

        let (message, action) = match &step.kind {
            StepKind::WaitForReply(wait) => (wait.timeout_message.as_deref(), wait.timeout_action),
            _ => (None, TimeoutAction::Continue),
        };

        let message = message
            .map(|t| render(t, &session.answers))
            .filter(|t| !t.trim().is_empty());
        if let Some(text) = message {
            if let Err(e) = self.send_text(session, step.id, &text).await {
                warn!(session_id = %session.id, error = %e, "Timeout message not delivered");
            }
        }

        match action {
            TimeoutAction::End => {
                info!(session_id = %session.id, "No reply before deadline, ending journey");
                self.complete_session(session).await
            }
            TimeoutAction::Continue => {
                self.transition(session, SessionStatus::Active)?;
                self.advance_to_next_step(session, &step).await
            }
        }
    }

    fn branch_target(&self, step: &Step, reply: &str) -> Option<i32> {
        step.kind
            .branch()
            .and_then(|rule| self.evaluator.select_branch(rule, reply))
    }

    // ─── Sweeper entry points ───────────────────────────────────────────

    /// Sends a claimed scheduled message and continues its session from the
    /// scheduled step.
    pub async fn resume_scheduled(&self, row: &ScheduledMessage) -> JourneyResult<ResumeOutcome> {
        let result = self.resume_row(row).await;
        self.absorb_conflict(row.session_id, result, ResumeOutcome::SessionClosed)
    }

    async fn resume_row(&self, row: &ScheduledMessage) -> JourneyResult<ResumeOutcome> {
        let Some(mut session) = self.stores.sessions.get_session(row.session_id).await? else {
            return Ok(ResumeOutcome::SessionClosed);
        };
        if session.status.is_terminal() {
            debug!(session_id = %session.id, status = ?session.status, "Session closed before scheduled message fired");
            return Ok(ResumeOutcome::SessionClosed);
        }

        let step = self
            .stores
            .definitions
            .get_step(row.step_id)
            .await?
            .filter(|s| s.workflow_id == session.workflow_id);
        let Some(step) = step else {
            self.break_session(&mut session, "scheduled step no longer exists")
                .await?;
            return Ok(ResumeOutcome::Broken);
        };

        let text = match &row.payload {
            ScheduledPayload::Step { text, .. } => text.clone(),
            ScheduledPayload::WelcomeAndStep {
                welcome_text, text, ..
            } => {
                if session.welcome_sent_at.is_none() {
                    self.send_text(&session, step.id, welcome_text).await?;
                    self.mark_welcome_sent(&mut session).await?;
                }
                text.clone()
            }
        };

        self.transition(&mut session, SessionStatus::Active)?;
        session.current_step_id = Some(step.id);
        self.run_from(
            &mut session,
            step,
            Entry {
                skip_delay: true,
                text,
            },
        )
        .await?;
        Ok(ResumeOutcome::Continued)
    }

    /// Re-executes the current step of a session recovered from a stale
    /// `waiting_delay`. An unsent welcome goes out first when the session
    /// never got past its first step.
    pub async fn recover_stale_session(&self, session: &mut Session) -> JourneyResult<()> {
        let result = self.rerun_current_step(session).await;
        self.absorb_conflict(session.id, result, ())
    }

    async fn rerun_current_step(&self, session: &mut Session) -> JourneyResult<()> {
        let Some(step) = self.current_step(session).await? else {
            return self
                .break_session(session, "current step no longer exists")
                .await;
        };

        if session.welcome_sent_at.is_none() {
            self.resend_missing_welcome(session, &step).await?;
        }

        info!(session_id = %session.id, step_id = %step.id, "Recovering stale delayed session");
        self.run_from(session, step, Entry::default()).await
    }

    async fn resend_missing_welcome(&self, session: &mut Session, step: &Step) -> JourneyResult<()> {
        let Some(workflow) = self
            .stores
            .definitions
            .get_workflow(session.workflow_id)
            .await?
        else {
            return Ok(());
        };
        let Some(welcome) = workflow.welcome_text().map(|t| render(t, &session.answers)) else {
            return Ok(());
        };
        let first = self
            .stores
            .definitions
            .list_steps(workflow.id)
            .await?
            .into_iter()
            .next();
        if first.map(|s| s.id) != Some(step.id) {
            return Ok(());
        }

        match self.send_text(session, step.id, &welcome).await {
            Ok(()) => self.mark_welcome_sent(session).await,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Recovered welcome not delivered");
                Ok(())
            }
        }
    }

    /// Breaks the workflow's sessions idle for longer than its inactivity
    /// timeout. Returns how many sessions were broken.
    pub async fn expire_inactive_sessions(
        &self,
        workflow: &WorkflowDefinition,
    ) -> JourneyResult<usize> {
        let Some(days) = workflow.inactivity_timeout_days.filter(|d| *d > 0) else {
            return Ok(0);
        };
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(days));
        let broken = self
            .stores
            .sessions
            .break_inactive_sessions(workflow.id, cutoff)
            .await?;

        for session_id in &broken {
            self.stores
                .scheduled
                .cancel_pending_for_session(*session_id)
                .await?;
            self.event_sink.emit(make_event(
                JourneyEventType::SessionBroken,
                workflow.tenant_id,
                workflow.id,
                *session_id,
                None,
            ));
        }
        if !broken.is_empty() {
            info!(
                workflow_id = %workflow.id,
                count = broken.len(),
                inactivity_days = days,
                "Inactive sessions marked broken"
            );
        }
        Ok(broken.len())
    }

    // ─── Terminal transitions ───────────────────────────────────────────

    pub async fn complete_session(&self, session: &mut Session) -> JourneyResult<()> {
        self.transition(session, SessionStatus::Completed)?;
        session.completed_at = Some(session.last_activity_at);
        session.wait_timeout_at = None;
        self.save(session).await?;
        info!(session_id = %session.id, "Journey completed");
        self.emit(JourneyEventType::SessionCompleted, session, None);
        Ok(())
    }

    /// Cancels the session and its pending scheduled messages. Messages
    /// already claimed by a worker are not interrupted.
    pub async fn cancel_session(&self, session: &mut Session) -> JourneyResult<()> {
        self.transition(session, SessionStatus::Cancelled)?;
        session.wait_timeout_at = None;
        self.save(session).await?;
        let cancelled = self
            .stores
            .scheduled
            .cancel_pending_for_session(session.id)
            .await?;
        info!(session_id = %session.id, cancelled, "Session cancelled");
        self.emit(JourneyEventType::SessionCancelled, session, None);
        Ok(())
    }

    async fn break_session(&self, session: &mut Session, reason: &str) -> JourneyResult<()> {
        if session.status.is_terminal() {
            return Ok(());
        }
        self.transition(session, SessionStatus::Broken)?;
        session.wait_timeout_at = None;
        self.save(session).await?;
        self.stores
            .scheduled
            .cancel_pending_for_session(session.id)
            .await?;
        error!(
            session_id = %session.id,
            step_id = ?session.current_step_id,
            reason,
            "Session marked broken"
        );
        self.emit(JourneyEventType::SessionBroken, session, session.current_step_id);
        Ok(())
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    fn transition(&self, session: &mut Session, to: SessionStatus) -> JourneyResult<()> {
        self.state_machine.check(session.status, to)?;
        session.status = to;
        session.last_activity_at = self.clock.now();
        Ok(())
    }

    /// Writes the session unless another writer updated it since this copy
    /// was read.
    async fn save(&self, session: &mut Session) -> JourneyResult<()> {
        if !self.stores.sessions.save_session(session).await? {
            return Err(JourneyError::Conflict { id: session.id });
        }
        session.version += 1;
        Ok(())
    }

    /// A stale copy lost the race; the other writer's state stands.
    fn absorb_conflict<T>(
        &self,
        session_id: Uuid,
        result: JourneyResult<T>,
        fallback: T,
    ) -> JourneyResult<T> {
        match result {
            Err(e) if e.is_conflict() => {
                debug!(session_id = %session_id, "Session updated elsewhere, dropping stale write");
                Ok(fallback)
            }
            other => other,
        }
    }

    /// A failed send leaves the session where it stopped; the caller still
    /// gets the session back.
    fn tolerate_transport(&self, session: &Session, result: JourneyResult<()>) -> JourneyResult<()> {
        match result {
            Err(e) if e.is_transport() => {
                warn!(
                    session_id = %session.id,
                    step_id = ?session.current_step_id,
                    error = %e,
                    "Step send failed, session left in place"
                );
                Ok(())
            }
            other => other,
        }
    }

    fn emit(&self, event_type: JourneyEventType, session: &Session, step_id: Option<Uuid>) {
        self.event_sink.emit(make_event(
            event_type,
            session.tenant_id,
            session.workflow_id,
            session.id,
            step_id,
        ));
    }

    /// Rendered, non-blank body text of the step.
    fn step_text(&self, session: &Session, step: &Step) -> Option<String> {
        step.kind
            .text()
            .map(|t| render(t, &session.answers))
            .filter(|t| !t.trim().is_empty())
    }

    async fn send_text(&self, session: &Session, step_id: Uuid, text: &str) -> JourneyResult<()> {
        let text = rewrite_links(
            self.links.as_ref(),
            session.tenant_id,
            session.workflow_id,
            step_id,
            text,
        )
        .await;
        self.sender
            .send(session.tenant_id, session.conversation_id, &text)
            .await
            .map_err(|e| JourneyError::Transport(e.to_string()))
    }

    async fn record_sent(&self, session: &Session, step: &Step) {
        if let Err(e) = self.stores.definitions.record_step_sent(step.id).await {
            warn!(step_id = %step.id, error = %e, "Failed to record step send");
        }
        self.emit(JourneyEventType::StepSent, session, Some(step.id));
    }

    /// The session's current step, if it still exists in its workflow.
    async fn current_step(&self, session: &Session) -> JourneyResult<Option<Step>> {
        let Some(step_id) = session.current_step_id else {
            return Ok(None);
        };
        let step = self.stores.definitions.get_step(step_id).await?;
        Ok(step.filter(|s| s.workflow_id == session.workflow_id))
    }

    async fn next_step_after(&self, workflow_id: Uuid, order: i32) -> JourneyResult<Option<Step>> {
        let steps = self.stores.definitions.list_steps(workflow_id).await?;
        Ok(steps.into_iter().find(|s| s.order > order))
    }

    async fn step_by_order(&self, workflow_id: Uuid, order: i32) -> JourneyResult<Option<Step>> {
        let steps = self.stores.definitions.list_steps(workflow_id).await?;
        Ok(steps.into_iter().find(|s| s.order == order))
    }
}
