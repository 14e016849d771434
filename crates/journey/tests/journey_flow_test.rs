//! End-to-end journey behaviour against the in-memory store, a recording
//! sender and a manual clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use journey_core::config::EngineConfig;
use journey_core::event_bus::{capture_sink, CaptureSink, JourneyEventType};
use journey_core::types::{
    AnswerKind, BranchRule, ConditionalStep, DelayStep, MessageStep, QuestionStep,
    ReEntryPolicy, ScheduledPayload, ScheduledStatus, Session, SessionStatus, StepDraft, StepKind,
    TimeoutAction, Trigger, TriggerType, WaitForReplyStep, WorkflowDefinition, WorkflowStatus,
};
use journey_engine::admin::WorkflowConfigUpdate;
use journey_engine::capabilities::{LinkTracker, ManualClock, RecordingSender};
use journey_engine::{
    Clock, InboundRouter, JourneyAdmin, JourneyEngine, ReplyOutcome, ResumeOutcome, StartRequest,
};
use journey_store::{MemoryStore, ScheduledMessageStore, SessionStore, Stores};

struct Harness {
    store: Arc<MemoryStore>,
    sender: Arc<RecordingSender>,
    clock: Arc<ManualClock>,
    events: Arc<CaptureSink>,
    engine: JourneyEngine,
    admin: JourneyAdmin,
    tenant: Uuid,
    bot: Uuid,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let stores = Stores::from_backend(store.clone());
    let sender = Arc::new(RecordingSender::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let events = capture_sink();
    let engine = JourneyEngine::new(stores.clone(), sender.clone(), EngineConfig::default())
        .with_clock(clock.clone())
        .with_event_sink(events.clone());
    Harness {
        store,
        sender,
        clock,
        events,
        engine,
        admin: JourneyAdmin::new(stores),
        tenant: Uuid::new_v4(),
        bot: Uuid::new_v4(),
    }
}

fn message(order: i32, text: &str) -> StepDraft {
    StepDraft {
        order,
        kind: StepKind::Message(MessageStep {
            text: text.into(),
            delay_secs: 0,
        }),
    }
}

fn delayed_message(order: i32, text: &str, delay_secs: u32) -> StepDraft {
    StepDraft {
        order,
        kind: StepKind::Message(MessageStep {
            text: text.into(),
            delay_secs,
        }),
    }
}

fn question(order: i32, text: &str, key: &str, validation: AnswerKind) -> StepDraft {
    StepDraft {
        order,
        kind: StepKind::Question(QuestionStep {
            text: text.into(),
            delay_secs: 0,
            answer_key: key.into(),
            validation,
        }),
    }
}

fn wait_for_reply(
    order: i32,
    timeout_minutes: Option<u32>,
    action: TimeoutAction,
    branch: Option<BranchRule>,
) -> StepDraft {
    StepDraft {
        order,
        kind: StepKind::WaitForReply(WaitForReplyStep {
            text: Some("Still there?".into()),
            delay_secs: 0,
            timeout_minutes,
            timeout_action: action,
            timeout_message: None,
            branch,
        }),
    }
}

impl Harness {
    async fn workflow(
        &self,
        policy: ReEntryPolicy,
        welcome: Option<(&str, u32)>,
        steps: Vec<StepDraft>,
    ) -> WorkflowDefinition {
        let wf = self
            .admin
            .create_workflow(WorkflowDefinition::new(self.tenant, self.bot, "Test flow"))
            .await
            .unwrap();
        self.admin
            .update_workflow_config(
                wf.id,
                WorkflowConfigUpdate {
                    re_entry_policy: Some(policy),
                    welcome_message: Some(welcome.map(|(text, _)| text.to_string())),
                    welcome_delay_secs: Some(welcome.map(|(_, delay)| delay).unwrap_or(0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        self.admin.replace_steps(wf.id, steps).await.unwrap();
        self.admin
            .update_workflow_status(wf.id, WorkflowStatus::Active)
            .await
            .unwrap()
    }

    async fn start(&self, workflow: &WorkflowDefinition, user_id: i64) -> Session {
        let outcome = self
            .engine
            .start_journey_for_user(StartRequest {
                tenant_id: self.tenant,
                workflow_id: workflow.id,
                conversation_id: user_id * 10,
                user_id,
                display_name: "Ada".into(),
            })
            .await
            .unwrap();
        outcome.session().clone()
    }

    async fn session(&self, id: Uuid) -> Session {
        self.store.get_session(id).await.unwrap().unwrap()
    }

    /// Claims and fires every due scheduled message, as one sweep would.
    async fn fire_due(&self) -> Vec<ResumeOutcome> {
        let rows = self
            .store
            .claim_due_messages(self.clock.now(), 50)
            .await
            .unwrap();
        let mut outcomes = Vec::new();
        for row in rows {
            let outcome = self.engine.resume_scheduled(&row).await.unwrap();
            self.store.mark_sent(row.id, self.clock.now()).await.unwrap();
            outcomes.push(outcome);
        }
        outcomes
    }
}

async fn wait_for_messages(sender: &RecordingSender, count: usize) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while sender.count() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "expected {count} messages, got {:?}", sender.texts());
}

#[tokio::test]
async fn test_block_reentry_returns_same_session_without_messages() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            Some(("Hi {name}!", 0)),
            vec![question(1, "What's your email?", "email", AnswerKind::Text)],
        )
        .await;

    let first = h.start(&wf, 7).await;
    assert_eq!(h.sender.texts(), vec!["Hi Ada!", "What's your email?"]);

    let outcome = h
        .engine
        .start_journey_for_user(StartRequest {
            tenant_id: h.tenant,
            workflow_id: wf.id,
            conversation_id: 70,
            user_id: 7,
            display_name: "Ada".into(),
        })
        .await
        .unwrap();
    assert!(!outcome.is_new());
    assert_eq!(outcome.session().id, first.id);
    assert_eq!(h.sender.count(), 2);
}

#[tokio::test]
async fn test_restart_reentry_cancels_previous_session() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Restart,
            None,
            vec![question(1, "Age?", "age", AnswerKind::Number)],
        )
        .await;

    let first = h.start(&wf, 8).await;
    let second = h.start(&wf, 8).await;

    assert_ne!(first.id, second.id);
    assert_eq!(h.session(first.id).await.status, SessionStatus::Cancelled);
    assert_eq!(h.session(second.id).await.status, SessionStatus::Active);
    assert_eq!(h.events.count_type(JourneyEventType::SessionCancelled), 1);
    assert_eq!(h.events.count_type(JourneyEventType::SessionStarted), 2);
}

#[tokio::test]
async fn test_start_without_steps_fails_and_creates_nothing() {
    let h = harness();
    let wf = h.workflow(ReEntryPolicy::Block, None, vec![]).await;

    let result = h
        .engine
        .start_journey_for_user(StartRequest {
            tenant_id: h.tenant,
            workflow_id: wf.id,
            conversation_id: 1,
            user_id: 1,
            display_name: "Ada".into(),
        })
        .await;
    assert!(result.is_err());
    assert!(h
        .store
        .list_sessions(h.tenant, Some(wf.id), 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_trailing_delay_completes_without_scheduling() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                message(1, "Thanks for joining"),
                StepDraft {
                    order: 2,
                    kind: StepKind::Delay(DelayStep {
                        min_minutes: 5,
                        max_minutes: 10,
                    }),
                },
            ],
        )
        .await;

    let session = h.start(&wf, 3).await;
    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(stored.completed_at.is_some());
    assert!(h.store.list_for_session(session.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delay_schedules_next_step_within_range() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                StepDraft {
                    order: 1,
                    kind: StepKind::Delay(DelayStep {
                        min_minutes: 5,
                        max_minutes: 10,
                    }),
                },
                message(2, "Checking in, {name}"),
            ],
        )
        .await;
    let started = h.clock.now();
    let session = h.start(&wf, 4).await;

    let rows = h.store.list_for_session(session.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    let minutes = (row.fire_at - started).num_minutes();
    assert!((5..=10).contains(&minutes), "fire in {minutes} minutes");
    assert_eq!(
        row.payload,
        ScheduledPayload::Step {
            text: Some("Checking in, Ada".into()),
            step_type: journey_core::types::StepType::Message,
        }
    );

    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::WaitingDelay);
    assert_eq!(stored.current_step_id, Some(row.step_id));

    assert!(h.fire_due().await.is_empty());
    h.clock.advance(chrono::Duration::minutes(11));
    assert_eq!(h.fire_due().await, vec![ResumeOutcome::Continued]);
    assert_eq!(h.sender.texts(), vec!["Checking in, Ada"]);
    assert_eq!(h.session(session.id).await.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_number_question_validates_before_advancing() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                question(1, "What's your budget?", "budget", AnswerKind::Number),
                message(2, "Budget noted: {budget}"),
            ],
        )
        .await;
    let session = h.start(&wf, 5).await;
    let question_step = session.current_step_id;

    let mut stored = h.session(session.id).await;
    let outcome = h.engine.handle_user_reply(&mut stored, "abc").await.unwrap();
    assert_eq!(outcome, ReplyOutcome::Rejected);
    let stored = h.session(session.id).await;
    assert!(!stored.answers.contains_key("budget"));
    assert_eq!(stored.current_step_id, question_step);
    assert_eq!(stored.status, SessionStatus::Active);

    let mut stored = stored;
    let outcome = h
        .engine
        .handle_user_reply(&mut stored, "1,200.50")
        .await
        .unwrap();
    assert_eq!(outcome, ReplyOutcome::Recorded);

    let stored = h.session(session.id).await;
    assert_eq!(stored.answers["budget"], serde_json::json!(1200.5));
    assert_eq!(stored.status, SessionStatus::Completed);
    assert_eq!(
        h.sender.texts().last().map(String::as_str),
        Some("Budget noted: 1200.5")
    );
    assert_eq!(h.events.count_type(JourneyEventType::AnswerRecorded), 1);
}

#[tokio::test]
async fn test_wait_timeout_end_completes_session() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                wait_for_reply(1, Some(5), TimeoutAction::End, None),
                message(2, "Next"),
            ],
        )
        .await;
    let session = h.start(&wf, 6).await;
    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::AwaitingReply);
    assert!(stored.wait_timeout_at.is_some());

    h.clock.advance(chrono::Duration::minutes(4));
    assert!(h
        .store
        .claim_expired_waits(h.clock.now(), 10)
        .await
        .unwrap()
        .is_empty());

    h.clock.advance(chrono::Duration::minutes(2));
    let mut claimed = h
        .store
        .claim_expired_waits(h.clock.now(), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    h.engine
        .timeout_wait_for_reply(&mut claimed[0])
        .await
        .unwrap();

    assert_eq!(h.session(session.id).await.status, SessionStatus::Completed);
    assert_eq!(h.sender.texts(), vec!["Still there?"]);
}

#[tokio::test]
async fn test_reply_before_deadline_advances_only_at_timeout() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                wait_for_reply(1, Some(5), TimeoutAction::End, None),
                question(2, "Next question", "topic", AnswerKind::Text),
            ],
        )
        .await;
    let session = h.start(&wf, 9).await;

    h.clock.advance(chrono::Duration::minutes(3));
    let mut stored = h.session(session.id).await;
    let outcome = h
        .engine
        .handle_wait_for_reply_response(&mut stored, "I'm here")
        .await
        .unwrap();
    assert_eq!(outcome, ReplyOutcome::Recorded);

    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::AwaitingReply);
    assert_eq!(stored.last_reply(), Some("I'm here"));
    assert!(stored.reply_received_at.is_some());
    assert_eq!(h.sender.count(), 1);

    h.clock.advance(chrono::Duration::minutes(3));
    let mut claimed = h
        .store
        .claim_expired_waits(h.clock.now(), 10)
        .await
        .unwrap();
    h.engine
        .timeout_wait_for_reply(&mut claimed[0])
        .await
        .unwrap();

    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::Active);
    assert!(stored.reply_received_at.is_none());
    assert_eq!(h.sender.texts(), vec!["Still there?", "Next question"]);
}

#[tokio::test]
async fn test_wait_without_deadline_branches_on_keyword() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                wait_for_reply(
                    1,
                    None,
                    TimeoutAction::Continue,
                    Some(BranchRule {
                        keyword: "yes".into(),
                        on_match: Some(3),
                        on_miss: None,
                    }),
                ),
                message(2, "Maybe later then"),
                message(3, "Great, here is the link"),
            ],
        )
        .await;

    let yes = h.start(&wf, 11).await;
    let mut stored = h.session(yes.id).await;
    h.engine
        .handle_wait_for_reply_response(&mut stored, "YES please")
        .await
        .unwrap();
    assert_eq!(h.session(yes.id).await.status, SessionStatus::Completed);
    assert_eq!(
        h.sender.texts(),
        vec!["Still there?", "Great, here is the link"]
    );

    let no = h.start(&wf, 12).await;
    let mut stored = h.session(no.id).await;
    h.engine
        .handle_wait_for_reply_response(&mut stored, "nope")
        .await
        .unwrap();
    let texts = h.sender.texts();
    assert_eq!(
        &texts[2..],
        &["Still there?", "Maybe later then", "Great, here is the link"]
    );
}

#[tokio::test]
async fn test_replaced_steps_break_stale_sessions() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                question(1, "Name of your company?", "company", AnswerKind::Text),
                message(2, "Thanks"),
                message(3, "Bye"),
            ],
        )
        .await;
    let session = h.start(&wf, 13).await;
    let old_steps = h.admin.list_steps(wf.id).await.unwrap();

    let new_steps = h
        .admin
        .replace_steps(
            wf.id,
            vec![message(1, "a"), message(2, "b"), message(3, "c")],
        )
        .await
        .unwrap();
    let listed = h.admin.list_steps(wf.id).await.unwrap();
    assert_eq!(listed, new_steps);
    assert!(old_steps
        .iter()
        .all(|old| listed.iter().all(|s| s.id != old.id)));

    let mut stored = h.session(session.id).await;
    let outcome = h
        .engine
        .handle_user_reply(&mut stored, "Acme")
        .await
        .unwrap();
    assert_eq!(outcome, ReplyOutcome::NotApplicable);
    assert_eq!(h.session(session.id).await.status, SessionStatus::Broken);
    assert_eq!(h.events.count_type(JourneyEventType::SessionBroken), 1);
}

#[tokio::test]
async fn test_long_welcome_delay_is_scheduled_with_first_step() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            Some(("Welcome {name}", 300)),
            vec![message(1, "Here is your guide"), message(2, "Enjoy")],
        )
        .await;
    let session = h.start(&wf, 14).await;

    assert_eq!(h.sender.count(), 0);
    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::WaitingDelay);
    let rows = h.store.list_for_session(session.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(matches!(
        &rows[0].payload,
        ScheduledPayload::WelcomeAndStep { welcome_text, .. } if welcome_text == "Welcome Ada"
    ));

    h.clock.advance(chrono::Duration::minutes(5));
    assert_eq!(h.fire_due().await, vec![ResumeOutcome::Continued]);
    assert_eq!(
        h.sender.texts(),
        vec!["Welcome Ada", "Here is your guide", "Enjoy"]
    );
    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(stored.welcome_sent_at.is_some());
}

#[tokio::test]
async fn test_short_welcome_delay_runs_in_background() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            Some(("Hello {name}", 5)),
            vec![message(1, "First tip")],
        )
        .await;
    let session = h.start(&wf, 15).await;
    assert_eq!(session.status, SessionStatus::WaitingDelay);

    wait_for_messages(&h.sender, 2).await;
    assert_eq!(h.sender.texts(), vec!["Hello Ada", "First tip"]);
    assert!(h.store.list_for_session(session.id).await.unwrap().is_empty());

    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.session(session.id).await.status == SessionStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(done.is_ok());
}

#[tokio::test]
async fn test_welcome_retries_with_backoff() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            Some(("Hi", 0)),
            vec![message(1, "Step one")],
        )
        .await;
    h.sender.fail_next(2);
    let before = h.clock.now();

    let session = h.start(&wf, 16).await;

    assert_eq!(h.sender.texts(), vec!["Hi", "Step one"]);
    assert_eq!(h.clock.now() - before, chrono::Duration::seconds(20));
    assert!(h.session(session.id).await.welcome_sent_at.is_some());
}

#[tokio::test]
async fn test_welcome_failure_still_runs_first_step() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            Some(("Hi", 0)),
            vec![message(1, "Step one")],
        )
        .await;
    h.sender.fail_next(3);

    let session = h.start(&wf, 17).await;

    assert_eq!(h.sender.texts(), vec!["Step one"]);
    let stored = h.session(session.id).await;
    assert!(stored.welcome_sent_at.is_none());
    assert_eq!(stored.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_send_failure_leaves_session_in_place() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![message(1, "One"), message(2, "Two")],
        )
        .await;
    let steps = h.admin.list_steps(wf.id).await.unwrap();
    h.sender.fail_next(1);

    let session = h.start(&wf, 18).await;
    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::Active);
    assert_eq!(stored.current_step_id, Some(steps[0].id));
    assert_eq!(h.sender.count(), 0);
    assert_eq!(steps[0].sent_count, 0);
}

#[tokio::test]
async fn test_inline_and_scheduled_step_delays() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                delayed_message(1, "After ten seconds", 10),
                delayed_message(2, "After two minutes", 120),
                message(3, "Right after"),
            ],
        )
        .await;
    let before = h.clock.now();
    let session = h.start(&wf, 19).await;

    assert_eq!(h.sender.texts(), vec!["After ten seconds"]);
    assert_eq!(h.clock.now() - before, chrono::Duration::seconds(10));

    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::WaitingDelay);
    let rows = h.store.list_for_session(session.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(stored.current_step_id, Some(rows[0].step_id));

    h.clock.advance(chrono::Duration::minutes(2));
    h.fire_due().await;
    assert_eq!(
        h.sender.texts(),
        vec!["After ten seconds", "After two minutes", "Right after"]
    );

    let steps = h.admin.list_steps(wf.id).await.unwrap();
    assert!(steps.iter().all(|s| s.sent_count == 1));
    assert_eq!(h.events.count_type(JourneyEventType::StepSent), 3);
}

#[tokio::test]
async fn test_conditional_step_is_skipped() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                StepDraft {
                    order: 1,
                    kind: StepKind::Conditional(ConditionalStep { branch: None }),
                },
                message(2, "After the condition"),
            ],
        )
        .await;
    let session = h.start(&wf, 20).await;
    assert_eq!(h.sender.texts(), vec!["After the condition"]);
    assert_eq!(h.session(session.id).await.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_scheduled_row_for_closed_session_is_not_sent() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![delayed_message(1, "Later", 600)],
        )
        .await;
    let session = h.start(&wf, 21).await;

    h.clock.advance(chrono::Duration::minutes(11));
    let rows = h
        .store
        .claim_due_messages(h.clock.now(), 10)
        .await
        .unwrap();
    let mut stored = h.session(session.id).await;
    h.engine.complete_session(&mut stored).await.unwrap();

    let outcome = h.engine.resume_scheduled(&rows[0]).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::SessionClosed);
    assert_eq!(h.sender.count(), 0);
}

#[tokio::test]
async fn test_stale_delay_recovery_sends_missing_welcome() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            Some(("Hello again", 10)),
            vec![question(1, "Where are you from?", "country", AnswerKind::Country)],
        )
        .await;
    let first = h.admin.list_steps(wf.id).await.unwrap()[0].clone();

    // Left behind by a process that died during the in-process welcome wait.
    let mut orphan = Session::new(h.tenant, wf.id, 220, 22, h.clock.now());
    orphan.current_step_id = Some(first.id);
    orphan.status = SessionStatus::WaitingDelay;
    h.store.insert_session(&orphan).await.unwrap();

    h.clock.advance(chrono::Duration::seconds(90));
    let cutoff = h.clock.now() - chrono::Duration::seconds(60);
    let mut claimed = h
        .store
        .claim_stale_delays(cutoff, h.clock.now(), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    h.engine
        .recover_stale_session(&mut claimed[0])
        .await
        .unwrap();

    assert_eq!(h.sender.texts(), vec!["Hello again", "Where are you from?"]);
    let mut stored = h.session(orphan.id).await;
    assert!(stored.welcome_sent_at.is_some());

    h.engine.handle_user_reply(&mut stored, "pt").await.unwrap();
    assert_eq!(
        h.session(orphan.id).await.answers["country"],
        serde_json::json!("PT")
    );
}

#[tokio::test]
async fn test_inactivity_breaks_idle_sessions() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![question(1, "Anything?", "anything", AnswerKind::Text)],
        )
        .await;
    let wf = h
        .admin
        .update_workflow_config(
            wf.id,
            WorkflowConfigUpdate {
                inactivity_timeout_days: Some(Some(2)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let session = h.start(&wf, 23).await;

    assert_eq!(h.engine.expire_inactive_sessions(&wf).await.unwrap(), 0);
    h.clock.advance(chrono::Duration::days(3));
    assert_eq!(h.engine.expire_inactive_sessions(&wf).await.unwrap(), 1);
    assert_eq!(h.session(session.id).await.status, SessionStatus::Broken);
}

#[tokio::test]
async fn test_inbound_routing() {
    let h = harness();
    let deep = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                question(1, "Your city?", "city", AnswerKind::Text),
                wait_for_reply(2, None, TimeoutAction::Continue, None),
                message(3, "Thanks {city}"),
            ],
        )
        .await;
    h.admin
        .upsert_trigger(Trigger::new(
            h.tenant,
            deep.id,
            TriggerType::DeeplinkParam,
            serde_json::json!({"start_param": "city"}),
        ))
        .await
        .unwrap();

    let keyword = h
        .workflow(ReEntryPolicy::Block, None, vec![message(1, "Our prices")])
        .await;
    h.admin
        .upsert_trigger(Trigger::new(
            h.tenant,
            keyword.id,
            TriggerType::KeywordDm,
            serde_json::json!({"keyword": "price"}),
        ))
        .await
        .unwrap();

    let router = InboundRouter::new(h.engine.clone());
    assert!(!router
        .on_start_command(h.tenant, h.bot, 500, 50, "/start unknown", "Ada")
        .await
        .unwrap());
    assert!(router
        .on_start_command(h.tenant, h.bot, 500, 50, "/start city", "Ada")
        .await
        .unwrap());

    assert!(router
        .on_plain_message(h.tenant, 500, 50, "Lisbon")
        .await
        .unwrap());
    assert!(router
        .on_plain_message(h.tenant, 500, 50, "ok")
        .await
        .unwrap());
    assert_eq!(
        h.sender.texts(),
        vec!["Your city?", "Still there?", "Thanks Lisbon"]
    );

    assert!(router
        .on_plain_message(h.tenant, 500, 50, "What is the PRICE?")
        .await
        .unwrap());
    assert_eq!(h.sender.texts().last().map(String::as_str), Some("Our prices"));

    assert!(!router
        .on_plain_message(h.tenant, 500, 50, "hello")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_scheduled_row_status_after_fire() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![delayed_message(1, "Later", 60)],
        )
        .await;
    let session = h.start(&wf, 24).await;
    h.clock.advance(chrono::Duration::minutes(2));
    h.fire_due().await;

    let rows = h.store.list_for_session(session.id).await.unwrap();
    assert_eq!(rows[0].status, ScheduledStatus::Sent);
    assert_eq!(h.sender.texts(), vec!["Later"]);
}

#[tokio::test]
async fn test_late_reply_does_not_reopen_timed_out_session() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                wait_for_reply(1, Some(5), TimeoutAction::End, None),
                message(2, "Next"),
            ],
        )
        .await;
    let session = h.start(&wf, 31).await;
    let mut late = h.session(session.id).await;
    assert_eq!(late.status, SessionStatus::AwaitingReply);

    h.clock.advance(chrono::Duration::minutes(6));
    let mut claimed = h
        .store
        .claim_expired_waits(h.clock.now(), 10)
        .await
        .unwrap();
    h.engine
        .timeout_wait_for_reply(&mut claimed[0])
        .await
        .unwrap();
    assert_eq!(h.session(session.id).await.status, SessionStatus::Completed);

    let outcome = h
        .engine
        .handle_wait_for_reply_response(&mut late, "hi")
        .await
        .unwrap();
    assert_eq!(outcome, ReplyOutcome::NotApplicable);

    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(stored.reply_received_at.is_none());
    assert!(stored.wait_timeout_at.is_none());
    assert_eq!(h.events.count_type(JourneyEventType::ReplyReceived), 0);
}

#[tokio::test]
async fn test_answer_to_broken_session_is_dropped() {
    let h = harness();
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            None,
            vec![
                question(1, "Company name?", "company", AnswerKind::Text),
                message(2, "Thanks {company}"),
            ],
        )
        .await;
    let session = h.start(&wf, 32).await;
    let mut late = h.session(session.id).await;

    h.clock.advance(chrono::Duration::days(1));
    let broken = h
        .store
        .break_inactive_sessions(wf.id, h.clock.now())
        .await
        .unwrap();
    assert_eq!(broken, vec![session.id]);

    let outcome = h.engine.handle_user_reply(&mut late, "Acme").await.unwrap();
    assert_eq!(outcome, ReplyOutcome::NotApplicable);

    let stored = h.session(session.id).await;
    assert_eq!(stored.status, SessionStatus::Broken);
    assert!(!stored.answers.contains_key("company"));
    assert_eq!(h.sender.texts(), vec!["Company name?"]);
}

/// Rewrites every URL into a redirect and records the step it was sent for.
#[derive(Default)]
struct RedirectLinks {
    wrapped: Mutex<Vec<(Uuid, String)>>,
}

#[async_trait]
impl LinkTracker for RedirectLinks {
    async fn wrap(
        &self,
        _tenant_id: Uuid,
        _workflow_id: Uuid,
        step_id: Uuid,
        url: &str,
    ) -> anyhow::Result<String> {
        self.wrapped.lock().unwrap().push((step_id, url.to_string()));
        Ok(format!("https://t.example/r?u={url}"))
    }
}

#[tokio::test]
async fn test_outbound_links_are_tracked() {
    let mut h = harness();
    let links = Arc::new(RedirectLinks::default());
    h.engine = h.engine.clone().with_link_tracker(links.clone());
    let wf = h
        .workflow(
            ReEntryPolicy::Block,
            Some(("Hi {name}, start at https://example.com/start", 0)),
            vec![
                message(1, "Docs: (https://example.com/docs)"),
                question(2, "How many seats?", "seats", AnswerKind::Number),
            ],
        )
        .await;
    let steps = h.admin.list_steps(wf.id).await.unwrap();

    let session = h.start(&wf, 33).await;
    assert_eq!(
        h.sender.texts(),
        vec![
            "Hi Ada, start at https://t.example/r?u=https://example.com/start",
            "Docs: (https://t.example/r?u=https://example.com/docs)",
            "How many seats?",
        ]
    );
    assert_eq!(
        *links.wrapped.lock().unwrap(),
        vec![
            (steps[0].id, "https://example.com/start".to_string()),
            (steps[0].id, "https://example.com/docs".to_string()),
        ]
    );

    let mut stored = h.session(session.id).await;
    let outcome = h
        .engine
        .handle_user_reply(&mut stored, "see https://example.com/pricing")
        .await
        .unwrap();
    assert_eq!(outcome, ReplyOutcome::Rejected);
    assert_eq!(
        h.sender.texts().last().map(String::as_str),
        Some("Please enter a valid number, for example 42 or 1,250.")
    );
    assert_eq!(links.wrapped.lock().unwrap().len(), 2);
}
