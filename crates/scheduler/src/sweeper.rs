use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use journey_core::config::SchedulerConfig;
use journey_core::error::JourneyResult;
use journey_core::types::{ScheduledMessage, Session};
use journey_engine::{JourneyEngine, ResumeOutcome};

/// Counts from one sweep tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Due scheduled messages claimed by this tick.
    pub due_claimed: usize,
    pub sent: usize,
    /// Rows whose session was already closed.
    pub cancelled: usize,
    pub failed: usize,
    pub timeouts: usize,
    pub timeout_errors: usize,
    /// `processing` rows failed after their lease expired.
    pub reconciled: u64,
    pub recovered: usize,
    pub recovery_errors: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Counts from one inactivity sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InactivityReport {
    pub workflows: usize,
    pub broken: usize,
    pub errors: usize,
}

enum RowResult {
    Sent,
    Cancelled,
    Failed,
}

/// Claims due work from the stores and re-enters the engine for it. Several
/// sweepers may run against the same database; claims keep them disjoint.
pub struct Sweeper {
    engine: JourneyEngine,
    config: SchedulerConfig,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Sweeper {
    pub fn new(engine: JourneyEngine, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the periodic loop. Fails if this sweeper is already running.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            anyhow::bail!("sweeper is already running");
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let sweeper = Arc::clone(self);
        Ok(tokio::spawn(async move { sweeper.run(shutdown_rx).await }))
    }

    /// Asks the loop to stop after its current tick.
    pub async fn shutdown(&self) {
        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown_tx {
            info!("Initiating sweeper shutdown");
            let _ = tx.send(()).await;
        }
    }

    async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.config.tick_interval_secs.max(1),
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inactivity = tokio::time::interval(Duration::from_secs(
            self.config.inactivity_interval_secs.max(1),
        ));
        inactivity.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            inactivity_interval_secs = self.config.inactivity_interval_secs,
            batch_size = self.config.batch_size,
            "Sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = tick.tick() => {
                    let report = self.tick().await;
                    if report.is_idle() {
                        debug!("Sweep tick found no work");
                    } else {
                        info!(?report, "Sweep tick finished");
                    }
                }
                _ = inactivity.tick() => {
                    let report = self.sweep_inactive().await;
                    if report.broken > 0 || report.errors > 0 {
                        info!(?report, "Inactivity sweep finished");
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        info!("Sweeper stopped");
    }

    /// Runs one sweep: due messages, expired waits, claim reconciliation and
    /// stale delay recovery, in that order. Item failures are counted, never
    /// returned.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        self.fire_due_messages(&mut report).await;
        self.expire_waits(&mut report).await;
        self.reconcile_claims(&mut report).await;
        self.recover_stale_delays(&mut report).await;
        report
    }

    async fn fire_due_messages(&self, report: &mut TickReport) {
        let claimed = self
            .engine
            .stores()
            .scheduled
            .claim_due_messages(self.engine.now(), self.config.batch_size)
            .await;
        let rows = match claimed {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Failed to claim due scheduled messages");
                return;
            }
        };
        if rows.is_empty() {
            return;
        }
        report.due_claimed = rows.len();

        let mut tasks = JoinSet::new();
        for row in rows {
            let engine = self.engine.clone();
            tasks.spawn(async move { fire_row(&engine, row).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(RowResult::Sent) => report.sent += 1,
                Ok(RowResult::Cancelled) => report.cancelled += 1,
                Ok(RowResult::Failed) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "Scheduled message task panicked");
                    report.failed += 1;
                }
            }
        }
    }

    async fn expire_waits(&self, report: &mut TickReport) {
        let claimed = self
            .engine
            .stores()
            .sessions
            .claim_expired_waits(self.engine.now(), self.config.batch_size)
            .await;
        let sessions = match claimed {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "Failed to claim expired waits");
                return;
            }
        };

        let (done, failed) = self
            .for_each_session(sessions, "wait_timeout", |engine, mut session| async move {
                engine.timeout_wait_for_reply(&mut session).await
            })
            .await;
        report.timeouts = done;
        report.timeout_errors = failed;
    }

    async fn reconcile_claims(&self, report: &mut TickReport) {
        let now = self.engine.now();
        let lease_cutoff = now - chrono::Duration::seconds(self.config.processing_lease_secs);
        match self
            .engine
            .stores()
            .scheduled
            .reconcile_expired_claims(lease_cutoff, now)
            .await
        {
            Ok(0) => {}
            Ok(count) => {
                warn!(
                    count,
                    lease_secs = self.config.processing_lease_secs,
                    "Processing lease expired, scheduled messages marked failed"
                );
                report.reconciled = count;
            }
            Err(e) => error!(error = %e, "Failed to reconcile expired claims"),
        }
    }

    async fn recover_stale_delays(&self, report: &mut TickReport) {
        let now = self.engine.now();
        let cutoff = now - chrono::Duration::seconds(self.config.stale_delay_grace_secs);
        let claimed = self
            .engine
            .stores()
            .sessions
            .claim_stale_delays(cutoff, now, self.config.batch_size)
            .await;
        let sessions = match claimed {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "Failed to claim stale delayed sessions");
                return;
            }
        };

        let (done, failed) = self
            .for_each_session(sessions, "stale_recovery", |engine, mut session| async move {
                engine.recover_stale_session(&mut session).await
            })
            .await;
        report.recovered = done;
        report.recovery_errors = failed;
    }

    /// Runs `work` for every claimed session in its own task. Returns
    /// `(succeeded, failed)`.
    async fn for_each_session<F, Fut>(
        &self,
        sessions: Vec<Session>,
        action: &'static str,
        work: F,
    ) -> (usize, usize)
    where
        F: Fn(JourneyEngine, Session) -> Fut,
        Fut: Future<Output = JourneyResult<()>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for session in sessions {
            let session_id = session.id;
            let job = work(self.engine.clone(), session);
            tasks.spawn(async move { (session_id, job.await) });
        }

        let (mut done, mut failed) = (0, 0);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => done += 1,
                Ok((session_id, Err(e))) => {
                    error!(session_id = %session_id, action, error = %e, "Sweep item failed");
                    failed += 1;
                }
                Err(e) => {
                    error!(action, error = %e, "Sweep task panicked");
                    failed += 1;
                }
            }
        }
        (done, failed)
    }

    /// Breaks sessions idle past their workflow's inactivity timeout.
    pub async fn sweep_inactive(&self) -> InactivityReport {
        let mut report = InactivityReport::default();
        let workflows = match self
            .engine
            .stores()
            .definitions
            .list_workflows_with_inactivity_timeout()
            .await
        {
            Ok(workflows) => workflows,
            Err(e) => {
                error!(error = %e, "Failed to list workflows with an inactivity timeout");
                report.errors += 1;
                return report;
            }
        };
        report.workflows = workflows.len();

        for workflow in &workflows {
            match self.engine.expire_inactive_sessions(workflow).await {
                Ok(broken) => report.broken += broken,
                Err(e) => {
                    error!(workflow_id = %workflow.id, error = %e, "Inactivity sweep failed");
                    report.errors += 1;
                }
            }
        }
        report
    }
}

/// Resumes one claimed row and records its outcome on the row.
async fn fire_row(engine: &JourneyEngine, row: ScheduledMessage) -> RowResult {
    let scheduled = &engine.stores().scheduled;
    let (result, recorded) = match engine.resume_scheduled(&row).await {
        Ok(ResumeOutcome::Continued) => (RowResult::Sent, scheduled.mark_sent(row.id, engine.now()).await),
        Ok(ResumeOutcome::SessionClosed) => (RowResult::Cancelled, scheduled.mark_cancelled(row.id).await),
        Ok(ResumeOutcome::Broken) => (
            RowResult::Failed,
            scheduled
                .mark_failed(row.id, "scheduled step no longer exists", engine.now())
                .await,
        ),
        Err(e) => {
            warn!(
                scheduled_id = %row.id,
                session_id = %row.session_id,
                error = %e,
                "Scheduled message failed"
            );
            (
                RowResult::Failed,
                scheduled.mark_failed(row.id, &e.to_string(), engine.now()).await,
            )
        }
    };
    if let Err(e) = recorded {
        error!(scheduled_id = %row.id, error = %e, "Failed to record scheduled message outcome");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use uuid::Uuid;

    use journey_core::config::EngineConfig;
    use journey_core::types::{
        DelayStep, MessageStep, ScheduledStatus, SessionStatus, StepDraft, StepKind,
        TimeoutAction, WaitForReplyStep, WorkflowDefinition, WorkflowStatus,
    };
    use journey_engine::admin::WorkflowConfigUpdate;
    use journey_engine::capabilities::{ManualClock, RecordingSender};
    use journey_engine::{Clock, JourneyAdmin, StartRequest};
    use journey_store::{MemoryStore, ScheduledMessageStore, SessionStore, Stores};

    struct Fixture {
        store: Arc<MemoryStore>,
        sender: Arc<RecordingSender>,
        clock: Arc<ManualClock>,
        engine: JourneyEngine,
        admin: JourneyAdmin,
        tenant: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::from_backend(store.clone());
        let sender = Arc::new(RecordingSender::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = JourneyEngine::new(stores.clone(), sender.clone(), EngineConfig::default())
            .with_clock(clock.clone());
        Fixture {
            store,
            sender,
            clock,
            engine,
            admin: JourneyAdmin::new(stores),
            tenant: Uuid::new_v4(),
        }
    }

    fn message(order: i32, text: &str, delay_secs: u32) -> StepDraft {
        StepDraft {
            order,
            kind: StepKind::Message(MessageStep {
                text: text.into(),
                delay_secs,
            }),
        }
    }

    fn fixed_delay(order: i32, minutes: u32) -> StepDraft {
        StepDraft {
            order,
            kind: StepKind::Delay(DelayStep {
                min_minutes: minutes,
                max_minutes: minutes,
            }),
        }
    }

    impl Fixture {
        fn sweeper(&self) -> Arc<Sweeper> {
            Arc::new(Sweeper::new(self.engine.clone(), SchedulerConfig::default()))
        }

        async fn workflow(&self, steps: Vec<StepDraft>) -> WorkflowDefinition {
            let wf = self
                .admin
                .create_workflow(WorkflowDefinition::new(self.tenant, Uuid::new_v4(), "Nurture"))
                .await
                .unwrap();
            self.admin.replace_steps(wf.id, steps).await.unwrap();
            self.admin
                .update_workflow_status(wf.id, WorkflowStatus::Active)
                .await
                .unwrap()
        }

        async fn start(&self, workflow: &WorkflowDefinition, user_id: i64) -> Session {
            self.engine
                .start_journey_for_user(StartRequest {
                    tenant_id: self.tenant,
                    workflow_id: workflow.id,
                    conversation_id: user_id,
                    user_id,
                    display_name: "Grace".into(),
                })
                .await
                .unwrap()
                .session()
                .clone()
        }

        async fn status(&self, session_id: Uuid) -> SessionStatus {
            self.store.get_session(session_id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn test_tick_sends_due_message() {
        let f = fixture();
        let wf = f.workflow(vec![message(1, "Ten minutes later", 600)]).await;
        let session = f.start(&wf, 1).await;
        let sweeper = f.sweeper();

        assert!(sweeper.tick().await.is_idle());

        f.clock.advance(chrono::Duration::minutes(11));
        let report = sweeper.tick().await;
        assert_eq!(report.due_claimed, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(f.sender.texts(), vec!["Ten minutes later"]);
        assert_eq!(f.status(session.id).await, SessionStatus::Completed);

        let rows = f.store.list_for_session(session.id).await.unwrap();
        assert_eq!(rows[0].status, ScheduledStatus::Sent);
        assert!(rows[0].sent_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_cancels_rows_of_closed_sessions() {
        let f = fixture();
        let wf = f.workflow(vec![message(1, "Too late", 600)]).await;
        let mut session = f.start(&wf, 2).await;
        f.engine.complete_session(&mut session).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(11));
        let report = f.sweeper().tick().await;
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.sent, 0);
        assert_eq!(f.sender.count(), 0);

        let rows = f.store.list_for_session(session.id).await.unwrap();
        assert_eq!(rows[0].status, ScheduledStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failed_send_is_recorded_and_recovered() {
        let f = fixture();
        let wf = f
            .workflow(vec![fixed_delay(1, 5), message(2, "After the pause", 0)])
            .await;
        let session = f.start(&wf, 3).await;
        f.sender.fail_next(1);

        f.clock.advance(chrono::Duration::minutes(6));
        let report = f.sweeper().tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.recovered, 1);

        let rows = f.store.list_for_session(session.id).await.unwrap();
        assert_eq!(rows[0].status, ScheduledStatus::Failed);
        assert!(rows[0].error.is_some());
        assert_eq!(f.sender.texts(), vec!["After the pause"]);
        assert_eq!(f.status(session.id).await, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_expired_wait_is_resolved() {
        let f = fixture();
        let wf = f
            .workflow(vec![
                StepDraft {
                    order: 1,
                    kind: StepKind::WaitForReply(WaitForReplyStep {
                        text: Some("Are you still interested?".into()),
                        delay_secs: 0,
                        timeout_minutes: Some(5),
                        timeout_action: TimeoutAction::End,
                        timeout_message: Some("Maybe next time, {name}.".into()),
                        branch: None,
                    }),
                },
                message(2, "Unreachable", 0),
            ])
            .await;
        let session = f.start(&wf, 4).await;
        let sweeper = f.sweeper();

        f.clock.advance(chrono::Duration::minutes(4));
        assert_eq!(sweeper.tick().await.timeouts, 0);

        f.clock.advance(chrono::Duration::minutes(2));
        let report = sweeper.tick().await;
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.timeout_errors, 0);
        assert_eq!(f.status(session.id).await, SessionStatus::Completed);
        assert_eq!(
            f.sender.texts(),
            vec!["Are you still interested?", "Maybe next time, Grace."]
        );

        assert_eq!(sweeper.tick().await.timeouts, 0);
    }

    #[tokio::test]
    async fn test_expired_claim_is_reconciled_then_recovered() {
        let f = fixture();
        let wf = f
            .workflow(vec![fixed_delay(1, 5), message(2, "Delivered at least once", 0)])
            .await;
        let session = f.start(&wf, 5).await;

        // A worker claims the row and dies before marking it.
        f.clock.advance(chrono::Duration::minutes(6));
        let claimed = f
            .store
            .claim_due_messages(f.clock.now(), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let sweeper = f.sweeper();
        let report = sweeper.tick().await;
        assert_eq!(report.reconciled, 0);
        assert_eq!(report.recovered, 0);

        f.clock.advance(chrono::Duration::minutes(11));
        let report = sweeper.tick().await;
        assert_eq!(report.due_claimed, 0);
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(f.sender.texts(), vec!["Delivered at least once"]);
        assert_eq!(f.status(session.id).await, SessionStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sweepers_send_each_row_once() {
        let f = fixture();
        let wf = f.workflow(vec![message(1, "Scheduled hello", 600)]).await;
        for user_id in 0..30 {
            f.start(&wf, 100 + user_id).await;
        }
        f.clock.advance(chrono::Duration::minutes(11));

        let sweepers: Vec<Arc<Sweeper>> = (0..3).map(|_| f.sweeper()).collect();
        let handles: Vec<_> = sweepers
            .iter()
            .map(|sweeper| {
                let sweeper = sweeper.clone();
                tokio::spawn(async move { sweeper.tick().await })
            })
            .collect();

        let mut claimed = 0;
        let mut sent = 0;
        for handle in handles {
            let report = handle.await.unwrap();
            claimed += report.due_claimed;
            sent += report.sent;
        }
        // Whatever the first wave left is picked up by the next tick.
        let report = sweepers[0].tick().await;
        claimed += report.due_claimed;
        sent += report.sent;

        assert_eq!(claimed, 30);
        assert_eq!(sent, 30);
        assert_eq!(f.sender.count(), 30);
    }

    #[tokio::test]
    async fn test_sweep_inactive_breaks_idle_sessions() {
        let f = fixture();
        let wf = f.workflow(vec![message(1, "Never sent", 600)]).await;
        f.admin
            .update_workflow_config(
                wf.id,
                WorkflowConfigUpdate {
                    inactivity_timeout_days: Some(Some(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let session = f.start(&wf, 6).await;
        let sweeper = f.sweeper();

        let report = sweeper.sweep_inactive().await;
        assert_eq!(report.workflows, 1);
        assert_eq!(report.broken, 0);

        f.clock.advance(chrono::Duration::days(2));
        let report = sweeper.sweep_inactive().await;
        assert_eq!(report.broken, 1);
        assert_eq!(f.status(session.id).await, SessionStatus::Broken);

        let rows = f.store.list_for_session(session.id).await.unwrap();
        assert_eq!(rows[0].status, ScheduledStatus::Cancelled);
        assert!(sweeper.tick().await.is_idle());
    }

    #[tokio::test]
    async fn test_start_refuses_second_loop_and_shuts_down() {
        let f = fixture();
        let sweeper = Arc::new(Sweeper::new(
            f.engine.clone(),
            SchedulerConfig {
                tick_interval_secs: 1,
                ..SchedulerConfig::default()
            },
        ));

        let handle = sweeper.start().unwrap();
        assert!(sweeper.is_running());
        assert!(sweeper.start().is_err());

        sweeper.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!sweeper.is_running());
    }
}
