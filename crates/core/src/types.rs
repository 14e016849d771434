use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Answer key seeded with the user's display name when a session starts.
pub const ANSWER_FIRST_NAME: &str = "first_name";
/// Answer key holding the most recent free-text reply.
pub const ANSWER_LAST_REPLY: &str = "last_reply";
/// Answer key holding every free-text reply, oldest first.
pub const ANSWER_REPLIES: &str = "replies";

pub const RESERVED_ANSWER_KEYS: [&str; 3] = [ANSWER_FIRST_NAME, ANSWER_LAST_REPLY, ANSWER_REPLIES];

// ─── Workflow definition ────────────────────────────────────────────────

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Stopped,
}

/// What happens when a user triggers a workflow they are already running.
///
/// `allow` is accepted for stored definitions and behaves as `restart`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReEntryPolicy {
    /// Keep the running session and ignore the new trigger.
    #[default]
    Block,
    /// Cancel the running session and start over.
    #[serde(alias = "allow")]
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub bot_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub re_entry_policy: ReEntryPolicy,
    pub welcome_message: Option<String>,
    pub welcome_delay_secs: u32,
    /// Higher priority wins when several keyword triggers match.
    pub priority: i32,
    /// Locked workflows are skipped by keyword resolution.
    pub locked: bool,
    pub inactivity_timeout_days: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// A draft workflow with no welcome message and the `block` policy.
    pub fn new(tenant_id: Uuid, bot_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            bot_id,
            name: name.into(),
            status: WorkflowStatus::Draft,
            re_entry_policy: ReEntryPolicy::Block,
            welcome_message: None,
            welcome_delay_secs: 0,
            priority: 0,
            locked: false,
            inactivity_timeout_days: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Configured welcome text, ignoring blank values.
    pub fn welcome_text(&self) -> Option<&str> {
        self.welcome_message
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

// ─── Steps ──────────────────────────────────────────────────────────────

/// Discriminant of [`StepKind`], persisted alongside scheduled payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Message,
    Question,
    Delay,
    WaitForReply,
    Conditional,
}

/// How a question answer is validated and converted before storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    #[default]
    Text,
    Number,
    Money,
    #[serde(alias = "country_code")]
    Country,
}

/// What a timed-out `wait_for_reply` step does when no reply arrived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Continue,
    End,
}

/// Keyword test on a reply. Targets are step orders within the same
/// workflow; `None` means "continue with the next step".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRule {
    pub keyword: String,
    #[serde(default)]
    pub on_match: Option<i32>,
    #[serde(default)]
    pub on_miss: Option<i32>,
}

impl BranchRule {
    pub fn targets(&self) -> impl Iterator<Item = i32> + '_ {
        self.on_match.into_iter().chain(self.on_miss)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStep {
    pub text: String,
    #[serde(default)]
    pub delay_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionStep {
    pub text: String,
    #[serde(default)]
    pub delay_secs: u32,
    pub answer_key: String,
    #[serde(default)]
    pub validation: AnswerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayStep {
    pub min_minutes: u32,
    pub max_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitForReplyStep {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub delay_secs: u32,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub timeout_action: TimeoutAction,
    #[serde(default)]
    pub timeout_message: Option<String>,
    #[serde(default)]
    pub branch: Option<BranchRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalStep {
    #[serde(default)]
    pub branch: Option<BranchRule>,
}

/// Typed configuration of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Message(MessageStep),
    Question(QuestionStep),
    Delay(DelayStep),
    WaitForReply(WaitForReplyStep),
    Conditional(ConditionalStep),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Message(_) => StepType::Message,
            StepKind::Question(_) => StepType::Question,
            StepKind::Delay(_) => StepType::Delay,
            StepKind::WaitForReply(_) => StepType::WaitForReply,
            StepKind::Conditional(_) => StepType::Conditional,
        }
    }

    /// Body text sent when the step runs, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            StepKind::Message(s) => Some(s.text.as_str()),
            StepKind::Question(s) => Some(s.text.as_str()),
            StepKind::WaitForReply(s) => s.text.as_deref(),
            StepKind::Delay(_) | StepKind::Conditional(_) => None,
        }
    }

    /// Fixed delay applied before the step's text is sent.
    pub fn delay_secs(&self) -> u32 {
        match self {
            StepKind::Message(s) => s.delay_secs,
            StepKind::Question(s) => s.delay_secs,
            StepKind::WaitForReply(s) => s.delay_secs,
            StepKind::Delay(_) | StepKind::Conditional(_) => 0,
        }
    }

    pub fn branch(&self) -> Option<&BranchRule> {
        match self {
            StepKind::WaitForReply(s) => s.branch.as_ref(),
            StepKind::Conditional(s) => s.branch.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Position in the linear sequence; unique within a workflow.
    pub order: i32,
    pub kind: StepKind,
    pub sent_count: i64,
}

/// A step as submitted by an author, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub order: i32,
    pub kind: StepKind,
}

// ─── Triggers ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// `/start <param>` deep link.
    DeeplinkParam,
    /// Keyword contained in a direct message.
    KeywordDm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: Uuid,
    pub trigger_type: TriggerType,
    pub config: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(
        tenant_id: Uuid,
        workflow_id: Uuid,
        trigger_type: TriggerType,
        config: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            tenant_id,
            trigger_type,
            config,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deep-link parameter, read from `start_param` or the older `param` key.
    pub fn deeplink_param(&self) -> Option<&str> {
        ["start_param", "param"]
            .iter()
            .find_map(|key| self.config.get(*key).and_then(|v| v.as_str()))
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// Keyword to look for; an empty or missing keyword matches everything.
    pub fn keyword(&self) -> &str {
        self.config
            .get("keyword")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("")
    }
}

// ─── Sessions ───────────────────────────────────────────────────────────

/// Runtime status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WaitingDelay,
    AwaitingReply,
    Completed,
    Cancelled,
    Broken,
}

impl SessionStatus {
    pub const OPEN: [SessionStatus; 3] = [
        SessionStatus::Active,
        SessionStatus::WaitingDelay,
        SessionStatus::AwaitingReply,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Broken
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub conversation_id: i64,
    pub user_id: i64,
    pub current_step_id: Option<Uuid>,
    pub status: SessionStatus,
    pub answers: HashMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub welcome_sent_at: Option<DateTime<Utc>>,
    pub reply_received_at: Option<DateTime<Utc>>,
    pub wait_timeout_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every write. A save carrying an older
    /// version is rejected.
    #[serde(default)]
    pub version: i64,
}

impl Session {
    pub fn new(
        tenant_id: Uuid,
        workflow_id: Uuid,
        conversation_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_id,
            conversation_id,
            user_id,
            current_step_id: None,
            status: SessionStatus::Active,
            answers: HashMap::new(),
            started_at: now,
            completed_at: None,
            last_activity_at: now,
            welcome_sent_at: None,
            reply_received_at: None,
            wait_timeout_at: None,
            version: 0,
        }
    }

    pub fn first_name(&self) -> &str {
        self.answers
            .get(ANSWER_FIRST_NAME)
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    pub fn last_reply(&self) -> Option<&str> {
        self.answers.get(ANSWER_LAST_REPLY).and_then(|v| v.as_str())
    }

    /// Appends a free-text reply to the history and updates the last reply.
    pub fn record_reply(&mut self, text: &str, at: DateTime<Utc>) {
        let history = self
            .answers
            .entry(ANSWER_REPLIES.to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        match history {
            serde_json::Value::Array(items) => items.push(serde_json::Value::from(text)),
            other => *other = serde_json::json!([text]),
        }
        self.answers
            .insert(ANSWER_LAST_REPLY.to_string(), serde_json::Value::from(text));
        self.reply_received_at = Some(at);
        self.last_activity_at = at;
    }
}

// ─── Scheduled messages ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

/// Content snapshot of a scheduled continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduledPayload {
    Step {
        text: Option<String>,
        step_type: StepType,
    },
    WelcomeAndStep {
        welcome_text: String,
        text: Option<String>,
        step_type: StepType,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: Uuid,
    pub step_id: Uuid,
    pub conversation_id: i64,
    pub payload: ScheduledPayload,
    pub fire_at: DateTime<Utc>,
    pub status: ScheduledStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn new(
        session: &Session,
        step_id: Uuid,
        payload: ScheduledPayload,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: session.tenant_id,
            session_id: session.id,
            step_id,
            conversation_id: session.conversation_id,
            payload,
            fire_at,
            status: ScheduledStatus::Pending,
            claimed_at: None,
            sent_at: None,
            error: None,
            created_at: now,
        }
    }
}

// ─── Text codes for relational storage ──────────────────────────────────

/// Lower-case string code of a unit enum, matching its serde name.
pub trait StatusCode: Sized + Copy + 'static {
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == code)
    }
}

impl StatusCode for WorkflowStatus {
    const ALL: &'static [Self] = &[Self::Draft, Self::Active, Self::Stopped];

    fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }
}

impl StatusCode for ReEntryPolicy {
    const ALL: &'static [Self] = &[Self::Block, Self::Restart];

    fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Restart => "restart",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "block" => Some(Self::Block),
            "restart" | "allow" => Some(Self::Restart),
            _ => None,
        }
    }
}

impl StatusCode for StepType {
    const ALL: &'static [Self] = &[
        Self::Message,
        Self::Question,
        Self::Delay,
        Self::WaitForReply,
        Self::Conditional,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Question => "question",
            Self::Delay => "delay",
            Self::WaitForReply => "wait_for_reply",
            Self::Conditional => "conditional",
        }
    }
}

impl StatusCode for TriggerType {
    const ALL: &'static [Self] = &[Self::DeeplinkParam, Self::KeywordDm];

    fn as_str(self) -> &'static str {
        match self {
            Self::DeeplinkParam => "deeplink_param",
            Self::KeywordDm => "keyword_dm",
        }
    }
}

impl StatusCode for SessionStatus {
    const ALL: &'static [Self] = &[
        Self::Active,
        Self::WaitingDelay,
        Self::AwaitingReply,
        Self::Completed,
        Self::Cancelled,
        Self::Broken,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WaitingDelay => "waiting_delay",
            Self::AwaitingReply => "awaiting_reply",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Broken => "broken",
        }
    }
}

impl StatusCode for ScheduledStatus {
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Processing,
        Self::Sent,
        Self::Failed,
        Self::Cancelled,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s).ok_or_else(|| format!("unknown session status: {s}"))
    }
}
