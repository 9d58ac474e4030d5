//! Core types for bulksend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a send task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for i64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl PartialEq<i64> for TaskId {
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialEq<TaskId> for i64 {
    fn eq(&self, other: &TaskId) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of the user who owns an account or task
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    /// View the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable external identifier of a paired messaging account
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    /// View the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of a paired account
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No live transport link
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Live link, sends allowed
    Connected,
    /// Session credentials invalidated; requires external re-pairing
    AuthFailed,
}

impl ConnectionState {
    /// Whether the state has no outgoing transition inside the engine
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::AuthFailed)
    }
}

/// Lifecycle state of a send task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Execution loop is active
    Running,
    /// Stop was requested; the loop will exit at its next check
    StopRequested,
    /// Stopped on request before the payload was exhausted
    Stopped,
    /// Ran through the entire payload
    Completed,
    /// Terminated by a fatal or permanent failure
    Failed,
}

impl TaskState {
    /// Whether the task has finished and will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Stopped | TaskState::Completed | TaskState::Failed
        )
    }
}

/// Whether a send target is a single contact or a group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Direct message to one contact
    Individual,
    /// Message to a group the account participates in
    Group,
}

impl TargetKind {
    /// Address suffix for individual contacts
    pub const INDIVIDUAL_SUFFIX: &'static str = "@s.whatsapp.net";

    /// Address suffix for groups
    pub const GROUP_SUFFIX: &'static str = "@g.us";

    /// Canonical address suffix for this target kind
    pub fn canonical_suffix(&self) -> &'static str {
        match self {
            TargetKind::Individual => Self::INDIVIDUAL_SUFFIX,
            TargetKind::Group => Self::GROUP_SUFFIX,
        }
    }

    /// Resolve a raw target into a deliverable address.
    ///
    /// Appends the canonical suffix for this kind unless the target already
    /// carries a domain part. Idempotent: resolving an already-resolved
    /// address returns it unchanged.
    pub fn resolve_address(&self, target: &str) -> String {
        if target.contains('@') {
            target.to_string()
        } else {
            format!("{}{}", target, self.canonical_suffix())
        }
    }
}

/// A bulk-send request as handed over by the submission layer.
///
/// The boundary is expected to trim lines and drop empty ones before
/// constructing this; submission re-validates and rejects blank entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// User submitting the task
    pub owner_id: OwnerId,

    /// Paired account to send through
    pub account_id: AccountId,

    /// Raw recipient target (bare identifier or full address)
    pub target: String,

    /// Whether the target is an individual or a group
    pub target_kind: TargetKind,

    /// Seconds to wait between consecutive deliveries
    #[serde(default)]
    pub delay_seconds: u64,

    /// Optional prefix prepended to every message body
    #[serde(default)]
    pub prefix: Option<String>,

    /// Ordered message bodies, one delivery each
    pub messages: Vec<String>,

    /// Temporary upload backing this payload, deleted when the task ends
    #[serde(default)]
    pub payload_path: Option<PathBuf>,
}

/// Snapshot of one task's progress, as returned by status queries
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Unique task identifier
    pub task_id: TaskId,

    /// Account the task sends through
    pub account_id: AccountId,

    /// Resolved recipient address
    pub target: String,

    /// Current lifecycle state
    pub state: TaskState,

    /// Messages delivered so far
    pub sent_count: u32,

    /// Messages that exhausted their local attempts and were skipped
    pub failed_count: u32,

    /// Total messages in the payload (fixed at creation)
    pub total_count: u32,

    /// Delivered fraction of the payload, rounded to whole percent
    pub progress_percent: u8,

    /// When the execution loop started
    pub started_at: DateTime<Utc>,

    /// When the task reached a terminal state (None while running)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Most recent delivery or connection error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Event emitted during engine and task lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A task was registered and its loop spawned
    TaskStarted {
        /// Task ID
        id: TaskId,
        /// Account the task sends through
        account: AccountId,
        /// Total messages in the payload
        total: u32,
    },

    /// A delivery succeeded
    TaskProgress {
        /// Task ID
        id: TaskId,
        /// Messages delivered so far
        sent: u32,
        /// Messages skipped after exhausting local attempts
        failed: u32,
        /// Total messages in the payload
        total: u32,
        /// Delivered fraction, rounded to whole percent
        percent: u8,
    },

    /// A single message exhausted its local attempts and was skipped
    MessageFailed {
        /// Task ID
        id: TaskId,
        /// Zero-based payload index of the skipped message
        index: u32,
        /// Error from the final attempt
        error: String,
    },

    /// Task ran through the entire payload
    TaskCompleted {
        /// Task ID
        id: TaskId,
        /// Messages delivered
        sent: u32,
        /// Messages skipped
        failed: u32,
    },

    /// Task stopped on request before the payload was exhausted
    TaskStopped {
        /// Task ID
        id: TaskId,
        /// Messages delivered before the stop
        sent: u32,
    },

    /// Task terminated by a fatal or permanent failure
    TaskFailed {
        /// Task ID
        id: TaskId,
        /// Terminal error
        error: String,
        /// Messages delivered before the failure
        sent: u32,
    },

    /// A paired account's connection changed state
    ConnectionStateChanged {
        /// Account ID
        account: AccountId,
        /// New connection state
        state: ConnectionState,
    },

    /// The reconnect supervisor exhausted its attempt budget
    ReconnectExhausted {
        /// Account ID
        account: AccountId,
        /// Consecutive attempts made before giving up
        attempts: u32,
    },

    /// An account was paired and connected
    AccountPaired {
        /// Account ID
        account: AccountId,
    },

    /// An account was unpaired and its connection torn down
    AccountRemoved {
        /// Account ID
        account: AccountId,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// A group the paired account participates in
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group address (already carries the group suffix)
    pub id: String,

    /// Human-readable group subject
    pub subject: String,

    /// Number of participants, when the transport reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<usize>,
}

/// Connection state and health of a paired account
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountStatus {
    /// Account identifier
    pub account_id: AccountId,

    /// Current connection state
    pub state: ConnectionState,

    /// Last successful transport interaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,

    /// Send failures since the last success
    pub consecutive_failures: u32,
}
