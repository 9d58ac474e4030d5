//! Shared state for one send task: the task record itself and the context
//! handed to its execution loop.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::AccountConnection;
use crate::reconnect::ReconnectSupervisor;
use crate::types::{AccountId, Event, OwnerId, TaskId, TaskState, TaskStatus, TaskSubmission};

/// Mutable terminal bookkeeping, guarded together so transitions are atomic
struct TaskControl {
    state: TaskState,
    ended_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// One bulk-send job.
///
/// The descriptor (payload, target, cadence) is immutable once created; only
/// the progress counters and the lifecycle state move. All mutation goes
/// through the execution loop except [`request_stop`](SendTask::request_stop),
/// which is the one external signal.
pub(crate) struct SendTask {
    task_id: TaskId,
    owner_id: OwnerId,
    account_id: AccountId,
    /// Deliverable address, resolved from the raw target at creation
    resolved_target: String,
    delay: Duration,
    prefix: Option<String>,
    messages: Vec<String>,
    /// Temporary upload backing the payload, removed exactly once at the end
    payload_path: Option<PathBuf>,
    started_at: DateTime<Utc>,

    sent: AtomicU32,
    failed: AtomicU32,
    control: Mutex<TaskControl>,

    /// Cancelled by `request_stop`; every wait in the loop selects on it
    stop: CancellationToken,
    payload_removed: AtomicBool,
}

impl SendTask {
    /// Build a task from an already-validated submission.
    ///
    /// The submission is expected to be normalized: non-empty trimmed
    /// messages, blank prefix collapsed to `None`.
    pub(crate) fn new(task_id: TaskId, submission: TaskSubmission) -> Self {
        let resolved_target = submission.target_kind.resolve_address(&submission.target);
        Self {
            task_id,
            owner_id: submission.owner_id,
            account_id: submission.account_id,
            resolved_target,
            delay: Duration::from_secs(submission.delay_seconds),
            prefix: submission.prefix,
            messages: submission.messages,
            payload_path: submission.payload_path,
            started_at: Utc::now(),
            sent: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            control: Mutex::new(TaskControl {
                state: TaskState::Running,
                ended_at: None,
                last_error: None,
            }),
            stop: CancellationToken::new(),
            payload_removed: AtomicBool::new(false),
        }
    }

    pub(crate) fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub(crate) fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub(crate) fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub(crate) fn resolved_target(&self) -> &str {
        &self.resolved_target
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    pub(crate) fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub(crate) fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Total messages in the payload, fixed at creation
    pub(crate) fn total(&self) -> u32 {
        self.messages.len() as u32
    }

    pub(crate) fn sent_count(&self) -> u32 {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn failed_count(&self) -> u32 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Delivered fraction of the payload, rounded to whole percent
    pub(crate) fn progress_percent(&self) -> u8 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        ((f64::from(self.sent_count()) * 100.0) / f64::from(total)).round() as u8
    }

    /// Token every wait in the execution loop selects on
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) async fn state(&self) -> TaskState {
        self.control.lock().await.state
    }

    /// Record one successful delivery; returns the new sent count
    pub(crate) fn record_sent(&self) -> u32 {
        self.sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record one skipped message and remember its error
    pub(crate) async fn record_skip(&self, error: &str) -> u32 {
        let failed = self.failed.fetch_add(1, Ordering::Relaxed) + 1;
        self.control.lock().await.last_error = Some(error.to_string());
        failed
    }

    /// External stop signal.
    ///
    /// Transitions `Running -> StopRequested` and wakes every wait in the
    /// loop. Returns false without touching anything when the task is already
    /// stopping or terminal, so repeated calls are harmless.
    pub(crate) async fn request_stop(&self) -> bool {
        {
            let mut control = self.control.lock().await;
            if control.state != TaskState::Running {
                return false;
            }
            control.state = TaskState::StopRequested;
        }
        self.stop.cancel();
        true
    }

    /// Terminal transition, applied once.
    ///
    /// An observed stop request wins over any other exit reason: the task
    /// ends `Stopped` even when the loop was about to fail, though the error
    /// is still recorded. Otherwise an error means `Failed` and a clean exit
    /// means `Completed`. `ended_at` is set on the first terminal transition
    /// and never again.
    pub(crate) async fn finish(&self, error: Option<String>) -> TaskState {
        let mut control = self.control.lock().await;
        if control.state.is_terminal() {
            return control.state;
        }

        let stop_requested = control.state == TaskState::StopRequested;
        if let Some(error) = error {
            control.last_error = Some(error);
            control.state = if stop_requested {
                TaskState::Stopped
            } else {
                TaskState::Failed
            };
        } else if stop_requested {
            control.state = TaskState::Stopped;
        } else {
            control.state = TaskState::Completed;
        }

        if control.ended_at.is_none() {
            control.ended_at = Some(Utc::now());
        }
        control.state
    }

    /// Whether the task reached a terminal state at or before `cutoff`
    pub(crate) async fn ended_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.control
            .lock()
            .await
            .ended_at
            .is_some_and(|ended| ended <= cutoff)
    }

    pub(crate) async fn snapshot(&self) -> TaskStatus {
        let control = self.control.lock().await;
        TaskStatus {
            task_id: self.task_id,
            account_id: self.account_id.clone(),
            target: self.resolved_target.clone(),
            state: control.state,
            sent_count: self.sent_count(),
            failed_count: self.failed_count(),
            total_count: self.total(),
            progress_percent: self.progress_percent(),
            started_at: self.started_at,
            ended_at: control.ended_at,
            last_error: control.last_error.clone(),
        }
    }

    /// Remove the temporary payload file, exactly once across all exit paths.
    ///
    /// A missing file is not an error; anything else is logged and swallowed
    /// so cleanup never disturbs terminal bookkeeping.
    pub(crate) async fn cleanup_payload(&self) {
        if self.payload_removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(path) = &self.payload_path else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(task_id = self.task_id.get(), path = %path.display(), "removed payload file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    task_id = self.task_id.get(),
                    path = %path.display(),
                    error = %e,
                    "failed to remove payload file"
                );
            }
        }
    }
}

/// Everything the execution loop needs, bundled for the spawn call
pub(crate) struct SendTaskContext {
    pub(crate) task: Arc<SendTask>,
    /// Shared connection; sends are serialized inside it
    pub(crate) connection: AccountConnection,
    pub(crate) supervisor: ReconnectSupervisor,
    pub(crate) config: Arc<Config>,
    pub(crate) event_tx: broadcast::Sender<Event>,
}

impl SendTaskContext {
    /// Emit an event to all subscribers; dropped silently with no listeners
    pub(crate) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}
