//! Task intake: normalization, validation, registration, and launch.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::types::{ConnectionState, Event, TaskId, TaskStatus, TaskSubmission};

use super::BulkSender;
use super::send_task::{SendTask, SendTaskContext, run_send_task};

impl BulkSender {
    /// Submit a bulk-send task and start it immediately
    ///
    /// Message lines are trimmed and empty lines dropped before validation;
    /// a prefix that trims to nothing counts as absent. The returned status
    /// is the task's initial snapshot; progress after that arrives through
    /// [`subscribe`](BulkSender::subscribe) or
    /// [`task_status`](BulkSender::task_status).
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the target is blank or no non-empty
    ///   message remains
    /// - [`Error::Forbidden`] if the account belongs to another owner
    /// - [`Error::NotFound`] if the account is not paired
    /// - [`Error::AuthFailed`] if the account's session has been invalidated
    /// - [`Error::ShuttingDown`] once shutdown has begun
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use bulksend::{BulkSender, TargetKind, TaskSubmission};
    /// # async fn example(sender: BulkSender) -> Result<(), Box<dyn std::error::Error>> {
    /// let status = sender
    ///     .submit(TaskSubmission {
    ///         owner_id: "user-1".into(),
    ///         account_id: "acct-1".into(),
    ///         target: "15551230001".into(),
    ///         target_kind: TargetKind::Individual,
    ///         delay_seconds: 5,
    ///         prefix: Some("[promo]".into()),
    ///         messages: vec!["first".into(), "second".into()],
    ///         payload_path: None,
    ///     })
    ///     .await?;
    /// println!("task {} covers {} messages", status.task_id.get(), status.total_count);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn submit(&self, mut submission: TaskSubmission) -> Result<TaskStatus> {
        if !self.tasks.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        normalize(&mut submission);
        validate(&submission)?;

        let entry = self
            .account_entry(&submission.owner_id, &submission.account_id)
            .await?;
        if entry.connection.state() == ConnectionState::AuthFailed {
            return Err(Error::AuthFailed {
                account: submission.account_id.clone(),
            });
        }

        let task_id = TaskId::new(self.tasks.next_task_id.fetch_add(1, Ordering::SeqCst) + 1);
        let task = Arc::new(SendTask::new(task_id, submission));
        {
            let mut tasks = self.tasks.tasks.lock().await;
            tasks.insert(task_id, Arc::clone(&task));
        }
        // Shutdown can flip the gate between the intake check and the
        // insert; a task that slipped through is stopped instead of
        // outliving the drain
        if !self.tasks.accepting_new.load(Ordering::SeqCst) {
            task.request_stop().await;
        }
        tracing::info!(
            task_id = task_id.get(),
            account = %task.account_id(),
            total = task.total(),
            "task accepted"
        );

        let snapshot = task.snapshot().await;
        self.launch_send_task(SendTaskContext {
            task,
            connection: entry.connection,
            supervisor: entry.supervisor,
            config: Arc::clone(&self.config),
            event_tx: self.event_tx.clone(),
        });
        Ok(snapshot)
    }

    /// Spawn the runner plus a monitor that turns a runner panic into a
    /// failed task instead of an entry wedged in `Running` forever.
    fn launch_send_task(&self, ctx: SendTaskContext) {
        let task = Arc::clone(&ctx.task);
        let event_tx = self.event_tx.clone();
        let runner = tokio::spawn(run_send_task(ctx));
        tokio::spawn(async move {
            let Err(join_error) = runner.await else {
                return;
            };
            if !join_error.is_panic() {
                return;
            }
            tracing::error!(
                task_id = task.task_id().get(),
                "send loop panicked, marking task failed"
            );
            let reason = "send loop panicked".to_string();
            task.finish(Some(reason.clone())).await;
            task.cleanup_payload().await;
            event_tx
                .send(Event::TaskFailed {
                    id: task.task_id(),
                    error: reason,
                    sent: task.sent_count(),
                })
                .ok();
        });
    }
}

fn normalize(submission: &mut TaskSubmission) {
    submission.target = submission.target.trim().to_string();
    submission.messages = submission
        .messages
        .iter()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    submission.prefix = submission
        .prefix
        .take()
        .map(|prefix| prefix.trim().to_string())
        .filter(|prefix| !prefix.is_empty());
}

fn validate(submission: &TaskSubmission) -> Result<()> {
    if submission.target.is_empty() {
        return Err(Error::Validation {
            message: "target must not be blank".to_string(),
            field: Some("target".to_string()),
        });
    }
    if submission.messages.is_empty() {
        return Err(Error::Validation {
            message: "at least one non-empty message is required".to_string(),
            field: Some("messages".to_string()),
        });
    }
    Ok(())
}
