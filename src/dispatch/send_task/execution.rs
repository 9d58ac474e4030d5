//! Send task execution -- the per-task delivery loop.

use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::reconnect::RecoveryWait;
use crate::transport::TransportError;
use crate::types::{Event, TaskState};

use super::context::SendTaskContext;

/// How one message's delivery ended after local attempts and recovery waits
enum DeliveryOutcome {
    /// The transport accepted the message
    Delivered,
    /// Local attempts exhausted without a fatal error; the loop moves on
    Skipped(String),
    /// The account session is invalid; the task cannot continue
    Fatal(String),
    /// The reconnect supervisor gave up on the connection
    ConnectionGone(String),
    /// A stop request arrived mid-delivery
    Cancelled,
}

/// Final body for one payload index. Composed exactly once per index;
/// retries reuse the composed body.
fn compose_body(prefix: Option<&str>, message: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix} {message}"),
        None => message.to_string(),
    }
}

/// Core send task -- drives one task's payload through the connection.
///
/// Phases:
/// 1. Announce the task and enter the index loop
/// 2. Per index: compose once, deliver with bounded local attempts,
///    record progress, then wait out the cadence delay
/// 3. Finalize state (stop wins over failure) and emit the terminal event
/// 4. Remove the payload file regardless of exit path
pub(crate) async fn run_send_task(ctx: SendTaskContext) {
    let task = &ctx.task;
    let task_id = task.task_id();
    let stop = task.stop_token();
    let total = task.total();
    let delay = task.delay();

    info!(
        task_id = task_id.get(),
        account = %task.account_id(),
        target = task.resolved_target(),
        total,
        delay_secs = delay.as_secs(),
        "send task started"
    );
    ctx.emit(Event::TaskStarted {
        id: task_id,
        account: task.account_id().clone(),
        total,
    });

    let mut terminal_error: Option<String> = None;

    for index in 0..task.messages().len() {
        if stop.is_cancelled() || task.state().await != TaskState::Running {
            break;
        }

        let body = compose_body(task.prefix(), &task.messages()[index]);

        match deliver_with_retry(&ctx, index as u32, &body).await {
            DeliveryOutcome::Delivered => {
                let sent = task.record_sent();
                debug!(task_id = task_id.get(), index, sent, "message delivered");
                ctx.emit(Event::TaskProgress {
                    id: task_id,
                    sent,
                    failed: task.failed_count(),
                    total,
                    percent: task.progress_percent(),
                });
            }
            DeliveryOutcome::Skipped(skip_error) => {
                let failed = task.record_skip(&skip_error).await;
                warn!(
                    task_id = task_id.get(),
                    index,
                    failed,
                    error = %skip_error,
                    "message skipped after exhausting local attempts"
                );
                ctx.emit(Event::MessageFailed {
                    id: task_id,
                    index: index as u32,
                    error: skip_error,
                });
                ctx.emit(Event::TaskProgress {
                    id: task_id,
                    sent: task.sent_count(),
                    failed,
                    total,
                    percent: task.progress_percent(),
                });
            }
            DeliveryOutcome::Fatal(fatal_error) => {
                terminal_error = Some(fatal_error);
                break;
            }
            DeliveryOutcome::ConnectionGone(lost_error) => {
                terminal_error = Some(lost_error);
                break;
            }
            DeliveryOutcome::Cancelled => break,
        }

        // Cadence delay between consecutive deliveries, skipped after the
        // last message. A stop request ends the wait immediately.
        if index + 1 < task.messages().len() && !delay.is_zero() {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    let final_state = task.finish(terminal_error.clone()).await;
    let sent = task.sent_count();
    let failed = task.failed_count();

    match final_state {
        TaskState::Completed => {
            info!(task_id = task_id.get(), sent, failed, "send task completed");
            ctx.emit(Event::TaskCompleted {
                id: task_id,
                sent,
                failed,
            });
        }
        TaskState::Stopped => {
            info!(task_id = task_id.get(), sent, "send task stopped on request");
            ctx.emit(Event::TaskStopped { id: task_id, sent });
        }
        TaskState::Failed => {
            let reason = terminal_error.unwrap_or_else(|| "unknown failure".to_string());
            error!(task_id = task_id.get(), sent, error = %reason, "send task failed");
            ctx.emit(Event::TaskFailed {
                id: task_id,
                error: reason,
                sent,
            });
        }
        // finish() only returns terminal states
        other => debug!(task_id = task_id.get(), state = ?other, "unexpected final state"),
    }

    task.cleanup_payload().await;
}

/// Deliver one composed message with up to `max_send_attempts` local attempts.
///
/// A recoverable failure hands the connection to the supervisor and parks on
/// recovery before the next attempt; the supervisor's give-up or auth verdict
/// ends the whole task, not just this message.
async fn deliver_with_retry(ctx: &SendTaskContext, index: u32, body: &str) -> DeliveryOutcome {
    let task = &ctx.task;
    let task_id = task.task_id();
    let recipient = task.resolved_target();
    let stop = task.stop_token();
    let max_attempts = ctx.config.dispatch.max_send_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if stop.is_cancelled() {
            return DeliveryOutcome::Cancelled;
        }

        let failure = match ctx.connection.send(recipient, body).await {
            Ok(()) => return DeliveryOutcome::Delivered,
            Err(Error::Transport(transport_error)) if transport_error.is_fatal() => {
                ctx.supervisor.notify_failure(&transport_error);
                return DeliveryOutcome::Fatal(transport_error.to_string());
            }
            Err(Error::Transport(transport_error)) => transport_error,
            Err(Error::NotConnected { .. }) => {
                // The link may be down or mid-reconnect; treat like a blip
                TransportError::Recoverable("no live connection".to_string())
            }
            Err(other) => {
                last_error = other.to_string();
                break;
            }
        };

        last_error = failure.to_string();
        warn!(
            task_id = task_id.get(),
            index,
            attempt,
            error = %last_error,
            "delivery attempt failed"
        );
        ctx.supervisor.notify_failure(&failure);

        if attempt == max_attempts {
            break;
        }

        match ctx
            .supervisor
            .wait_for_recovery(ctx.config.dispatch.recovery_wait, &stop)
            .await
        {
            RecoveryWait::Recovered => {}
            RecoveryWait::GaveUp { attempts } => {
                let cause = Error::ConnectionLost {
                    account: task.account_id().clone(),
                    attempts,
                };
                return DeliveryOutcome::ConnectionGone(cause.to_string());
            }
            RecoveryWait::AuthFailed => {
                let cause = Error::AuthFailed {
                    account: task.account_id().clone(),
                };
                return DeliveryOutcome::Fatal(cause.to_string());
            }
            RecoveryWait::TimedOut => {
                last_error = format!(
                    "{last_error} (connection not restored within {:?})",
                    ctx.config.dispatch.recovery_wait
                );
                break;
            }
            RecoveryWait::Cancelled => return DeliveryOutcome::Cancelled,
        }
    }

    DeliveryOutcome::Skipped(last_error)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_prepends_prefix_with_single_space() {
        assert_eq!(compose_body(Some("[promo]"), "hello"), "[promo] hello");
    }

    #[test]
    fn compose_without_prefix_leaves_message_untouched() {
        assert_eq!(compose_body(None, "hello"), "hello");
    }
}
