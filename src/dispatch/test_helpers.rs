//! Shared fixtures for the dispatch test suite.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::transport::{AccountCredentials, InMemoryTransport, MessageTransport};
use crate::types::{Event, TargetKind, TaskId, TaskStatus, TaskSubmission};

use super::BulkSender;

/// Engine wired to a fresh in-memory transport, with timings tuned so the
/// retry and reconnect paths resolve in milliseconds
pub(crate) fn create_test_sender() -> (BulkSender, Arc<InMemoryTransport>) {
    create_test_sender_with(test_config())
}

pub(crate) fn create_test_sender_with(config: Config) -> (BulkSender, Arc<InMemoryTransport>) {
    let transport = Arc::new(InMemoryTransport::new());
    let shared: Arc<dyn MessageTransport> = transport.clone();
    let sender = BulkSender::new(config, shared);
    (sender, transport)
}

pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.dispatch.max_send_attempts = 3;
    config.dispatch.send_timeout = Duration::from_millis(500);
    config.dispatch.recovery_wait = Duration::from_millis(200);
    config.reconnect.base_delay = Duration::from_millis(10);
    config.reconnect.max_delay = Duration::from_millis(40);
    config.reconnect.max_attempts = 3;
    config.reconnect.connect_timeout = Duration::from_millis(500);
    config.registry.retention = Duration::from_secs(3600);
    config.registry.sweep_interval = Duration::from_millis(50);
    config
}

pub(crate) fn test_credentials() -> AccountCredentials {
    AccountCredentials::new(serde_json::json!({ "session": "test" }))
}

/// Pair `account` for `owner`, panicking if the fixture transport refuses
pub(crate) async fn pair(sender: &BulkSender, owner: &str, account: &str) {
    sender
        .pair_account(owner.into(), account.into(), test_credentials())
        .await
        .expect("pairing must succeed in fixtures");
}

/// Minimal submission: individual target, zero cadence, no prefix
pub(crate) fn submission(owner: &str, account: &str, messages: &[&str]) -> TaskSubmission {
    TaskSubmission {
        owner_id: owner.into(),
        account_id: account.into(),
        target: "15551230001".into(),
        target_kind: TargetKind::Individual,
        delay_seconds: 0,
        prefix: None,
        messages: messages.iter().map(ToString::to_string).collect(),
        payload_path: None,
    }
}

/// Poll `task_status` until the task reaches a terminal state
pub(crate) async fn wait_for_terminal(
    sender: &BulkSender,
    owner: &str,
    task_id: TaskId,
    timeout: Duration,
) -> TaskStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = sender
            .task_status(owner.into(), task_id)
            .await
            .expect("task must stay queryable while waiting");
        if status.state.is_terminal() {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} still {:?} after {timeout:?}",
            task_id.get(),
            status.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive events until one matches, panicking after `timeout`
pub(crate) async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut matches: F,
) -> Event
where
    F: FnMut(&Event) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for a matching event");
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for a matching event")
            .expect("event channel closed while waiting");
        if matches(&event) {
            return event;
        }
    }
}
