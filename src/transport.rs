//! Transport abstraction -- the seam between the engine and the wire protocol.
//!
//! The engine never speaks the messaging protocol itself. A real transport
//! (backed by whatever protocol library the embedding application uses)
//! implements [`MessageTransport`] and [`TransportConnection`]; the crate
//! ships [`InMemoryTransport`], a loopback implementation used by the test
//! suite and useful for embedding demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::GroupInfo;

/// Error surfaced by a transport implementation
///
/// The engine's whole retry strategy hinges on this two-way classification:
/// recoverable errors trigger reconnect-and-retry, fatal errors terminate the
/// connection and every task on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Expected to clear after a reconnect (network blip, idle timeout)
    #[error("recoverable transport failure: {0}")]
    Recoverable(String),

    /// The session itself is invalid (logged out, credentials revoked);
    /// reconnecting cannot help
    #[error("fatal transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether this error invalidates the session rather than the link
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal(_))
    }
}

/// Event pushed by a live transport connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The link dropped without a send in flight. The embedded error's
    /// classification decides whether the connection is recoverable.
    Closed {
        /// Why the transport considers the link gone
        error: TransportError,
    },
}

/// Opaque session material produced by the external pairing subsystem
///
/// The engine never inspects the blob; it is handed verbatim to
/// [`MessageTransport::connect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCredentials {
    /// Serialized session state as the pairing layer produced it
    pub session: serde_json::Value,
}

impl AccountCredentials {
    /// Wrap a session blob
    pub fn new(session: serde_json::Value) -> Self {
        Self { session }
    }
}

/// Factory for live connections, one per paired account
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Establish a connection using previously paired credentials.
    ///
    /// A [`TransportError::Fatal`] return means the credentials themselves
    /// are invalid and the account needs external re-pairing.
    async fn connect(
        &self,
        credentials: &AccountCredentials,
    ) -> Result<Box<dyn TransportConnection>, TransportError>;
}

/// One live link to the messaging service
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Deliver a single text message to an already-resolved address
    async fn send_text(&self, recipient: &str, body: &str) -> Result<(), TransportError>;

    /// List the groups the account participates in
    async fn list_groups(&self) -> Result<Vec<GroupInfo>, TransportError>;

    /// Subscribe to connection-level events (remote closes etc.)
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Close the link; idempotent
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// In-memory loopback transport
// ---------------------------------------------------------------------------

/// A delivery recorded by [`InMemoryTransport`]
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    /// Resolved address the message was sent to
    pub recipient: String,

    /// Final composed body
    pub body: String,

    /// When the transport accepted the send
    pub at: Instant,
}

#[derive(Default)]
struct MemoryState {
    deliveries: std::sync::Mutex<Vec<RecordedDelivery>>,
    send_script: std::sync::Mutex<VecDeque<Result<(), TransportError>>>,
    connect_script: std::sync::Mutex<VecDeque<Result<(), TransportError>>>,
    fail_all_sends: std::sync::Mutex<Option<TransportError>>,
    fail_all_connects: std::sync::Mutex<Option<TransportError>>,
    groups: std::sync::Mutex<Vec<GroupInfo>>,
    connect_count: AtomicU32,
}

/// Loopback [`MessageTransport`] that records deliveries in memory.
///
/// Outcomes can be scripted per call (`script_send_outcome`) or switched
/// wholesale (`fail_all_sends`), which is how the test suite exercises the
/// retry and reconnect paths without a wire protocol.
pub struct InMemoryTransport {
    state: Arc<MemoryState>,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Create a transport that accepts every connect and send
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            state: Arc::new(MemoryState::default()),
            event_tx,
        }
    }

    /// Queue the outcome of the next unscripted send (FIFO)
    pub fn script_send_outcome(&self, outcome: Result<(), TransportError>) {
        lock_unpoisoned(&self.state.send_script).push_back(outcome);
    }

    /// Queue the outcome of the next connect attempt (FIFO); `Ok` entries
    /// let the attempt through
    pub fn script_connect_outcome(&self, outcome: Result<(), TransportError>) {
        lock_unpoisoned(&self.state.connect_script).push_back(outcome);
    }

    /// Fail every send with `error` until cleared with [`Self::heal`]
    pub fn fail_all_sends(&self, error: TransportError) {
        *lock_unpoisoned(&self.state.fail_all_sends) = Some(error);
    }

    /// Fail every connect with `error` until cleared with [`Self::heal`]
    pub fn fail_all_connects(&self, error: TransportError) {
        *lock_unpoisoned(&self.state.fail_all_connects) = Some(error);
    }

    /// Clear both fail-all modes; scripted outcomes are unaffected
    pub fn heal(&self) {
        *lock_unpoisoned(&self.state.fail_all_sends) = None;
        *lock_unpoisoned(&self.state.fail_all_connects) = None;
    }

    /// Replace the group list reported by `list_groups`
    pub fn set_groups(&self, groups: Vec<GroupInfo>) {
        *lock_unpoisoned(&self.state.groups) = groups;
    }

    /// Snapshot of everything delivered so far, in acceptance order
    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        lock_unpoisoned(&self.state.deliveries).clone()
    }

    /// How many connect attempts reached the transport
    pub fn connect_count(&self) -> u32 {
        self.state.connect_count.load(Ordering::Relaxed)
    }

    /// Push a connection-level event to every live subscriber
    pub fn inject_event(&self, event: TransportEvent) {
        self.event_tx.send(event).ok();
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn connect(
        &self,
        _credentials: &AccountCredentials,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        self.state.connect_count.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = lock_unpoisoned(&self.state.fail_all_connects).clone() {
            return Err(error);
        }
        if let Some(outcome) = lock_unpoisoned(&self.state.connect_script).pop_front() {
            outcome?;
        }

        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    state: Arc<MemoryState>,
    event_tx: broadcast::Sender<TransportEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn send_text(&self, recipient: &str, body: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Recoverable("connection closed".into()));
        }
        if let Some(error) = lock_unpoisoned(&self.state.fail_all_sends).clone() {
            return Err(error);
        }
        if let Some(outcome) = lock_unpoisoned(&self.state.send_script).pop_front() {
            outcome?;
        }

        lock_unpoisoned(&self.state.deliveries).push(RecordedDelivery {
            recipient: recipient.to_string(),
            body: body.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<GroupInfo>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Recoverable("connection closed".into()));
        }
        Ok(lock_unpoisoned(&self.state.groups).clone())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Lock a std mutex, recovering the data from a poisoned lock.
///
/// The loopback state is plain data; a panic mid-update cannot leave it in a
/// state worse than what the panicking test already observed.
fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> AccountCredentials {
        AccountCredentials::new(serde_json::json!({ "session": "test" }))
    }

    #[tokio::test]
    async fn loopback_records_deliveries_in_order() {
        let transport = InMemoryTransport::new();
        let conn = transport.connect(&credentials()).await.unwrap();

        conn.send_text("a@s.whatsapp.net", "first").await.unwrap();
        conn.send_text("a@s.whatsapp.net", "second").await.unwrap();

        let deliveries = transport.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].body, "first");
        assert_eq!(deliveries[1].body, "second");
    }

    #[tokio::test]
    async fn scripted_send_outcome_is_consumed_once() {
        let transport = InMemoryTransport::new();
        let conn = transport.connect(&credentials()).await.unwrap();
        transport.script_send_outcome(Err(TransportError::Recoverable("blip".into())));

        let first = conn.send_text("x@g.us", "m").await;
        assert_eq!(
            first,
            Err(TransportError::Recoverable("blip".into())),
            "scripted failure must apply to the next send"
        );

        let second = conn.send_text("x@g.us", "m").await;
        assert!(second.is_ok(), "script entries must not repeat");
        assert_eq!(transport.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn closed_connection_rejects_sends() {
        let transport = InMemoryTransport::new();
        let conn = transport.connect(&credentials()).await.unwrap();
        conn.close().await;

        let result = conn.send_text("x@g.us", "m").await;
        assert!(
            matches!(result, Err(TransportError::Recoverable(_))),
            "sends after close must fail recoverably, got {result:?}"
        );
    }

    #[tokio::test]
    async fn injected_events_reach_subscribers() {
        let transport = InMemoryTransport::new();
        let conn = transport.connect(&credentials()).await.unwrap();
        let mut events = conn.events();

        transport.inject_event(TransportEvent::Closed {
            error: TransportError::Recoverable("remote hangup".into()),
        });

        let event = events.try_recv().unwrap();
        let TransportEvent::Closed { error } = event;
        assert!(!error.is_fatal());
    }

    #[tokio::test]
    async fn fail_all_connects_until_healed() {
        let transport = InMemoryTransport::new();
        transport.fail_all_connects(TransportError::Recoverable("down".into()));

        assert!(transport.connect(&credentials()).await.is_err());
        assert!(transport.connect(&credentials()).await.is_err());

        transport.heal();
        assert!(transport.connect(&credentials()).await.is_ok());
        assert_eq!(transport.connect_count(), 3);
    }

    #[test]
    fn fatal_classification() {
        assert!(TransportError::Fatal("logged out".into()).is_fatal());
        assert!(!TransportError::Recoverable("reset".into()).is_fatal());
    }
}
