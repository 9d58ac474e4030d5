//! Account connection state machine.
//!
//! One [`AccountConnection`] wraps one live transport link. State transitions
//! are published on a watch channel so the reconnect supervisor, blocked task
//! loops, and health reporting all observe the same enumerable sequence:
//! `Disconnected -> Connecting -> Connected`, then back to `Disconnected` on
//! a recoverable close or to the terminal `AuthFailed` on a fatal one.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{
    AccountCredentials, MessageTransport, TransportConnection, TransportError, TransportEvent,
};
use crate::types::{AccountId, AccountStatus, ConnectionState, Event, GroupInfo, OwnerId};

/// One paired account's connection to the messaging service.
///
/// Cheap to clone; clones share the underlying state. Shared across every
/// task sending through the account. The internal send gate guarantees at
/// most one in-flight send per connection; the link mutex guarantees at most
/// one live transport handle per account.
#[derive(Clone)]
pub(crate) struct AccountConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    account_id: AccountId,
    owner_id: OwnerId,
    transport: Arc<dyn MessageTransport>,
    credentials: AccountCredentials,
    connect_timeout: Duration,
    send_timeout: Duration,

    /// The live transport handle, if any. Arc so a send can run without
    /// holding the lock across its await.
    link: Mutex<Option<Arc<dyn TransportConnection>>>,

    /// Serializes sends across all tasks on this connection
    send_gate: Mutex<()>,

    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<Event>,

    /// Cancels the transport-event listener of the current link
    listener_cancel: Mutex<Option<CancellationToken>>,
    lifecycle: CancellationToken,

    /// Millis since epoch of the last successful transport interaction; 0 = never
    last_activity_ms: AtomicI64,
    consecutive_failures: AtomicU32,
}

impl AccountConnection {
    /// Create a connection in the `Disconnected` state.
    ///
    /// `lifecycle` is the engine token; the transport-event listener runs as
    /// a child of it, so engine shutdown tears the listener down too.
    pub(crate) fn new(
        account_id: AccountId,
        owner_id: OwnerId,
        transport: Arc<dyn MessageTransport>,
        credentials: AccountCredentials,
        config: &Config,
        event_tx: broadcast::Sender<Event>,
        lifecycle: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ConnectionInner {
                account_id,
                owner_id,
                transport,
                credentials,
                connect_timeout: config.reconnect.connect_timeout,
                send_timeout: config.dispatch.send_timeout,
                link: Mutex::new(None),
                send_gate: Mutex::new(()),
                state_tx,
                event_tx,
                listener_cancel: Mutex::new(None),
                lifecycle,
                last_activity_ms: AtomicI64::new(0),
                consecutive_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Account this connection belongs to
    pub(crate) fn account_id(&self) -> &AccountId {
        &self.inner.account_id
    }

    /// Owner who paired the account
    pub(crate) fn owner_id(&self) -> &OwnerId {
        &self.inner.owner_id
    }

    /// Current connection state
    pub(crate) fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    ///
    /// The receiver starts at the current state; every transition is
    /// observable without polling.
    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Connection state plus health counters, for status queries
    pub(crate) fn status(&self) -> AccountStatus {
        let ms = self.inner.last_activity_ms.load(Ordering::Relaxed);
        AccountStatus {
            account_id: self.inner.account_id.clone(),
            state: self.state(),
            last_activity: (ms > 0)
                .then(|| DateTime::from_timestamp_millis(ms))
                .flatten(),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    /// Establish the transport link.
    ///
    /// Idempotent: while `Connecting` or `Connected` this is a no-op that
    /// reports the current state. `AuthFailed` refuses -- the account must be
    /// re-paired externally. The attempt is bounded by the connect timeout.
    pub(crate) async fn connect(&self) -> Result<ConnectionState> {
        match self.state() {
            ConnectionState::Connected => return Ok(ConnectionState::Connected),
            ConnectionState::Connecting => return Ok(ConnectionState::Connecting),
            ConnectionState::AuthFailed => {
                return Err(Error::AuthFailed {
                    account: self.inner.account_id.clone(),
                });
            }
            ConnectionState::Disconnected => {}
        }

        let mut link = self.inner.link.lock().await;
        // The state may have moved while we waited for the lock: another
        // caller can win the race, or the listener can observe a fatal close
        match self.state() {
            ConnectionState::Connected => return Ok(ConnectionState::Connected),
            ConnectionState::AuthFailed => {
                return Err(Error::AuthFailed {
                    account: self.inner.account_id.clone(),
                });
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }

        self.set_state(ConnectionState::Connecting);
        debug!(account = %self.inner.account_id, "connecting");

        let attempt = tokio::time::timeout(
            self.inner.connect_timeout,
            self.inner.transport.connect(&self.inner.credentials),
        )
        .await;

        match attempt {
            Ok(Ok(conn)) => {
                let conn: Arc<dyn TransportConnection> = Arc::from(conn);
                self.attach_listener(conn.events()).await;
                *link = Some(conn);
                drop(link);

                self.inner.consecutive_failures.store(0, Ordering::Relaxed);
                self.touch_activity();
                self.set_state(ConnectionState::Connected);
                info!(account = %self.inner.account_id, "connected");
                Ok(ConnectionState::Connected)
            }
            Ok(Err(error)) if error.is_fatal() => {
                warn!(
                    account = %self.inner.account_id,
                    error = %error,
                    "connect rejected fatally"
                );
                self.set_state(ConnectionState::AuthFailed);
                Err(Error::Transport(error))
            }
            Ok(Err(error)) => {
                debug!(account = %self.inner.account_id, error = %error, "connect failed");
                self.set_state(ConnectionState::Disconnected);
                Err(Error::Transport(error))
            }
            Err(_) => {
                let error = TransportError::Recoverable(format!(
                    "connect timed out after {:?}",
                    self.inner.connect_timeout
                ));
                warn!(account = %self.inner.account_id, "connect attempt timed out");
                self.set_state(ConnectionState::Disconnected);
                Err(Error::Transport(error))
            }
        }
    }

    /// Deliver one message through the live link.
    ///
    /// Fails `NotConnected` when the state machine is not `Connected`. On a
    /// recoverable transport error the connection drops to `Disconnected`
    /// (the link is considered broken); on a fatal error it locks into
    /// `AuthFailed`. Either way the error is returned for the caller's retry
    /// policy.
    pub(crate) async fn send(&self, recipient: &str, body: &str) -> Result<()> {
        let _in_flight = self.inner.send_gate.lock().await;

        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected {
                account: self.inner.account_id.clone(),
            });
        }
        let Some(conn) = self.inner.link.lock().await.as_ref().map(Arc::clone) else {
            return Err(Error::NotConnected {
                account: self.inner.account_id.clone(),
            });
        };

        match tokio::time::timeout(self.inner.send_timeout, conn.send_text(recipient, body)).await {
            Ok(Ok(())) => {
                self.inner.consecutive_failures.store(0, Ordering::Relaxed);
                self.touch_activity();
                Ok(())
            }
            Ok(Err(error)) => {
                self.record_send_failure(&error);
                Err(Error::Transport(error))
            }
            Err(_) => {
                let error = TransportError::Recoverable(format!(
                    "send timed out after {:?}",
                    self.inner.send_timeout
                ));
                self.record_send_failure(&error);
                Err(Error::Transport(error))
            }
        }
    }

    /// Groups the account participates in, straight from the transport
    pub(crate) async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected {
                account: self.inner.account_id.clone(),
            });
        }
        let Some(conn) = self.inner.link.lock().await.as_ref().map(Arc::clone) else {
            return Err(Error::NotConnected {
                account: self.inner.account_id.clone(),
            });
        };

        match tokio::time::timeout(self.inner.send_timeout, conn.list_groups()).await {
            Ok(Ok(groups)) => {
                self.touch_activity();
                Ok(groups)
            }
            Ok(Err(error)) => {
                self.record_send_failure(&error);
                Err(Error::Transport(error))
            }
            Err(_) => Err(Error::Transport(TransportError::Recoverable(format!(
                "group listing timed out after {:?}",
                self.inner.send_timeout
            )))),
        }
    }

    /// Force the terminal state. Used by the supervisor when a fatal failure
    /// is reported from outside the send path.
    pub(crate) fn mark_auth_failed(&self) {
        self.set_state(ConnectionState::AuthFailed);
    }

    /// Tear the link down: cancel the listener, close the transport handle,
    /// return to `Disconnected` (unless already terminal). Idempotent.
    pub(crate) async fn disconnect(&self) {
        if let Some(token) = self.inner.listener_cancel.lock().await.take() {
            token.cancel();
        }
        let conn = self.inner.link.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Watch the transport's event stream and feed remote closes into the
    /// state machine, so a dropped link is observed even with no send in
    /// flight. Each connect attaches a fresh listener and cancels the old.
    async fn attach_listener(&self, mut events: broadcast::Receiver<TransportEvent>) {
        let token = self.inner.lifecycle.child_token();
        {
            let mut guard = self.inner.listener_cancel.lock().await;
            if let Some(old) = guard.replace(token.clone()) {
                old.cancel();
            }
        }

        let conn = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(TransportEvent::Closed { error }) => {
                            warn!(
                                account = %conn.inner.account_id,
                                error = %error,
                                "transport closed the link"
                            );
                            if error.is_fatal() {
                                conn.set_state(ConnectionState::AuthFailed);
                            } else {
                                conn.inner
                                    .consecutive_failures
                                    .fetch_add(1, Ordering::Relaxed);
                                conn.set_state(ConnectionState::Disconnected);
                            }
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn record_send_failure(&self, error: &TransportError) {
        self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if error.is_fatal() {
            self.set_state(ConnectionState::AuthFailed);
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn touch_activity(&self) {
        self.inner
            .last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Apply a transition, refusing to leave a terminal state. Publishes the
    /// change on the watch channel and the engine event stream.
    fn set_state(&self, next: ConnectionState) {
        let changed = self.inner.state_tx.send_if_modified(|state| {
            if *state == next || state.is_terminal() {
                return false;
            }
            *state = next;
            true
        });

        if changed {
            debug!(account = %self.inner.account_id, state = ?next, "connection state changed");
            self.inner
                .event_tx
                .send(Event::ConnectionStateChanged {
                    account: self.inner.account_id.clone(),
                    state: next,
                })
                .ok();
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    fn test_connection() -> (AccountConnection, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        let (event_tx, _) = broadcast::channel(64);
        let connection = AccountConnection::new(
            AccountId::from("acct-1"),
            OwnerId::from("user-1"),
            Arc::clone(&transport) as Arc<dyn MessageTransport>,
            AccountCredentials::new(serde_json::json!({"session": "s"})),
            &Config::default(),
            event_tx,
            CancellationToken::new(),
        );
        (connection, transport)
    }

    #[tokio::test]
    async fn connect_transitions_to_connected_and_is_idempotent() {
        let (connection, transport) = test_connection();

        let state = connection.connect().await.unwrap();
        assert_eq!(state, ConnectionState::Connected);

        let again = connection.connect().await.unwrap();
        assert_eq!(again, ConnectionState::Connected, "second connect is a no-op");
        assert_eq!(
            transport.connect_count(),
            1,
            "idempotent connect must not open a second transport handle"
        );
    }

    #[tokio::test]
    async fn fatal_connect_locks_into_auth_failed() {
        let (connection, transport) = test_connection();
        transport.script_connect_outcome(Err(TransportError::Fatal("revoked".into())));

        let error = connection.connect().await.unwrap_err();
        assert!(matches!(error, Error::Transport(TransportError::Fatal(_))));
        assert_eq!(connection.state(), ConnectionState::AuthFailed);

        // Terminal: further connects refuse without touching the transport
        let refused = connection.connect().await.unwrap_err();
        assert!(matches!(refused, Error::AuthFailed { .. }));
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn recoverable_connect_failure_returns_to_disconnected() {
        let (connection, transport) = test_connection();
        transport.script_connect_outcome(Err(TransportError::Recoverable("down".into())));

        assert!(connection.connect().await.is_err());
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // The next attempt goes through
        assert!(connection.connect().await.is_ok());
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn send_without_connection_fails_not_connected() {
        let (connection, _transport) = test_connection();

        let error = connection.send("a@s.whatsapp.net", "hi").await.unwrap_err();
        assert!(
            matches!(error, Error::NotConnected { .. }),
            "send before connect must fail NotConnected, got {error}"
        );
    }

    #[tokio::test]
    async fn successful_send_updates_health() {
        let (connection, _transport) = test_connection();
        connection.connect().await.unwrap();

        connection.send("a@s.whatsapp.net", "hi").await.unwrap();

        let status = connection.status();
        assert_eq!(status.consecutive_failures, 0);
        assert!(
            status.last_activity.is_some(),
            "activity timestamp must be set after a successful send"
        );
    }

    #[tokio::test]
    async fn recoverable_send_failure_drops_to_disconnected() {
        let (connection, transport) = test_connection();
        connection.connect().await.unwrap();
        transport.script_send_outcome(Err(TransportError::Recoverable("reset".into())));

        assert!(connection.send("a@s.whatsapp.net", "hi").await.is_err());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn fatal_send_failure_locks_into_auth_failed() {
        let (connection, transport) = test_connection();
        connection.connect().await.unwrap();
        transport.script_send_outcome(Err(TransportError::Fatal("logged out".into())));

        assert!(connection.send("a@s.whatsapp.net", "hi").await.is_err());
        assert_eq!(connection.state(), ConnectionState::AuthFailed);

        let error = connection.send("a@s.whatsapp.net", "hi").await.unwrap_err();
        assert!(matches!(error, Error::NotConnected { .. }));
    }

    #[tokio::test]
    async fn remote_close_is_observed_without_a_send_in_flight() {
        let (connection, transport) = test_connection();
        connection.connect().await.unwrap();
        let mut states = connection.subscribe_state();

        transport.inject_event(TransportEvent::Closed {
            error: TransportError::Recoverable("remote hangup".into()),
        });

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                states.changed().await.unwrap();
                if *states.borrow() == ConnectionState::Disconnected {
                    break;
                }
            }
        })
        .await
        .expect("listener should flip the state to Disconnected");
    }

    #[tokio::test]
    async fn state_subscription_replays_transitions_in_order() {
        let (connection, _transport) = test_connection();
        let mut states = connection.subscribe_state();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

        connection.connect().await.unwrap();

        // watch keeps only the latest value; after connect it must be Connected
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_closes_the_link() {
        let (connection, _transport) = test_connection();
        connection.connect().await.unwrap();

        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.disconnect().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn list_groups_requires_a_live_connection() {
        let (connection, transport) = test_connection();
        transport.set_groups(vec![crate::types::GroupInfo {
            id: "room-1@g.us".into(),
            subject: "Launch crew".into(),
            participants: Some(12),
        }]);

        assert!(connection.list_groups().await.is_err());

        connection.connect().await.unwrap();
        let groups = connection.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].subject, "Launch crew");
    }
}
