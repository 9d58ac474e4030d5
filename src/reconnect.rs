//! Reconnect supervision for a broken account connection.
//!
//! One [`ReconnectSupervisor`] owns the retry policy for one
//! [`AccountConnection`](crate::connection::AccountConnection): when to try
//! again, how long to wait between attempts, and when to give up. Task loops
//! report failures with [`notify_failure`](ReconnectSupervisor::notify_failure)
//! and park on [`wait_for_recovery`](ReconnectSupervisor::wait_for_recovery);
//! the give-up verdict reaches every parked task at once so none of them
//! hang on a connection that will never come back.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReconnectConfig;
use crate::connection::AccountConnection;
use crate::error::Error;
use crate::transport::TransportError;
use crate::types::{ConnectionState, Event};

/// Delay before reconnect attempt number `attempt` (zero-based).
///
/// Deterministic doubling, no jitter: `base * 2^attempt`, capped at `max`.
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    // Beyond 2^32 the doubled value has long since saturated the cap
    let factor = 2u64.saturating_pow(attempt.min(32));
    base.saturating_mul(factor.min(u64::from(u32::MAX)) as u32).min(max)
}

/// What a task blocked on a broken connection observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryWait {
    /// The connection came back; retry the send
    Recovered,
    /// The supervisor exhausted its attempt budget; the connection is gone
    GaveUp {
        /// Consecutive attempts made before giving up
        attempts: u32,
    },
    /// The connection locked into `AuthFailed`; re-pairing required
    AuthFailed,
    /// The wait deadline elapsed with the connection still down
    TimedOut,
    /// The waiting task was asked to stop
    Cancelled,
}

/// Retry policy owner for a single account connection.
///
/// Cheap to clone; clones share the underlying state. Only one reconnect
/// cycle runs at a time -- reentrant failure reports while a cycle is in
/// flight are ignored, never queued.
#[derive(Clone)]
pub(crate) struct ReconnectSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    connection: AccountConnection,
    policy: ReconnectConfig,
    event_tx: broadcast::Sender<Event>,
    lifecycle: CancellationToken,

    /// Held by the running reconnect cycle; try-locked to ignore reentry
    cycle_gate: Arc<Mutex<()>>,

    /// `Some(attempts)` once the supervisor has permanently given up
    verdict_tx: watch::Sender<Option<u32>>,
}

impl ReconnectSupervisor {
    pub(crate) fn new(
        connection: AccountConnection,
        policy: ReconnectConfig,
        event_tx: broadcast::Sender<Event>,
        lifecycle: CancellationToken,
    ) -> Self {
        let (verdict_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(SupervisorInner {
                connection,
                policy,
                event_tx,
                lifecycle,
                cycle_gate: Arc::new(Mutex::new(())),
                verdict_tx,
            }),
        }
    }

    /// Whether the supervisor has permanently given up on this connection
    pub(crate) fn given_up(&self) -> bool {
        self.inner.verdict_tx.borrow().is_some()
    }

    /// Report a transport failure.
    ///
    /// Fatal failures lock the connection into `AuthFailed` and stop all
    /// retrying. Recoverable failures start a reconnect cycle unless one is
    /// already running (reentrant calls are ignored) or the supervisor has
    /// already given up.
    pub(crate) fn notify_failure(&self, error: &TransportError) {
        if error.is_fatal() {
            warn!(
                account = %self.inner.connection.account_id(),
                error = %error,
                "fatal transport failure, no reconnect will be attempted"
            );
            self.inner.connection.mark_auth_failed();
            return;
        }

        if self.given_up() || self.inner.connection.state().is_terminal() {
            return;
        }

        // Single in-flight cycle: losing the try-lock means one is running
        let Ok(running) = Arc::clone(&self.inner.cycle_gate).try_lock_owned() else {
            return;
        };

        let supervisor = self.clone();
        let cancel = self.inner.lifecycle.child_token();
        tokio::spawn(async move {
            let _running = running;
            supervisor.run_cycle(cancel).await;
        });
    }

    /// Park until the connection recovers, the supervisor gives up, the
    /// deadline passes, or `cancel` fires -- whichever comes first.
    pub(crate) async fn wait_for_recovery(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RecoveryWait {
        let mut state_rx = self.inner.connection.subscribe_state();
        let mut verdict_rx = self.inner.verdict_tx.subscribe();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            match *state_rx.borrow_and_update() {
                ConnectionState::Connected => return RecoveryWait::Recovered,
                ConnectionState::AuthFailed => return RecoveryWait::AuthFailed,
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }
            if let Some(attempts) = *verdict_rx.borrow_and_update() {
                return RecoveryWait::GaveUp { attempts };
            }

            tokio::select! {
                _ = cancel.cancelled() => return RecoveryWait::Cancelled,
                _ = &mut deadline => return RecoveryWait::TimedOut,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return RecoveryWait::Cancelled;
                    }
                }
                changed = verdict_rx.changed() => {
                    if changed.is_err() {
                        return RecoveryWait::Cancelled;
                    }
                }
            }
        }
    }

    /// The reconnect cycle: delay, attempt, repeat until the connection is
    /// back, the budget is spent, or the engine shuts down.
    async fn run_cycle(&self, cancel: CancellationToken) {
        let account = self.inner.connection.account_id().clone();
        let max_attempts = self.inner.policy.max_attempts;
        let mut attempt: u32 = 0;

        loop {
            match self.inner.connection.state() {
                ConnectionState::Connected => {
                    // Restored from elsewhere while we were waiting
                    return;
                }
                ConnectionState::AuthFailed => return,
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }

            if attempt >= max_attempts {
                error!(
                    account = %account,
                    attempts = attempt,
                    "reconnect attempts exhausted, giving up on this connection"
                );
                self.inner.verdict_tx.send(Some(attempt)).ok();
                self.inner
                    .event_tx
                    .send(Event::ReconnectExhausted {
                        account,
                        attempts: attempt,
                    })
                    .ok();
                return;
            }

            let delay = backoff_delay(
                attempt,
                self.inner.policy.base_delay,
                self.inner.policy.max_delay,
            );
            debug!(
                account = %account,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect attempt"
            );

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.inner.connection.connect().await {
                Ok(ConnectionState::Connected) => {
                    info!(
                        account = %account,
                        attempts = attempt + 1,
                        "connection restored"
                    );
                    return;
                }
                Ok(_) => {
                    // Another caller holds the connect lock; check again next round
                    attempt += 1;
                }
                Err(Error::AuthFailed { .. })
                | Err(Error::Transport(TransportError::Fatal(_))) => {
                    warn!(account = %account, "reconnect hit a fatal failure, stopping");
                    return;
                }
                Err(e) => {
                    debug!(
                        account = %account,
                        attempt = attempt + 1,
                        error = %e,
                        "reconnect attempt failed"
                    );
                    attempt += 1;
                }
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::{AccountCredentials, InMemoryTransport, MessageTransport};
    use crate::types::{AccountId, OwnerId};

    /// Config with millisecond-scale backoff so cycles finish fast
    fn fast_config(max_attempts: u32) -> Config {
        let mut config = Config::default();
        config.reconnect.base_delay = Duration::from_millis(10);
        config.reconnect.max_delay = Duration::from_millis(40);
        config.reconnect.max_attempts = max_attempts;
        config.reconnect.connect_timeout = Duration::from_secs(1);
        config
    }

    fn test_supervisor(
        config: &Config,
    ) -> (ReconnectSupervisor, AccountConnection, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        let (event_tx, _) = broadcast::channel(64);
        let connection = AccountConnection::new(
            AccountId::from("acct-1"),
            OwnerId::from("user-1"),
            Arc::clone(&transport) as Arc<dyn MessageTransport>,
            AccountCredentials::new(serde_json::json!({"session": "s"})),
            config,
            event_tx.clone(),
            CancellationToken::new(),
        );
        let supervisor = ReconnectSupervisor::new(
            connection.clone(),
            config.reconnect.clone(),
            event_tx,
            CancellationToken::new(),
        );
        (supervisor, connection, transport)
    }

    // --- backoff schedule ---

    #[test]
    fn backoff_doubles_deterministically_and_caps() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);

        let schedule: Vec<u64> = (0..8)
            .map(|attempt| backoff_delay(attempt, base, max).as_secs())
            .collect();
        assert_eq!(
            schedule,
            vec![2, 4, 8, 16, 32, 60, 60, 60],
            "schedule must double from the base and cap at the maximum"
        );
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let delay = backoff_delay(500, Duration::from_secs(2), Duration::from_secs(60));
        assert_eq!(delay, Duration::from_secs(60), "overflow must clamp to the cap");
    }

    // --- failure classification ---

    #[tokio::test]
    async fn fatal_failure_locks_connection_without_reconnecting() {
        let config = fast_config(5);
        let (supervisor, connection, transport) = test_supervisor(&config);
        connection.connect().await.unwrap();
        assert_eq!(transport.connect_count(), 1);

        supervisor.notify_failure(&TransportError::Fatal("logged out".into()));

        assert_eq!(connection.state(), ConnectionState::AuthFailed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            transport.connect_count(),
            1,
            "fatal failures must not trigger reconnect attempts"
        );
    }

    #[tokio::test]
    async fn recoverable_failure_reconnects_and_recovery_wait_resolves() {
        let config = fast_config(5);
        let (supervisor, connection, transport) = test_supervisor(&config);
        connection.connect().await.unwrap();

        // Break the link the way a failed send does
        transport.script_send_outcome(Err(TransportError::Recoverable("reset".into())));
        let error = connection.send("a@s.whatsapp.net", "x").await.unwrap_err();
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        if let Error::Transport(transport_error) = error {
            supervisor.notify_failure(&transport_error);
        } else {
            panic!("send failure should surface as a transport error");
        }

        let outcome = supervisor
            .wait_for_recovery(Duration::from_secs(2), &CancellationToken::new())
            .await;
        assert_eq!(outcome, RecoveryWait::Recovered);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(
            transport.connect_count(),
            2,
            "exactly one reconnect attempt should have been needed"
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_as_gave_up_to_every_waiter() {
        let config = fast_config(3);
        let (supervisor, connection, transport) = test_supervisor(&config);
        connection.connect().await.unwrap();
        transport.fail_all_connects(TransportError::Recoverable("network down".into()));

        // Simulate the broken link
        transport.script_send_outcome(Err(TransportError::Recoverable("reset".into())));
        connection.send("a@s.whatsapp.net", "x").await.unwrap_err();
        supervisor.notify_failure(&TransportError::Recoverable("reset".into()));

        let cancel_a = CancellationToken::new();
        let cancel_b = CancellationToken::new();
        let waiter_a = supervisor.wait_for_recovery(Duration::from_secs(5), &cancel_a);
        let waiter_b = supervisor.wait_for_recovery(Duration::from_secs(5), &cancel_b);
        let (outcome_a, outcome_b) = tokio::join!(waiter_a, waiter_b);

        assert_eq!(outcome_a, RecoveryWait::GaveUp { attempts: 3 });
        assert_eq!(outcome_b, RecoveryWait::GaveUp { attempts: 3 });
        assert!(supervisor.given_up());
        assert_eq!(
            transport.connect_count(),
            4,
            "initial connect plus exactly max_attempts reconnects"
        );
    }

    #[tokio::test]
    async fn reentrant_notifications_start_no_second_cycle() {
        let config = fast_config(2);
        let (supervisor, connection, transport) = test_supervisor(&config);
        connection.connect().await.unwrap();
        transport.fail_all_connects(TransportError::Recoverable("down".into()));
        transport.script_send_outcome(Err(TransportError::Recoverable("reset".into())));
        connection.send("a@s.whatsapp.net", "x").await.unwrap_err();

        let error = TransportError::Recoverable("reset".into());
        supervisor.notify_failure(&error);
        supervisor.notify_failure(&error);
        supervisor.notify_failure(&error);

        let outcome = supervisor
            .wait_for_recovery(Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(outcome, RecoveryWait::GaveUp { attempts: 2 });
        assert_eq!(
            transport.connect_count(),
            3,
            "three notifications must still produce a single two-attempt cycle"
        );
    }

    #[tokio::test]
    async fn notifications_after_give_up_are_ignored() {
        let config = fast_config(1);
        let (supervisor, connection, transport) = test_supervisor(&config);
        connection.connect().await.unwrap();
        transport.fail_all_connects(TransportError::Recoverable("down".into()));
        transport.script_send_outcome(Err(TransportError::Recoverable("reset".into())));
        connection.send("a@s.whatsapp.net", "x").await.unwrap_err();

        supervisor.notify_failure(&TransportError::Recoverable("reset".into()));
        supervisor
            .wait_for_recovery(Duration::from_secs(5), &CancellationToken::new())
            .await;
        let count_after_give_up = transport.connect_count();

        supervisor.notify_failure(&TransportError::Recoverable("again".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            transport.connect_count(),
            count_after_give_up,
            "a latched give-up must ignore further failure reports"
        );
    }

    #[tokio::test]
    async fn recovery_wait_times_out_when_nothing_happens() {
        let config = fast_config(5);
        let (supervisor, _connection, _transport) = test_supervisor(&config);

        let started = std::time::Instant::now();
        let outcome = supervisor
            .wait_for_recovery(Duration::from_millis(50), &CancellationToken::new())
            .await;
        assert_eq!(outcome, RecoveryWait::TimedOut);
        assert!(
            started.elapsed() >= Duration::from_millis(45),
            "the wait must run out the deadline"
        );
    }

    #[tokio::test]
    async fn recovery_wait_observes_cancellation_immediately() {
        let config = fast_config(5);
        let (supervisor, _connection, _transport) = test_supervisor(&config);
        let cancel = CancellationToken::new();

        let wait = supervisor.wait_for_recovery(Duration::from_secs(30), &cancel);
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_millis(200), wait)
            .await
            .expect("cancellation must end the wait promptly");
        assert_eq!(outcome, RecoveryWait::Cancelled);
    }
}
