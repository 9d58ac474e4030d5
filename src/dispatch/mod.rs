//! Core dispatch engine split into focused submodules.
//!
//! The `BulkSender` struct and its methods are organized by domain:
//! - [`accounts`] - Account pairing, status, and group discovery
//! - [`submit`] - Task validation, admission, and spawning
//! - [`control`] - Task status queries and stop requests
//! - [`lifecycle`] - Eviction sweeping and shutdown coordination
//! - [`send_task`] - Core send-loop execution

mod accounts;
mod control;
mod lifecycle;
mod send_task;
mod submit;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub(crate) use send_task::SendTask;

use crate::config::Config;
use crate::connection::AccountConnection;
use crate::reconnect::ReconnectSupervisor;
use crate::transport::MessageTransport;
use crate::types::{AccountId, TaskId};

/// One paired account: its live connection plus the retry policy owner
#[derive(Clone)]
pub(crate) struct AccountEntry {
    pub(crate) connection: AccountConnection,
    pub(crate) supervisor: ReconnectSupervisor,
    /// Cancelled on unpair; parents the listener and reconnect cycles
    pub(crate) lifecycle: tokio_util::sync::CancellationToken,
}

/// Paired-account directory, keyed by account id
#[derive(Clone)]
pub(crate) struct AccountDirectory {
    pub(crate) entries:
        std::sync::Arc<tokio::sync::Mutex<std::collections::HashMap<AccountId, AccountEntry>>>,
}

/// Send-task directory and admission state
#[derive(Clone)]
pub(crate) struct TaskDirectory {
    /// All known tasks, terminal ones included until eviction removes them
    pub(crate) tasks: std::sync::Arc<
        tokio::sync::Mutex<std::collections::HashMap<TaskId, std::sync::Arc<SendTask>>>,
    >,
    /// Next task ID counter
    pub(crate) next_task_id: std::sync::Arc<std::sync::atomic::AtomicI64>,
    /// Flag to indicate whether new submissions are accepted (false during shutdown)
    pub(crate) accepting_new: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

/// Main dispatch engine (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct BulkSender {
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<crate::types::Event>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: std::sync::Arc<Config>,
    /// Transport implementation used to open account connections
    pub(crate) transport: std::sync::Arc<dyn MessageTransport>,
    /// Paired-account directory
    pub(crate) accounts: AccountDirectory,
    /// Send-task directory and admission state
    pub(crate) tasks: TaskDirectory,
    /// Root cancellation token: cancelled once on shutdown, children cover
    /// connection listeners, reconnect cycles, and the eviction sweeper
    pub(crate) shutdown: tokio_util::sync::CancellationToken,
}

impl BulkSender {
    /// Create a new BulkSender instance
    ///
    /// This wires up the core components:
    /// - Sets up the event broadcast channel
    /// - Creates the empty account and task directories
    /// - Stores the transport used for all future pairings
    ///
    /// Nothing is connected yet; accounts come alive via
    /// [`pair_account`](BulkSender::pair_account).
    pub fn new(config: Config, transport: std::sync::Arc<dyn MessageTransport>) -> Self {
        // Each subscriber gets an independent receiver; 1000 buffered events
        // before a slow one starts lagging
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let accounts = AccountDirectory {
            entries: std::sync::Arc::new(tokio::sync::Mutex::new(
                std::collections::HashMap::new(),
            )),
        };

        let tasks = TaskDirectory {
            tasks: std::sync::Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new())),
            next_task_id: std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0)),
            accepting_new: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)),
        };

        Self {
            event_tx,
            config: std::sync::Arc::new(config),
            transport,
            accounts,
            tasks,
            shutdown: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Subscribe to dispatch events
    ///
    /// Every subscriber receives the full stream independently. One that
    /// falls more than 1000 events behind observes `RecvError::Lagged`
    /// rather than silently missing events.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bulksend::{BulkSender, Config, InMemoryTransport};
    /// use std::sync::Arc;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let sender = BulkSender::new(Config::default(), Arc::new(InMemoryTransport::new()));
    ///
    ///     // UI subscriber
    ///     let mut ui_events = sender.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = ui_events.recv().await {
    ///             println!("UI: {:?}", event);
    ///         }
    ///     });
    ///
    ///     // Logging subscriber
    ///     let mut log_events = sender.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = log_events.recv().await {
    ///             tracing::info!(?event, "dispatch event");
    ///         }
    ///     });
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::types::Event> {
        self.event_tx.subscribe()
    }

    /// Subscribe to dispatch events as a `Stream`
    ///
    /// Wraps [`subscribe`](BulkSender::subscribe) in a
    /// [`BroadcastStream`](tokio_stream::wrappers::BroadcastStream), which is
    /// convenient for SSE endpoints and `StreamExt` combinators. Lagged
    /// subscribers receive a `BroadcastStreamRecvError::Lagged` item instead
    /// of missing events silently.
    pub fn event_stream(
        &self,
    ) -> tokio_stream::wrappers::BroadcastStream<crate::types::Event> {
        tokio_stream::wrappers::BroadcastStream::new(self.event_tx.subscribe())
    }

    /// Get the current configuration
    ///
    /// The configuration lives behind an Arc; this clones the handle only.
    pub fn get_config(&self) -> std::sync::Arc<Config> {
        std::sync::Arc::clone(&self.config)
    }

    /// Emit an event to all subscribers
    ///
    /// With no subscribers the event is dropped on the floor; dispatch
    /// never depends on anyone listening.
    pub(crate) fn emit_event(&self, event: crate::types::Event) {
        self.event_tx.send(event).ok();
    }
}
