//! # bulksend
//!
//! Backend library for bulk message dispatch over a pluggable messaging
//! transport.
//!
//! ## Design Philosophy
//!
//! bulksend is designed to be:
//! - **Transport-agnostic** - The wire protocol lives behind a trait
//! - **Sensible defaults** - Works out of the box with zero configuration
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bulksend::{
//!     AccountCredentials, BulkSender, Config, InMemoryTransport, TargetKind, TaskSubmission,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sender = BulkSender::new(Config::default(), Arc::new(InMemoryTransport::new()));
//!
//!     // Subscribe to events
//!     let mut events = sender.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     sender
//!         .pair_account(
//!             "user-1".into(),
//!             "acct-1".into(),
//!             AccountCredentials::new(serde_json::json!({ "session": "..." })),
//!         )
//!         .await?;
//!
//!     let status = sender
//!         .submit(TaskSubmission {
//!             owner_id: "user-1".into(),
//!             account_id: "acct-1".into(),
//!             target: "15551230001".into(),
//!             target_kind: TargetKind::Individual,
//!             delay_seconds: 5,
//!             prefix: None,
//!             messages: vec!["hello".into(), "world".into()],
//!             payload_path: None,
//!         })
//!         .await?;
//!     println!("task {} started", status.task_id.get());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Per-account connection management
mod connection;
/// Core dispatch engine (decomposed into focused submodules)
pub mod dispatch;
/// Error types
pub mod error;
/// Reconnect supervision with exponential backoff
mod reconnect;
/// Transport abstraction and the in-memory loopback implementation
pub mod transport;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, DispatchConfig, ReconnectConfig, RegistryConfig};
pub use dispatch::BulkSender;
pub use error::{ApiError, Error, ErrorDetail, Result, ToHttpStatus};
pub use transport::{
    AccountCredentials, InMemoryTransport, MessageTransport, RecordedDelivery,
    TransportConnection, TransportError, TransportEvent,
};
pub use types::{
    AccountId, AccountStatus, ConnectionState, Event, GroupInfo, OwnerId, TargetKind, TaskId,
    TaskState, TaskStatus, TaskSubmission,
};

/// Helper function to run the engine with graceful signal handling.
///
/// Starts the eviction sweeper, waits for a termination signal, and then
/// calls the engine's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use bulksend::{BulkSender, Config, InMemoryTransport, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let sender = BulkSender::new(Config::default(), Arc::new(InMemoryTransport::new()));
///
///     // Run with automatic signal handling
///     run_with_shutdown(sender).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(sender: BulkSender) -> Result<()> {
    let sweeper = sender.start_eviction_sweeper();
    wait_for_signal().await;
    let result = sender.shutdown().await;
    if let Err(join_error) = sweeper.await {
        tracing::warn!(error = %join_error, "eviction sweeper did not exit cleanly");
    }
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Handler registration can fail in restricted environments (containers,
    // test sandboxes); degrade to whatever source is still available
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "SIGINT handler unavailable, waiting on SIGTERM only");
            sigterm.recv().await;
            tracing::info!("received SIGTERM");
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting on SIGINT only");
            sigint.recv().await;
            tracing::info!("received SIGINT");
        }
        (Err(e), Err(_)) => {
            tracing::warn!(error = %e, "no unix signal handlers available, falling back to ctrl_c");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl_c");
    } else {
        tracing::info!("received ctrl_c");
    }
}
