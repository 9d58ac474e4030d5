//! Engine lifecycle: retention sweeping and graceful shutdown.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::types::Event;

use super::BulkSender;

/// How long shutdown waits for send loops to observe their stop requests
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling cadence while draining
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl BulkSender {
    /// Start the background sweeper that evicts finished tasks once they age
    /// past the configured retention. Runs until shutdown; returns the handle
    /// for callers that want to await it.
    pub fn start_eviction_sweeper(&self) -> JoinHandle<()> {
        let sender = self.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sender.config.registry.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("eviction sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                sender.evict_expired_tasks().await;
            }
        })
    }

    /// One eviction pass: drop every task that reached a terminal state
    /// before the retention cutoff. Running tasks are never touched.
    pub(crate) async fn evict_expired_tasks(&self) {
        let retention = self.config.registry.retention;
        // A retention past chrono's range pushes the cutoff to the minimum
        // timestamp, which no task can predate: nothing is ever evicted
        let cutoff = i64::try_from(retention.as_secs())
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let candidates: Vec<_> = {
            let tasks = self.tasks.tasks.lock().await;
            tasks.values().cloned().collect()
        };
        let mut expired = Vec::new();
        for task in candidates {
            if task.ended_before(cutoff).await {
                expired.push(task.task_id());
            }
        }
        if expired.is_empty() {
            return;
        }

        let mut tasks = self.tasks.tasks.lock().await;
        for task_id in &expired {
            tasks.remove(task_id);
        }
        drop(tasks);
        tracing::debug!(
            evicted = expired.len(),
            "evicted finished tasks past retention"
        );
    }

    /// Shut the engine down gracefully
    ///
    /// New submissions are refused from the first step onward. Running tasks
    /// get a stop request and a bounded window to finish as `Stopped`; after
    /// that every connection is torn down and background loops are cancelled.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use bulksend::{BulkSender, Config, InMemoryTransport};
    /// # use std::sync::Arc;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let sender = BulkSender::new(Config::default(), Arc::new(InMemoryTransport::new()));
    /// // ... pair accounts, submit tasks ...
    /// sender.shutdown().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down bulk sender");

        // Step 1: refuse new submissions
        self.tasks.accepting_new.store(false, Ordering::SeqCst);

        // Step 2: stop the send loops and give them a bounded drain window
        if !self.drain_running_tasks(SHUTDOWN_DRAIN_TIMEOUT).await {
            tracing::warn!("tasks still running after drain window");
        }

        // Step 3: tear down every account connection
        let entries: Vec<_> = {
            let mut entries = self.accounts.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.lifecycle.cancel();
        }
        futures::future::join_all(entries.iter().map(|entry| entry.connection.disconnect())).await;

        // Step 4: cancel everything still parented to the engine
        self.shutdown.cancel();

        self.emit_event(Event::Shutdown);
        tracing::info!("shutdown complete");
        Ok(())
    }

    /// Request a stop on every non-terminal task
    async fn request_stop_all(&self) {
        let tasks: Vec<_> = {
            let tasks = self.tasks.tasks.lock().await;
            tasks.values().cloned().collect()
        };
        for task in tasks {
            task.request_stop().await;
        }
    }

    /// Stop every running task and wait until none is left non-terminal,
    /// up to `timeout`. A submission can race the intake gate and land
    /// after a sweep, so the sweep repeats on every poll. Returns false
    /// if the window elapsed first.
    async fn drain_running_tasks(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.request_stop_all().await;
            if self.running_task_count().await == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    async fn running_task_count(&self) -> usize {
        let tasks: Vec<_> = {
            let tasks = self.tasks.tasks.lock().await;
            tasks.values().cloned().collect()
        };
        let mut running = 0;
        for task in tasks {
            if !task.state().await.is_terminal() {
                running += 1;
            }
        }
        running
    }
}
