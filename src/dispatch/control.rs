//! Task queries and stop control.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{OwnerId, TaskId, TaskStatus};

use super::{BulkSender, SendTask};

impl BulkSender {
    /// Current snapshot of one task
    ///
    /// # Errors
    ///
    /// - [`Error::Forbidden`] if the task belongs to another owner
    /// - [`Error::NotFound`] if no task with this id is registered
    pub async fn task_status(&self, owner_id: OwnerId, task_id: TaskId) -> Result<TaskStatus> {
        let task = self.get_task(&owner_id, task_id).await?;
        Ok(task.snapshot().await)
    }

    /// All tasks submitted by this owner, sorted by task id
    pub async fn list_tasks(&self, owner_id: OwnerId) -> Vec<TaskStatus> {
        let tasks: Vec<Arc<SendTask>> = {
            let tasks = self.tasks.tasks.lock().await;
            let mut owned: Vec<_> = tasks
                .values()
                .filter(|task| task.owner_id() == &owner_id)
                .cloned()
                .collect();
            owned.sort_by_key(|task| task.task_id());
            owned
        };
        let mut statuses = Vec::with_capacity(tasks.len());
        for task in tasks {
            statuses.push(task.snapshot().await);
        }
        statuses
    }

    /// Request a cooperative stop
    ///
    /// The send loop observes the request at the next delivery boundary and
    /// finishes as `Stopped`; a cadence wait or recovery wait in progress is
    /// interrupted right away. Progress made so far is kept. Stopping a task
    /// that is already stopping or terminal changes nothing and returns the
    /// current snapshot.
    ///
    /// # Errors
    ///
    /// - [`Error::Forbidden`] if the task belongs to another owner
    /// - [`Error::NotFound`] if no task with this id is registered
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use bulksend::{BulkSender, TaskId};
    /// # async fn example(sender: BulkSender) -> Result<(), Box<dyn std::error::Error>> {
    /// let status = sender.stop_task("user-1".into(), TaskId::new(7)).await?;
    /// println!("task is now {:?} with {} sent", status.state, status.sent_count);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn stop_task(&self, owner_id: OwnerId, task_id: TaskId) -> Result<TaskStatus> {
        let task = self.get_task(&owner_id, task_id).await?;
        if task.request_stop().await {
            tracing::info!(task_id = task_id.get(), "stop requested");
        }
        Ok(task.snapshot().await)
    }

    /// Owner-checked task lookup. Ownership is verified before existence is
    /// revealed: a mismatched owner sees `Forbidden`, never the record.
    pub(crate) async fn get_task(
        &self,
        owner_id: &OwnerId,
        task_id: TaskId,
    ) -> Result<Arc<SendTask>> {
        let tasks = self.tasks.tasks.lock().await;
        match tasks.get(&task_id) {
            Some(task) if task.owner_id() != owner_id => Err(Error::Forbidden {
                resource: format!("task {}", task_id.get()),
            }),
            Some(task) => Ok(Arc::clone(task)),
            None => Err(Error::NotFound(format!("task {} not found", task_id.get()))),
        }
    }
}
