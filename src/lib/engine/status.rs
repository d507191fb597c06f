//! Engine-owned task status with a scoped marker for running workflows.

use parking_lot::Mutex;

use super::types::{TaskKind, TaskStatus};

#[derive(Debug, Default)]
pub struct TaskStatusCell {
    inner: Mutex<TaskStatus>,
}

impl TaskStatusCell {
    pub fn snapshot(&self) -> TaskStatus {
        self.inner.lock().clone()
    }

    /// Mark `task` active until the returned guard drops.
    pub fn enter(&self, task: TaskKind) -> TaskScope<'_> {
        self.inner.lock().active_task = Some(task);
        tracing::info!(task = %task, "Task started");
        TaskScope { cell: self, task }
    }

    pub fn set_error(&self, error: Option<String>) {
        self.inner.lock().last_error = error;
    }
}

/// Active-task marker. Dropping it, on success, error or panic, records
/// the task as the last one and clears the active slot.
#[must_use = "the task is finished as soon as the scope drops"]
pub struct TaskScope<'a> {
    cell: &'a TaskStatusCell,
    task: TaskKind,
}

impl Drop for TaskScope<'_> {
    fn drop(&mut self) {
        let mut status = self.cell.inner.lock();
        status.last_task = Some(self.task);
        status.active_task = None;
        tracing::info!(task = %self.task, "Task finished");
    }
}
