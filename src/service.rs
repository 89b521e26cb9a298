//! The task RPC service: typed request/response messages and the semantics
//! of the four operations, independent of the wire transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::OnMissing;
use crate::mask::{self, FieldMask, MaskError};
use crate::store::{StoreError, Task, TaskStore};

/// Longest accepted task description, in bytes.
pub const MAX_DESCRIPTION_BYTES: usize = 1024;

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTaskRequest {
    pub description: String,
    /// RFC 3339; a malformed string fails params decoding (InvalidArgument).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTaskResponse {
    pub id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTasksRequest {
    #[serde(default)]
    pub mask: FieldMask,
}

/// One element of the task.list response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub task: Task,
    pub overdue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    pub id: u64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTaskRequest {
    pub id: u64,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("task with id {0} not found")]
    NotFound(u64),
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::Unavailable(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<MaskError> for ServiceError {
    fn from(e: MaskError) -> Self {
        ServiceError::Internal(e.to_string())
    }
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// Task operations on top of a `TaskStore` and the field filter.
///
/// Streaming shapes live in the transport layer (`rpc`): it feeds this
/// service one element at a time and owns send/receive ordering.
pub struct TodoService {
    store: Arc<dyn TaskStore>,
    on_missing: OnMissing,
}

impl TodoService {
    pub fn new(store: Arc<dyn TaskStore>, on_missing: OnMissing) -> Self {
        Self { store, on_missing }
    }

    /// Validate and store a new task; returns its assigned id.
    pub async fn add_task(&self, req: AddTaskRequest) -> Result<AddTaskResponse, ServiceError> {
        let description = req.description.trim();
        if description.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "description must not be empty".to_string(),
            ));
        }
        if description.len() > MAX_DESCRIPTION_BYTES {
            return Err(ServiceError::InvalidArgument(format!(
                "description exceeds {MAX_DESCRIPTION_BYTES} bytes"
            )));
        }

        let id = self
            .store
            .add(description.to_string(), req.due_date)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(AddTaskResponse { id })
    }

    /// Snapshot the store for streaming. The transport renders each task via
    /// [`render_row`] and sends one row per frame, in insertion order.
    pub async fn list_snapshot(&self) -> Result<Vec<Task>, ServiceError> {
        Ok(self.store.snapshot().await?)
    }

    /// Build one response row: `overdue` is computed from the UNFILTERED
    /// task, then the mask is applied to the task placed in the row.
    pub fn render_row(&self, task: &Task, req_mask: &FieldMask) -> Result<TaskRow, ServiceError> {
        let overdue = task.overdue(Utc::now());
        let task = mask::apply(task, req_mask)?;
        Ok(TaskRow { task, overdue })
    }

    /// Apply one element of an update stream. Unknown ids follow the
    /// configured `on_missing` policy.
    pub async fn apply_update(&self, req: UpdateTaskRequest) -> Result<(), ServiceError> {
        match self
            .store
            .update(req.id, req.description, req.due_date, req.done)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(id)) => self.on_missing_outcome(id, "update"),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one element of a delete stream. Unknown ids follow the
    /// configured `on_missing` policy.
    pub async fn apply_delete(&self, req: DeleteTaskRequest) -> Result<(), ServiceError> {
        match self.store.delete(req.id).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(id)) => self.on_missing_outcome(id, "delete"),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn task_count(&self) -> usize {
        self.store.len().await
    }

    fn on_missing_outcome(&self, id: u64, op: &str) -> Result<(), ServiceError> {
        match self.on_missing {
            OnMissing::Skip => {
                debug!(id, op, "unknown task id — skipped");
                Ok(())
            }
            OnMissing::Error => Err(ServiceError::NotFound(id)),
        }
    }
}
