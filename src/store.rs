//! Task model and in-memory storage.
//!
//! Storage is deliberately dumb: an insertion-ordered `Vec` behind one mutex,
//! scanned linearly. The `TaskStore` trait exists so the RPC service depends
//! on a seam, not on the concrete container, and so the contract admits
//! storage failure even though the in-memory backend cannot fail except for
//! "not found".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// A stored to-do item.
///
/// `id` 0 is reserved as "absent/unset" and never assigned. All fields carry
/// `#[serde(default)]` so a field-mask-cleared task re-materializes with zero
/// values on deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Task {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub description: String,
    /// RFC 3339 on the wire; absent when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done: bool,
}

impl Task {
    /// True iff the due date has passed and the task is not done.
    pub fn overdue(&self, now: DateTime<Utc>) -> bool {
        match self.due_date {
            Some(due) => !self.done && due < now,
            None => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task with id {0} not found")]
    NotFound(u64),
    /// The in-memory backend never produces this; the variant keeps the
    /// service contract honest about storage being fallible.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Storage seam for the RPC service.
///
/// Callers serialize operations; implementations must still be safe under
/// concurrent access (the in-memory backend holds one mutex).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a new task and return its assigned id.
    async fn add(&self, description: String, due_date: Option<DateTime<Utc>>)
        -> Result<u64, StoreError>;

    /// Clone of all tasks in insertion order.
    async fn snapshot(&self) -> Result<Vec<Task>, StoreError>;

    /// Overwrite description, due_date, and done of the task with the given
    /// id. No partial-field semantics.
    async fn update(
        &self,
        id: u64,
        description: String,
        due_date: Option<DateTime<Utc>>,
        done: bool,
    ) -> Result<(), StoreError>;

    /// Remove the task with the given id.
    async fn delete(&self, id: u64) -> Result<(), StoreError>;

    /// Number of currently stored tasks.
    async fn len(&self) -> usize;
}

struct Inner {
    tasks: Vec<Task>,
    /// Monotonic — independent of the live task count, so ids are never
    /// reused after deletions.
    next_id: u64,
}

/// In-memory task store: insertion-ordered `Vec` guarded by one mutex.
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: Vec::new(),
                next_id: 1,
            }),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemStore {
    async fn add(
        &self,
        description: String,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.tasks.push(Task {
            id,
            description,
            due_date,
            done: false,
        });
        Ok(id)
    }

    async fn snapshot(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.inner.lock().await.tasks.clone())
    }

    async fn update(
        &self,
        id: u64,
        description: String,
        due_date: Option<DateTime<Utc>>,
        done: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                task.description = description;
                task.due_date = due_date;
                task.done = done;
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.iter().position(|t| t.id == id) {
            Some(i) => {
                inner.tasks.remove(i);
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }
}
