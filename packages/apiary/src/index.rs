//! Best-effort search indexing of scheduled tasks.
//!
//! The scheduler publishes a small document per task so operators can find
//! tasks by name. Indexing is strictly best-effort: a failure is logged and
//! swallowed, and a task whose document never landed is still fully
//! schedulable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Searchable projection of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDocument {
    pub name: String,
    /// Packed result-summary id.
    pub packed_id: String,
}

/// Capability to publish task documents.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn put(&self, documents: Vec<TaskDocument>) -> anyhow::Result<()>;
}

/// Index that accepts and discards every document.
#[derive(Debug, Default)]
pub struct NoOpSearchIndex;

#[async_trait]
impl SearchIndex for NoOpSearchIndex {
    async fn put(&self, _documents: Vec<TaskDocument>) -> anyhow::Result<()> {
        Ok(())
    }
}
