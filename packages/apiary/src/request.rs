//! The immutable task request and its execution properties.
//!
//! A [`TaskRequest`] is written once at scheduling time and never mutated;
//! all lifecycle state lives on the to-run marker and the result records.
//! Callers describe a task through [`NewTask`] (builder), which is validated
//! into a `TaskRequest` when the scheduler allocates its id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use typed_builder::TypedBuilder;

use crate::error::ValidationError;
use crate::keys::TaskId;

/// Maximum acceptable priority value, which is effectively the lowest
/// priority.
pub const MAXIMUM_PRIORITY: u8 = 255;

/// Capability requirements: dimension key to the list of required values.
///
/// A task is dispatchable to a bot when every entry here is covered by the
/// bot's advertised dimensions.
pub type Dimensions = BTreeMap<String, Vec<String>>;

/// Digest over a task's execution properties, used to find prior successful
/// runs of identical work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertiesHash(String);

impl std::fmt::Display for PropertiesHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to execute and where it may run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct TaskProperties {
    /// Ordered command lines; each is one argv.
    pub commands: Vec<Vec<String>>,
    #[builder(default)]
    pub dimensions: Dimensions,
    /// Idempotent tasks may reuse the result of a prior successful run with
    /// the same properties hash.
    #[builder(default)]
    pub idempotent: bool,
}

impl TaskProperties {
    /// Deterministic digest over commands and dimensions.
    pub fn compute_hash(&self) -> PropertiesHash {
        let mut hasher = Sha256::new();
        for command in &self.commands {
            for arg in command {
                hasher.update(arg.as_bytes());
                hasher.update([0]);
            }
            hasher.update([1]);
        }
        hasher.update([2]);
        for (key, values) in &self.dimensions {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            for value in values {
                hasher.update(value.as_bytes());
                hasher.update([0]);
            }
            hasher.update([1]);
        }
        PropertiesHash(hex::encode(hasher.finalize()))
    }

    /// True when every required dimension is covered by the bot's advertised
    /// dimensions.
    pub fn dimensions_subset_of(&self, bot_dimensions: &Dimensions) -> bool {
        self.dimensions.iter().all(|(key, values)| {
            bot_dimensions
                .get(key)
                .is_some_and(|offered| values.iter().all(|v| offered.contains(v)))
        })
    }
}

/// Throws [`ValidationError::PriorityOutOfRange`] unless `priority` fits
/// `0..=MAXIMUM_PRIORITY`.
pub fn validate_priority(priority: i64) -> Result<u8, ValidationError> {
    if !(0..=i64::from(MAXIMUM_PRIORITY)).contains(&priority) {
        return Err(ValidationError::PriorityOutOfRange(priority));
    }
    Ok(priority as u8)
}

/// Client description of a task, before validation and id allocation.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewTask {
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub user: String,
    /// 0 is the highest precedence, [`MAXIMUM_PRIORITY`] the lowest.
    pub priority: i64,
    pub expiration_ts: DateTime<Utc>,
    /// Packed run-result id of the task that spawned this one.
    #[builder(default, setter(strip_option, into))]
    pub parent_task_id: Option<String>,
    pub properties: TaskProperties,
}

impl NewTask {
    /// Validate into the immutable request record.
    pub fn into_request(
        self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TaskRequest, ValidationError> {
        let priority = validate_priority(self.priority)?;
        if self.expiration_ts <= now {
            return Err(ValidationError::ExpirationBeforeCreation);
        }
        if self.properties.commands.is_empty() {
            return Err(ValidationError::NoCommands);
        }
        let properties_hash = self
            .properties
            .idempotent
            .then(|| self.properties.compute_hash());
        Ok(TaskRequest {
            id,
            created_ts: now,
            name: self.name,
            user: self.user,
            priority,
            expiration_ts: self.expiration_ts,
            parent_task_id: self.parent_task_id,
            properties: self.properties,
            properties_hash,
        })
    }
}

/// Immutable description of a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: TaskId,
    pub created_ts: DateTime<Utc>,
    pub name: String,
    pub user: String,
    pub priority: u8,
    pub expiration_ts: DateTime<Utc>,
    pub parent_task_id: Option<String>,
    pub properties: TaskProperties,
    /// Present iff the task is idempotent.
    pub properties_hash: Option<PropertiesHash>,
}
