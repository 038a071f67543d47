//! Key derivation, id allocation, and the packed external id format.
//!
//! Every task owns four records: the immutable request, the dispatchable
//! to-run marker, one run result per attempt, and the client-visible result
//! summary. All four share the task's entity group, so a single [`TaskId`]
//! is the transactional root from which the other keys derive.
//!
//! # Id allocation
//!
//! Ids are the bitwise complement of `(ms_since_epoch << 20) | random`, so
//! ascending raw-key order is *descending* creation time. The dedupe query
//! leans on this: "order by key ascending" is "newest first" without a
//! composite index on `created_ts`. Store adapters must preserve this
//! ordering or index `created_ts` themselves.
//!
//! # Packed ids
//!
//! External surfaces never see raw keys. A packed id is the lowercase hex of
//! the task id followed by a single suffix digit: `0` for the result
//! summary, `1` or `2` for a run result's try number. Packing is a total
//! bijection; [`ResultSummaryKey::unpack`] and [`RunResultKey::unpack`]
//! reject anything else.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Number of low bits reserved for the random component of an id.
const RANDOM_BITS: u32 = 20;

/// Transactional root of a task's entity group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate a fresh id for a task created at `now`.
    ///
    /// Newer tasks get numerically smaller ids (see module docs).
    pub fn allocate(now: DateTime<Utc>, rng: &mut impl Rng) -> Self {
        let millis = now.timestamp_millis().max(0) as u64;
        let random = u64::from(rng.gen::<u32>()) & ((1 << RANDOM_BITS) - 1);
        TaskId(!((millis << RANDOM_BITS) | random))
    }

    /// Rebuild an id from its raw value (store adapters, tests).
    pub fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Shard prefix for this id at the given sharding level (in nibbles).
    ///
    /// The shard is the entity-group partition: a low level (canary) funnels
    /// many tasks into few shards to force commit conflicts, a high level
    /// spreads production write load.
    pub fn shard(self, sharding_level: u8) -> String {
        let digest = Sha256::digest(self.0.to_be_bytes());
        let hex = hex::encode(digest);
        hex[..usize::from(sharding_level).min(hex.len())].to_string()
    }

    pub fn summary_key(self) -> ResultSummaryKey {
        ResultSummaryKey(self)
    }

    pub fn to_run_key(self) -> ToRunKey {
        ToRunKey(self)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Key of a task's client-visible result summary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ResultSummaryKey(TaskId);

impl ResultSummaryKey {
    pub fn task_id(self) -> TaskId {
        self.0
    }

    pub fn run_result_key(self, try_number: u8) -> RunResultKey {
        RunResultKey {
            task_id: self.0,
            try_number,
        }
    }

    pub fn pack(self) -> String {
        format!("{}0", self.0)
    }

    pub fn unpack(packed: &str) -> Result<Self, ValidationError> {
        let (id, suffix) = split_packed(packed)?;
        if suffix != 0 {
            return Err(ValidationError::MalformedPackedId(packed.to_string()));
        }
        Ok(ResultSummaryKey(id))
    }
}

/// Key of one attempt's run result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RunResultKey {
    task_id: TaskId,
    try_number: u8,
}

impl RunResultKey {
    pub fn new(task_id: TaskId, try_number: u8) -> Self {
        RunResultKey {
            task_id,
            try_number,
        }
    }

    pub fn task_id(self) -> TaskId {
        self.task_id
    }

    pub fn try_number(self) -> u8 {
        self.try_number
    }

    pub fn summary_key(self) -> ResultSummaryKey {
        ResultSummaryKey(self.task_id)
    }

    pub fn pack(self) -> String {
        format!("{}{}", self.task_id, self.try_number)
    }

    pub fn unpack(packed: &str) -> Result<Self, ValidationError> {
        let (task_id, try_number) = split_packed(packed)?;
        if !(1..=2).contains(&try_number) {
            return Err(ValidationError::MalformedPackedId(packed.to_string()));
        }
        Ok(RunResultKey {
            task_id,
            try_number,
        })
    }
}

/// Key of a task's dispatchable to-run marker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ToRunKey(TaskId);

impl ToRunKey {
    pub fn task_id(self) -> TaskId {
        self.0
    }
}

/// Split a packed id into its task id and suffix digit.
fn split_packed(packed: &str) -> Result<(TaskId, u8), ValidationError> {
    let malformed = || ValidationError::MalformedPackedId(packed.to_string());
    if packed.len() < 2 || !packed.is_ascii() {
        return Err(malformed());
    }
    let (hex_part, suffix) = packed.split_at(packed.len() - 1);
    let suffix = suffix.parse::<u8>().map_err(|_| malformed())?;
    let raw = u64::from_str_radix(hex_part, 16).map_err(|_| malformed())?;
    // Round-trip check: reject uppercase or zero-padded spellings so that
    // pack/unpack stays a bijection.
    if format!("{raw:x}") != hex_part {
        return Err(malformed());
    }
    Ok((TaskId(raw), suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn id_at(millis: i64) -> TaskId {
        let now = Utc.timestamp_millis_opt(millis).unwrap();
        let mut rng = rand::thread_rng();
        TaskId::allocate(now, &mut rng)
    }

    #[test]
    fn newer_tasks_get_smaller_ids() {
        let older = id_at(1_000_000);
        let newer = id_at(2_000_000);
        assert!(newer < older);
    }

    #[test]
    fn summary_pack_round_trips() {
        let key = id_at(1_234_567).summary_key();
        assert_eq!(ResultSummaryKey::unpack(&key.pack()).unwrap(), key);
    }

    #[test]
    fn run_result_pack_round_trips() {
        for try_number in [1, 2] {
            let key = id_at(1_234_567).summary_key().run_result_key(try_number);
            assert_eq!(RunResultKey::unpack(&key.pack()).unwrap(), key);
            assert_eq!(key.try_number(), try_number);
        }
    }

    #[test]
    fn unpack_rejects_malformed_ids() {
        for bad in ["", "0", "zzzz0", "12345", "123403", "ABCDEF0", "деадбиф0"] {
            assert!(ResultSummaryKey::unpack(bad).is_err(), "accepted {bad:?}");
        }
        // A summary suffix is not a run result and vice versa.
        let key = id_at(42_000).summary_key();
        assert!(RunResultKey::unpack(&key.pack()).is_err());
        let run = key.run_result_key(1);
        assert!(ResultSummaryKey::unpack(&run.pack()).is_err());
    }

    #[test]
    fn shard_width_follows_sharding_level() {
        let id = id_at(99_000);
        assert_eq!(id.shard(2).len(), 2);
        assert_eq!(id.shard(5).len(), 5);
        // Deterministic for a given id.
        assert_eq!(id.shard(5), id.shard(5));
    }

    #[test]
    fn derived_keys_share_the_task_id() {
        let id = id_at(7_000);
        assert_eq!(id.summary_key().task_id(), id);
        assert_eq!(id.to_run_key().task_id(), id);
        assert_eq!(id.summary_key().run_result_key(2).task_id(), id);
        assert_eq!(id.summary_key().run_result_key(2).summary_key(), id.summary_key());
    }
}
