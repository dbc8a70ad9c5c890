//! Core data model.
//!
//! A queue item is an opaque payload with a priority. It is stored as a
//! sorted-set member (its JSON encoding) scored by that priority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Queue Item
// ---------------------------------------------------------------------------

/// A unit of work sitting in (or just taken from) a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Random identity. Two pushes of the same payload in the same
    /// instant still encode to different members, so neither overwrites
    /// the other in the sorted set.
    pub id: ItemId,

    /// Application data. The queue never interprets it.
    #[serde(rename = "data")]
    pub payload: serde_json::Value,

    /// Lower = more urgent. Also used as the member's score.
    pub priority: i64,

    #[serde(rename = "timestamp")]
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(payload: serde_json::Value, priority: i64) -> Self {
        Self {
            id: ItemId::new(),
            payload,
            priority,
            enqueued_at: Utc::now(),
        }
    }

    /// Encode as a sorted-set member.
    pub fn to_member(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a sorted-set member.
    pub fn from_member(member: &str) -> Result<Self> {
        Ok(serde_json::from_str(member)?)
    }
}

/// Newtype for queue item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Priorities
// ---------------------------------------------------------------------------

/// Largest priority magnitude a Redis score (an f64) holds exactly.
pub const MAX_PRIORITY_MAGNITUDE: i64 = 1 << 53;

/// Check that `priority` survives the round trip through a store score.
pub fn validate_priority(priority: i64) -> Result<()> {
    if priority.unsigned_abs() > MAX_PRIORITY_MAGNITUDE as u64 {
        return Err(Error::InvalidPriority(priority));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Queue Names
// ---------------------------------------------------------------------------

/// Longest queue name accepted, in bytes.
pub const MAX_QUEUE_NAME_LEN: usize = 512;

/// Check that `name` is usable as a store key.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_QUEUE_NAME_LEN
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn member_encoding_uses_wire_field_names() {
        let item = QueueItem::new(json!({"task_id": 7}), 2);
        let member = item.to_member().unwrap();
        let raw: serde_json::Value = serde_json::from_str(&member).unwrap();
        assert_eq!(raw["data"]["task_id"], 7);
        assert_eq!(raw["priority"], 2);
        assert!(raw["timestamp"].is_string());
        assert!(raw["id"].is_string());
    }

    #[test]
    fn identical_payloads_encode_to_distinct_members() {
        let a = QueueItem::new(json!("same"), 1);
        let mut b = a.clone();
        b.id = ItemId::new();
        assert_ne!(a.to_member().unwrap(), b.to_member().unwrap());
    }

    #[test]
    fn malformed_member_is_a_serialization_error() {
        let err = QueueItem::from_member("{not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn priority_range_matches_exact_doubles() {
        assert!(validate_priority(0).is_ok());
        assert!(validate_priority(MAX_PRIORITY_MAGNITUDE).is_ok());
        assert!(validate_priority(-MAX_PRIORITY_MAGNITUDE).is_ok());
        assert!(validate_priority(MAX_PRIORITY_MAGNITUDE + 1).is_err());
        assert!(validate_priority(i64::MIN).is_err());
    }

    #[test]
    fn queue_name_rules() {
        assert!(validate_queue_name("task_queue").is_ok());
        assert!(validate_queue_name("jobs:high").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("two words").is_err());
        assert!(validate_queue_name("tab\there").is_err());
        assert!(validate_queue_name(&"q".repeat(MAX_QUEUE_NAME_LEN + 1)).is_err());
    }
}
