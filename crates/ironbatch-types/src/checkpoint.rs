//! Reader/writer restart tokens persisted at each checkpoint boundary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which artifact produced a checkpoint token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointRole {
    Reader,
    Writer,
}

impl CheckpointRole {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointRole::Reader => "READER",
            CheckpointRole::Writer => "WRITER",
        }
    }
}

impl fmt::Display for CheckpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a checkpoint token: job instance + step + role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub instance_id: Uuid,
    pub step_id: String,
    pub role: CheckpointRole,
}

impl CheckpointKey {
    pub fn new(instance_id: Uuid, step_id: impl Into<String>, role: CheckpointRole) -> Self {
        Self {
            instance_id,
            step_id: step_id.into(),
            role,
        }
    }
}

/// An opaque serialized restart token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub key: CheckpointKey,
    pub token: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointData {
    pub fn new(key: CheckpointKey, token: Vec<u8>) -> Self {
        Self {
            key,
            token,
            updated_at: Utc::now(),
        }
    }
}
