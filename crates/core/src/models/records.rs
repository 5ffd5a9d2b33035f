use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;
use crate::models::NodeEndpoint;
use crate::traits::SessionId;

/// Payload of an ephemeral claim entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub endpoint: NodeEndpoint,
    pub service_version: String,
    pub session: SessionId,
    pub claimed_at: DateTime<Utc>,
}

/// Payload of a done marker, rewritten after every completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneRecord {
    pub endpoint: NodeEndpoint,
    pub service_version: String,
    pub completed_runs: u64,
    pub completed_at: DateTime<Utc>,
}

macro_rules! json_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn to_bytes(&self) -> Result<Vec<u8>, SchedulerError> {
                Ok(serde_json::to_vec(self)?)
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self, SchedulerError> {
                Ok(serde_json::from_slice(bytes)?)
            }
        }
    };
}

json_codec!(ClaimRecord);
json_codec!(DoneRecord);
