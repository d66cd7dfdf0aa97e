//! Relay wire format.
//!
//! Every frame is a JSON text message:
//! `{"type": "<kind>", "timestamp": <unix seconds>, "data": {...}}`

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tally::{InputDescriptor, TallyState, TallyTag};

use super::RelayError;

/// Message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TallyUpdate,
    Ping,
    Pong,
    InputList,
    StreamStatus,
    AuthInfo,
    /// Anything this client does not know about
    #[serde(other)]
    Unknown,
}

/// One relay frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub data: Value,
}

/// `tally_update` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TallyUpdate {
    pub program: u32,
    pub preview: u32,
    pub program_info: Option<InputDescriptor>,
    pub preview_info: Option<InputDescriptor>,
    /// Tag per input number
    #[serde(default)]
    pub states: BTreeMap<u32, TallyTag>,
    #[serde(default)]
    pub input_names: BTreeMap<u32, String>,
}

/// `input_list` payload. Keys go over the wire as strings (`"7"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputList {
    pub inputs: BTreeMap<u32, InputDescriptor>,
}

/// `stream_status` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub stream_name: String,
    pub status: String,
}

/// `auth_info` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub user_id: String,
    pub unique_address: String,
}

/// Current wall clock as fractional unix seconds
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl RelayMessage {
    /// Build a message stamped with the current time.
    pub fn new<T: Serialize>(kind: MessageKind, data: &T) -> Self {
        Self {
            kind,
            timestamp: now_timestamp(),
            data: serde_json::to_value(data).unwrap_or_default(),
        }
    }

    pub fn tally_update(state: &TallyState) -> Self {
        let update = TallyUpdate {
            program: state.program,
            preview: state.preview,
            program_info: state.program_input().cloned(),
            preview_info: state.preview_input().cloned(),
            states: state.tally_map(),
            input_names: state.input_names(),
        };
        Self::new(MessageKind::TallyUpdate, &update)
    }

    pub fn input_list(state: &TallyState) -> Self {
        let list = InputList {
            inputs: state.inputs.clone(),
        };
        Self::new(MessageKind::InputList, &list)
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, &Map::new())
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, &Map::new())
    }

    pub fn stream_status(stream_name: &str, status: &str) -> Self {
        let payload = StreamStatus {
            stream_name: stream_name.to_string(),
            status: status.to_string(),
        };
        Self::new(MessageKind::StreamStatus, &payload)
    }

    pub fn auth_info(user_id: &str, unique_address: &str) -> Self {
        let payload = AuthInfo {
            user_id: user_id.to_string(),
            unique_address: unique_address.to_string(),
        };
        Self::new(MessageKind::AuthInfo, &payload)
    }

    /// Decode the `data` field into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, RelayError> {
        serde_json::from_value(self.data.clone()).map_err(|e| RelayError::Decode(e.to_string()))
    }

    /// (program, preview, input names) carried by a `tally_update`.
    pub fn tally_summary(&self) -> Result<(u32, u32, BTreeMap<u32, String>), RelayError> {
        if self.kind != MessageKind::TallyUpdate {
            return Err(RelayError::Decode(format!("expected tally_update, got {:?}", self.kind)));
        }
        let update: TallyUpdate = self.payload()?;
        Ok((update.program, update.preview, update.input_names))
    }

    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Decode(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::Decode(e.to_string()))
    }
}
