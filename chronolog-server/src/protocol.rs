//! JSON wire protocol.
//!
//! Every frame is a text JSON envelope:
//! ```text
//! { "id": "42", "type": "insert", "data": "[{\"ts\":1,\"uid\":\"u\",...}]" }
//!                   │                 │
//!                   │                 └─ JSON encoded a second time as a string
//!                   └─ api-key | insert | query | query-user | delete-user
//! ```
//!
//! Responses always echo `id`:
//! - insert, delete-user, api-key: `{"id":"42"}`
//! - query: `{"id":"42","records":{"<uid>":{"ts":1,"data":"x"}}}`
//! - query-user: `{"id":"42","records":[{"ts":1,"data":"x"}]}`

use std::collections::BTreeMap;

use chronolog_store::{Record, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Shared-secret handshake, must come first
    ApiKey,
    /// Batch of records to store
    Insert,
    /// Latest record per uid at or before a timestamp
    Query,
    /// Records of one uid between two timestamps
    QueryUser,
    /// Remove a uid from one or every collection
    DeleteUser,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: Option<String>,
    #[serde(rename = "type")]
    msg_type: Option<MessageType>,
    data: Option<String>,
}

/// A decoded request envelope with every field present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub msg_type: MessageType,
    pub data: String,
}

impl Envelope {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        Ok(Self {
            id: raw.id.ok_or(ProtocolError::MissingField("id"))?,
            msg_type: raw.msg_type.ok_or(ProtocolError::MissingField("type"))?,
            data: raw.data.ok_or(ProtocolError::MissingField("data"))?,
        })
    }

    /// Parse the doubly encoded `data` string into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(&self.data).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }
}

/// One element of an `insert` batch. All fields are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertItem {
    pub ts: Option<i64>,
    pub uid: Option<String>,
    pub data: Option<String>,
    pub collection: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub ts: Option<i64>,
    pub collection: Option<String>,
    /// Empty or absent means every uid
    #[serde(default)]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryUserRequest {
    pub uid: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub collection: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteUserRequest {
    pub uid: Option<String>,
    /// Empty or absent means every collection
    #[serde(default)]
    pub collection: Option<String>,
}

/// `{id}` acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub id: String,
    pub records: BTreeMap<String, Record>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryUserResponse {
    pub id: String,
    pub records: Vec<Record>,
}

/// Encode any response as a text frame body.
pub fn encode<T: Serialize>(response: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(response).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Protocol errors. Any of these closes the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MalformedEnvelope(String),
    MissingField(&'static str),
    InvalidPayload(String),
    /// Wrong secret, or a request before the `api-key` handshake
    Unauthorized,
    UnsupportedFrame,
    Store(StoreError),
    Serialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedEnvelope(e) => write!(f, "Malformed envelope: {e}"),
            Self::MissingField(name) => write!(f, "{name} is required"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::Unauthorized => write!(f, "Invalid or missing API key"),
            Self::UnsupportedFrame => write!(f, "Only text frames are supported"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<StoreError> for ProtocolError {
    fn from(e: StoreError) -> Self {
        ProtocolError::Store(e)
    }
}
