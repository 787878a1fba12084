//! Strata wire format: the JSON envelope exchanged between peers.
//!
//! Every request is a JSON object carrying `protocol`, `requestType` and,
//! on the persistent transport, a `requestId`. Remaining keys are the
//! request's own fields. Responses are JSON objects; failures carry an
//! `error` code and sometimes a `cause`.
//!
//! The envelope is parsed leniently: `protocol`, `requestType` and
//! `requestId` are kept as raw JSON values so that a wrong type is
//! classified (unsupported protocol, unknown request type) rather than
//! rejected as malformed.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chunk::{ChunkDescriptor, FileChunk, IntegrityError};

/// The single protocol version this node speaks.
pub const PROTOCOL_VERSION: i64 = 1;

/// Upper bound on a request body. Larger requests are treated as malformed.
pub const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

pub const PROTOCOL_KEY: &str = "protocol";
pub const REQUEST_TYPE_KEY: &str = "requestType";
pub const REQUEST_ID_KEY: &str = "requestId";

// ── Request types ────────────────────────────────────────────────────────────

/// Every request type the peer protocol names.
///
/// Only some are served by this crate; the block-sync ones are recognised
/// so that the dispatch table can be extended by the node without
/// changing the wire vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    /// Handshake. The only request accepted before the peer's version is known.
    GetInfo,
    GetPeers,
    AddPeers,
    GetFileDownloadInfo,
    GetFileChunk,
    GetShardingInfo,
    GetCumulativeDifficulty,
    GetMilestoneBlockIds,
    GetNextBlockIds,
    GetNextBlocks,
    GetTransactions,
    GetUnconfirmedTransactions,
    ProcessBlock,
    ProcessTransactions,
}

impl RequestType {
    pub const ALL: [RequestType; 14] = [
        RequestType::GetInfo,
        RequestType::GetPeers,
        RequestType::AddPeers,
        RequestType::GetFileDownloadInfo,
        RequestType::GetFileChunk,
        RequestType::GetShardingInfo,
        RequestType::GetCumulativeDifficulty,
        RequestType::GetMilestoneBlockIds,
        RequestType::GetNextBlockIds,
        RequestType::GetNextBlocks,
        RequestType::GetTransactions,
        RequestType::GetUnconfirmedTransactions,
        RequestType::ProcessBlock,
        RequestType::ProcessTransactions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::GetInfo => "getInfo",
            RequestType::GetPeers => "getPeers",
            RequestType::AddPeers => "addPeers",
            RequestType::GetFileDownloadInfo => "getFileDownloadInfo",
            RequestType::GetFileChunk => "getFileChunk",
            RequestType::GetShardingInfo => "getShardingInfo",
            RequestType::GetCumulativeDifficulty => "getCumulativeDifficulty",
            RequestType::GetMilestoneBlockIds => "getMilestoneBlockIds",
            RequestType::GetNextBlockIds => "getNextBlockIds",
            RequestType::GetNextBlocks => "getNextBlocks",
            RequestType::GetTransactions => "getTransactions",
            RequestType::GetUnconfirmedTransactions => "getUnconfirmedTransactions",
            RequestType::ProcessBlock => "processBlock",
            RequestType::ProcessTransactions => "processTransactions",
        }
    }

    /// The handshake request type.
    pub fn is_handshake(self) -> bool {
        self == RequestType::GetInfo
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownRequestType(s.to_string()))
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("request is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request is not a JSON object")]
    NotAnObject,
    #[error("request of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),
    #[error("unknown request type: {0}")]
    UnknownRequestType(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {0}: {1}")]
    InvalidField(&'static str, serde_json::Error),
}

/// A parsed peer request.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    protocol: Option<Value>,
    request_type: Option<Value>,
    request_id: Option<Value>,
    fields: Map<String, Value>,
}

impl Envelope {
    /// Build an outbound request for the supported protocol.
    pub fn request(request_type: RequestType) -> Self {
        Self {
            protocol: Some(Value::from(PROTOCOL_VERSION)),
            request_type: Some(Value::from(request_type.as_str())),
            request_id: None,
            fields: Map::new(),
        }
    }

    /// Parse a raw request body, enforcing `max_bytes`.
    pub fn parse(raw: &str, max_bytes: usize) -> Result<Self, EnvelopeError> {
        if raw.len() > max_bytes {
            return Err(EnvelopeError::TooLarge(raw.len(), max_bytes));
        }
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(Self::from_map(map)),
            _ => Err(EnvelopeError::NotAnObject),
        }
    }

    pub fn from_map(mut map: Map<String, Value>) -> Self {
        Self {
            protocol: map.remove(PROTOCOL_KEY),
            request_type: map.remove(REQUEST_TYPE_KEY),
            request_id: map.remove(REQUEST_ID_KEY),
            fields: map,
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_request_id(mut self, id: u64) -> Self {
        self.request_id = Some(Value::from(id));
        self
    }

    /// The `protocol` field as an integer. Integral floats such as `1.0`
    /// count; fractional values and non-numbers do not.
    pub fn protocol(&self) -> Option<i64> {
        let value = self.protocol.as_ref()?;
        value.as_i64().or_else(|| {
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(f))
                .map(|f| f as i64)
        })
    }

    pub fn is_supported_protocol(&self) -> bool {
        self.protocol() == Some(PROTOCOL_VERSION)
    }

    /// The raw `requestType` string, if present.
    pub fn request_type_name(&self) -> Option<&str> {
        self.request_type.as_ref().and_then(Value::as_str)
    }

    pub fn request_type(&self) -> Option<RequestType> {
        self.request_type_name().and_then(|s| s.parse().ok())
    }

    /// The persistent-transport request id. Zero counts as absent.
    pub fn request_id(&self) -> Option<u64> {
        self.request_id
            .as_ref()
            .and_then(Value::as_u64)
            .filter(|id| *id != 0)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Deserialize a required request field.
    pub fn field<T: DeserializeOwned>(&self, key: &'static str) -> Result<T, EnvelopeError> {
        let value = self
            .fields
            .get(key)
            .ok_or(EnvelopeError::MissingField(key))?;
        serde_json::from_value(value.clone()).map_err(|e| EnvelopeError::InvalidField(key, e))
    }

    /// Deserialize an optional request field. Present-but-invalid is an error.
    pub fn optional_field<T: DeserializeOwned>(
        &self,
        key: &'static str,
    ) -> Result<Option<T>, EnvelopeError> {
        match self.fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| EnvelopeError::InvalidField(key, e)),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        if let Some(p) = &self.protocol {
            map.insert(PROTOCOL_KEY.into(), p.clone());
        }
        if let Some(t) = &self.request_type {
            map.insert(REQUEST_TYPE_KEY.into(), t.clone());
        }
        if let Some(id) = &self.request_id {
            map.insert(REQUEST_ID_KEY.into(), id.clone());
        }
        Value::Object(map)
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Extract `requestId` from a raw frame without a full envelope parse.
/// Used to correlate an error response when the frame itself is bad.
pub fn peek_request_id(raw: &str) -> Option<u64> {
    serde_json::from_str::<Value>(raw)
        .ok()?
        .get(REQUEST_ID_KEY)?
        .as_u64()
        .filter(|id| *id != 0)
}

// ── Responses ────────────────────────────────────────────────────────────────

/// Sentinel error codes returned to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnsupportedProtocol,
    UnsupportedRequestType,
    SequenceError,
    MaxInboundConnections,
    Downloading,
    LightClient,
    Blacklisted,
    UnknownPeer,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorCode::UnsupportedRequestType => "UNSUPPORTED_REQUEST_TYPE",
            ErrorCode::SequenceError => "SEQUENCE_ERROR",
            ErrorCode::MaxInboundConnections => "MAX_INBOUND_CONNECTIONS",
            ErrorCode::Downloading => "DOWNLOADING",
            ErrorCode::LightClient => "LIGHT_CLIENT",
            ErrorCode::Blacklisted => "BLACKLISTED",
            ErrorCode::UnknownPeer => "UNKNOWN_PEER",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::from(s)).map_err(|_| ())
    }
}

/// A response body: a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerResponse(Map<String, Value>);

impl PeerResponse {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn error(code: ErrorCode) -> Self {
        Self::new().with("error", code.as_str())
    }

    pub fn error_with_cause(code: ErrorCode, cause: impl Into<String>) -> Self {
        Self::error(code).with("cause", cause.into())
    }

    pub fn blacklisted(cause: impl Into<String>) -> Self {
        Self::error_with_cause(ErrorCode::Blacklisted, cause)
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Serialize `value` into a field. Serialization of plain data types
    /// does not fail; if it does, the field is set to null.
    pub fn with_serialized<T: Serialize>(self, key: &str, value: &T) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.with(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.0.get("error")?.as_str()?.parse().ok()
    }

    pub fn cause(&self) -> Option<&str> {
        self.0.get("cause")?.as_str()
    }

    pub fn is_error(&self) -> bool {
        self.0.contains_key("error")
    }

    /// Attach the persistent-transport correlation id.
    pub fn with_request_id(self, id: Option<u64>) -> Self {
        match id {
            Some(id) => self.with(REQUEST_ID_KEY, id),
            None => self,
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        self.0.get(REQUEST_ID_KEY)?.as_u64()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

impl From<Map<String, Value>> for PeerResponse {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ── Chunk payloads ───────────────────────────────────────────────────────────

pub const FILE_ID_KEY: &str = "fileId";
pub const FILE_CHUNK_KEY: &str = "fileChunk";
pub const FILE_DOWNLOAD_INFO_KEY: &str = "fileDownloadInfo";

/// On-wire form of a chunk: layout fields plus base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub file_id: String,
    pub chunk_id: u64,
    pub offset: u64,
    pub size: u64,
    pub crc: u32,
    #[serde(rename = "mime64data")]
    pub data: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkDecodeError {
    #[error("chunk payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

impl ChunkPayload {
    pub fn encode(chunk: &FileChunk) -> Self {
        Self {
            file_id: chunk.file_id.clone(),
            chunk_id: chunk.descriptor.chunk_id,
            offset: chunk.descriptor.offset,
            size: chunk.descriptor.size,
            crc: chunk.descriptor.crc,
            data: base64::engine::general_purpose::STANDARD.encode(&chunk.data),
        }
    }

    /// Decode the payload and check it against the advertised size and CRC.
    pub fn decode(self) -> Result<FileChunk, ChunkDecodeError> {
        let data = base64::engine::general_purpose::STANDARD.decode(self.data.as_bytes())?;
        let descriptor = ChunkDescriptor {
            chunk_id: self.chunk_id,
            offset: self.offset,
            size: self.size,
            crc: self.crc,
        };
        descriptor.verify(&data)?;
        Ok(FileChunk {
            file_id: self.file_id,
            descriptor,
            data: Bytes::from(data),
        })
    }
}

/// Build a `getFileChunk` request for one chunk.
pub fn file_chunk_request(file_id: &str, chunk: &ChunkDescriptor) -> Envelope {
    Envelope::request(RequestType::GetFileChunk)
        .with_field(FILE_ID_KEY, file_id)
        .with_field("chunkId", chunk.chunk_id)
        .with_field("offset", chunk.offset)
        .with_field("size", chunk.size)
}
