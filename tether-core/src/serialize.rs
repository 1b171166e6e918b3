//! Payload serialization
//!
//! Pushed payloads are either already-encoded bytes, passed through untouched,
//! or structured values encoded by the configured [`Serializer`].

use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

/// Encodes structured payloads into the bytes sent to clients
pub trait Serializer: Send + Sync {
    fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>>;

    fn unmarshal(&self, data: &[u8]) -> Result<serde_json::Value>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn unmarshal(&self, data: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(data)?)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// A message body handed to the push API
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Already encoded, sent as-is
    Raw(Bytes),
    /// Encoded with the configured serializer at push time
    Value(serde_json::Value),
}

impl Payload {
    /// Capture any serializable value as a structured payload
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    /// Bytes to put on the wire
    pub fn serialize_or_raw(&self, serializer: &dyn Serializer) -> Result<Bytes> {
        match self {
            Self::Raw(data) => Ok(data.clone()),
            Self::Value(value) => serializer.marshal(value).map(Bytes::from),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::Raw(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Raw(Bytes::from(data))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(data: &'static [u8]) -> Self {
        Self::Raw(Bytes::from_static(data))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}
