//! Payload serialization shared by every process.
//!
//! A value written by one process must decode in any other, so every tier
//! that leaves the process stores exactly the bytes produced here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Reserved payload marking "checked, no value exists".
///
/// Neither JSON nor MessagePack output can equal it: JSON never starts with
/// `@`, and a MessagePack positive fixint is a complete one-byte document.
pub const NULL_SENTINEL: &[u8] = b"@@NULL@@";

/// Whether a stored payload is the null sentinel.
pub fn is_null_sentinel(payload: &[u8]) -> bool {
    payload == NULL_SENTINEL
}

/// Wire format of cached values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::MessagePack => "messagepack",
        }
    }
}
