//! Opaque MessagePack payloads
//!
//! Arguments and results cross thread, process and network boundaries as
//! serialized blobs. The protocol never interprets plugin-specific data;
//! typed access happens at the two ends via [`Payload::encode`] and
//! [`Payload::decode`].

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when converting values to or from a payload
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload encoding failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    #[error("payload decoding failed: {0}")]
    Decode(#[source] rmp_serde::decode::Error),
}

/// An opaque MessagePack-encoded value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Serialize a value into a payload
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, PayloadError> {
        rmp_serde::to_vec(value)
            .map(Payload)
            .map_err(PayloadError::Encode)
    }

    /// Deserialize the payload into a concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        rmp_serde::from_slice(&self.0).map_err(PayloadError::Decode)
    }

    /// The encoding of `()`, used where a method takes or returns nothing
    pub fn unit() -> Self {
        // Encoding a unit value cannot fail.
        Payload(rmp_serde::to_vec(&()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let payload = Payload::encode(&("hello", 42i64)).unwrap();
        let (s, n): (String, i64) = payload.decode().unwrap();
        assert_eq!(s, "hello");
        assert_eq!(n, 42);
    }

    #[test]
    fn decode_wrong_type_fails() {
        let payload = Payload::encode(&"a string").unwrap();
        let result: Result<Vec<i64>, _> = payload.decode();
        assert!(result.is_err());
    }

    #[test]
    fn unit_payload_decodes_as_unit() {
        let payload = Payload::unit();
        payload.decode::<()>().unwrap();
    }
}
