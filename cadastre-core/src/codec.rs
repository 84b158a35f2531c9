//! Postcard encode/decode helpers.
//!
//! Every wire structure and every persisted value in cadastre uses postcard
//! with the schema fixed by the Rust type definitions. Postcard is stable
//! and non-self-describing; peers agree on bytes because they agree on the
//! types.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value to its postcard bytes.
///
/// # Errors
/// Returns [`CodecError`] if serialization fails, which for the closed set
/// of cadastre types indicates a bug rather than bad input.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(CodecError::from)
}

/// Decode a value from postcard bytes.
///
/// # Errors
/// Returns [`CodecError`] on truncated or malformed input.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(CodecError::from)
}

/// Wire or storage encoding failure.
#[derive(Debug)]
pub struct CodecError {
    inner: postcard::Error,
}

impl From<postcard::Error> for CodecError {
    fn from(inner: postcard::Error) -> Self {
        Self { inner }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "codec error: {}", self.inner)
    }
}

impl std::error::Error for CodecError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Addr, Range};

    #[test]
    fn range_roundtrip() {
        let r = Range::new(Addr(16), Addr(32));
        let bytes = encode(&r).unwrap();
        let back: Range = decode(&bytes).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let r = Range::new(Addr(16), Addr(32));
        let bytes = encode(&r).unwrap();
        assert!(decode::<Range>(&bytes[..bytes.len() - 1]).is_err());
    }
}
