//! Stored representation of cache entries.
//!
//! Every entry starts with a one-byte tag: `v` followed by the payload
//! for a value, or a lone `-` for the known-absent marker. An empty
//! payload is therefore a real (empty) value, never "absent".

use serde::de::DeserializeOwned;

use crate::error::CacheError;

const VALUE_TAG: u8 = b'v';
const ABSENT_TAG: u8 = b'-';

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached {
    Value(Vec<u8>),
    /// The key is known not to exist upstream.
    Absent,
}

impl Cached {
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Cached::Value(v) => Some(v.as_slice()),
            Cached::Absent => None,
        }
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Cached::Value(v) => Some(v),
            Cached::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Cached::Absent)
    }

    /// Decode a JSON value; `Ok(None)` for the absent marker.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>, CacheError> {
        match self {
            Cached::Value(v) => serde_json::from_slice(v).map(Some).map_err(CacheError::Decode),
            Cached::Absent => Ok(None),
        }
    }
}

pub(crate) fn encode_value(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(VALUE_TAG);
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn encode_absent() -> Vec<u8> {
    vec![ABSENT_TAG]
}

/// `None` if the bytes are not a valid entry.
pub(crate) fn decode(mut raw: Vec<u8>) -> Option<Cached> {
    match raw.first() {
        Some(&VALUE_TAG) => {
            raw.remove(0);
            Some(Cached::Value(raw))
        }
        Some(&ABSENT_TAG) if raw.len() == 1 => Some(Cached::Absent),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_value_is_not_absent() {
        assert_eq!(decode(encode_value(b"")), Some(Cached::Value(Vec::new())));
        assert_eq!(decode(encode_absent()), Some(Cached::Absent));
    }

    #[test]
    fn rejects_untagged_bytes() {
        assert_eq!(decode(Vec::new()), None);
        assert_eq!(decode(b"alice".to_vec()), None);
        assert_eq!(decode(b"-x".to_vec()), None);
    }

    #[test]
    fn json_helpers() {
        let hit = decode(encode_value(br#"{"id":42}"#)).unwrap();
        let v: serde_json::Value = hit.json().unwrap().unwrap();
        assert_eq!(v["id"], 42);
        assert_eq!(Cached::Absent.json::<serde_json::Value>().unwrap(), None);
        assert!(matches!(
            Cached::Value(b"not json".to_vec()).json::<serde_json::Value>(),
            Err(CacheError::Decode(_))
        ));
    }
}
