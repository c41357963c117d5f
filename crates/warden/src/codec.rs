// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Value encoding for the store.
//!
//! Values are stored as JSON. Any type with serde support round-trips, including nested
//! structures, collections, optional fields and timestamps that serialize through their serde
//! representation. Cyclic values cannot be expressed with owned data and are not supported.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Result;

/// Encodes a value for storage.
///
/// # Errors
///
/// Returns [`Error::Codec`](crate::Error::Codec) when the value's `Serialize` implementation fails,
/// for example for a map with non-string keys.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decodes a stored value.
///
/// # Errors
///
/// Returns [`Error::Codec`](crate::Error::Codec) when the bytes are not a valid encoding of `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Encodes a value with object keys in sorted order, so equal values always encode identically.
pub(crate) fn encode_canonical<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    // `serde_json::Value` keeps object keys in a sorted map
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        tags: Vec<String>,
        limits: BTreeMap<String, u32>,
        nickname: Option<String>,
    }

    #[test]
    fn nested_structures_round_trip() {
        let profile = Profile {
            name: "ada".to_string(),
            tags: vec!["admin".to_string(), "ops".to_string()],
            limits: BTreeMap::from([("requests".to_string(), 10)]),
            nickname: None,
        };

        let decoded: Profile = decode(&encode(&profile).unwrap()).unwrap();

        assert_eq!(decoded, profile);
    }

    #[test]
    fn decode_rejects_mismatched_type() {
        let bytes = encode(&"text").unwrap();

        let error = decode::<u32>(&bytes).unwrap_err();

        assert!(matches!(error, crate::Error::Codec(_)));
    }

    #[test]
    fn canonical_encoding_ignores_map_order() {
        let first: HashMap<&str, u32> = (0..32).map(|i| (["a", "b", "c", "d"][i % 4], u32::try_from(i).unwrap())).collect();
        let mut second = HashMap::new();
        for (key, value) in &first {
            second.insert(*key, *value);
        }

        assert_eq!(encode_canonical(&first).unwrap(), encode_canonical(&second).unwrap());
    }
}
