//! Serde helpers for byte fields persisted through the blob store.

/// Hex string representation for `Vec<u8>` fields.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Blob {
        #[serde(with = "super::hex_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_hex_field() {
        let json = serde_json::to_string(&Blob {
            data: vec![0xde, 0xad],
        })
        .unwrap();
        assert_eq!(json, r#"{"data":"dead"}"#);
        assert!(serde_json::from_str::<Blob>(r#"{"data":"zz"}"#).is_err());
    }
}
