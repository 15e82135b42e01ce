// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Serde helpers for base64-encoded byte buffers in the archive JSON.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// `Vec<u8>` as a base64 string, the standard JSON convention for byte
/// buffers in archive files.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BASE64.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// `HashMap<String, Vec<u8>>` with base64 string values (the `Certs` map).
pub mod base64_bytes_map {
    use super::*;

    pub fn serialize<S>(
        map: &HashMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: HashMap<&str, String> = map
            .iter()
            .map(|(k, v)| (k.as_str(), BASE64.encode(v)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = HashMap::<String, String>::deserialize(deserializer)?;
        let mut map = HashMap::with_capacity(encoded.len());
        for (k, v) in encoded {
            let bytes = BASE64.decode(v.as_bytes()).map_err(serde::de::Error::custom)?;
            map.insert(k, bytes);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(with = "base64_bytes_map")]
        by_host: HashMap<String, Vec<u8>>,
    }

    #[test]
    fn bytes_roundtrip_through_base64_strings() {
        let mut by_host = HashMap::new();
        by_host.insert("example.com".to_string(), vec![0x30, 0x82, 0x01, 0x00]);
        let blob = Blob {
            data: b"\x00\x01\xfebinary".to_vec(),
            by_host,
        };

        let s = serde_json::to_string(&blob).expect("serialize");
        // Byte buffers must be strings in the JSON, not integer arrays.
        let v: serde_json::Value = serde_json::from_str(&s).expect("parse");
        assert!(v["data"].is_string());
        assert!(v["by_host"]["example.com"].is_string());

        let back: Blob = serde_json::from_str(&s).expect("deserialize");
        assert_eq!(back.data, blob.data);
        assert_eq!(back.by_host["example.com"], vec![0x30, 0x82, 0x01, 0x00]);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let res: Result<Blob, _> =
            serde_json::from_str(r#"{"data":"!!not-base64!!","by_host":{}}"#);
        assert!(res.is_err());
    }
}
