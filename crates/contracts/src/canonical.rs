use hex::ToHex;
use sha2::Digest;
use unicode_normalization::UnicodeNormalization;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// NFC-normalizes text and folds CR/CRLF line endings to LF.
pub fn normalize_text(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .nfc()
        .collect::<String>()
}

/// Recursively sorts object keys. Array order is meaningful and kept.
pub fn canonicalize_json_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(canonicalize_json_value).collect())
        }
        serde_json::Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();

            let mut out = serde_json::Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    out.insert(key.clone(), canonicalize_json_value(inner));
                }
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}

pub fn canonical_json_bytes(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&canonicalize_json_value(value)).unwrap_or_else(|_| b"null".to_vec())
}

pub fn canonical_json_string(value: &serde_json::Value) -> String {
    String::from_utf8(canonical_json_bytes(value)).unwrap_or_else(|_| "null".to_string())
}

pub fn hash_canonical_json(value: &serde_json::Value) -> String {
    sha256_hex(&canonical_json_bytes(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_object_keys_are_sorted() {
        let value = serde_json::json!({
            "results": {"suppressed_count": 1, "row_count": 4},
            "request_id": "r1"
        });

        assert_eq!(
            canonical_json_string(&value),
            r#"{"request_id":"r1","results":{"row_count":4,"suppressed_count":1}}"#
        );
    }

    #[test]
    fn insertion_order_does_not_change_hash() {
        let mut a = serde_json::Map::new();
        a.insert("x".to_string(), serde_json::json!(1));
        a.insert("y".to_string(), serde_json::json!([3, 2]));
        let mut b = serde_json::Map::new();
        b.insert("y".to_string(), serde_json::json!([3, 2]));
        b.insert("x".to_string(), serde_json::json!(1));

        assert_eq!(
            hash_canonical_json(&serde_json::Value::Object(a)),
            hash_canonical_json(&serde_json::Value::Object(b))
        );
    }

    #[test]
    fn normalize_text_folds_line_endings_and_composes() {
        assert_eq!(normalize_text("a\r\nb\rc e\u{0301}"), "a\nb\nc \u{00e9}");
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        let h = sha256_hex(b"abc");
        assert!(is_sha256_hex(&h));
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
