//! Request deduplication
//!
//! Rejects byte-identical requests from the same client inside a
//! configurable window. Keyed on a canonical-JSON fingerprint scoped by
//! client identity, path and model.

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;

/// Serialized fingerprints are capped; bodies differing only past this
/// length count as duplicates, which is the safer direction
const FINGERPRINT_JSON_CAP: usize = 4096;

/// Sliding-window duplicate tracker
pub struct RequestDeduper {
    window_ms: u64,
    max_keys: usize,
    seen: Mutex<HashMap<String, u64>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serialize with sorted keys so field order never changes the fingerprint.
fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    if out.len() > FINGERPRINT_JSON_CAP {
        let mut cut = FINGERPRINT_JSON_CAP;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

/// SHA-256 fingerprint of a request body.
pub fn fingerprint(body: &Value) -> String {
    let canonical = canonical_json(body);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Fingerprint with named top-level keys removed (e.g. `model`).
pub fn fingerprint_drop(body: &Value, drop_keys: &[&str]) -> String {
    match body {
        Value::Object(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !drop_keys.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            fingerprint(&Value::Object(filtered))
        }
        other => fingerprint(other),
    }
}

/// Client identity for scoping: end-user header, then key fingerprint,
/// then remote IP.
pub fn client_id(headers: &HeaderMap, remote_ip: &str) -> String {
    let end_user = headers
        .get("x-end-user-id")
        .or_else(|| headers.get("x-user-id"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty());
    if let Some(uid) = end_user {
        let uid: String = uid.chars().take(80).collect();
        return format!("u:{}", uid);
    }

    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let digest = hex::encode(Sha256::digest(auth.as_bytes()));
        return format!("k:{}", &digest[..12]);
    }

    remote_ip.to_string()
}

/// Dedup key: `client|path|model|fingerprint`.
pub fn make_key(client: &str, path: &str, model: &str, fp: &str) -> String {
    format!("{}|{}|{}|{}", client, path, model, fp)
}

/// `X-Dedupe-Bypass: 1` skips the check entirely.
pub fn bypass_requested(headers: &HeaderMap) -> bool {
    headers
        .get("x-dedupe-bypass")
        .and_then(|v| v.to_str().ok())
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl RequestDeduper {
    pub fn new(window_ms: u64, max_keys: usize) -> Self {
        Self {
            window_ms,
            max_keys: max_keys.max(100),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.window_ms > 0
    }

    /// Check a key and mark it seen.
    ///
    /// Returns `Some(retry_after_ms)` when the key is a duplicate inside the
    /// window, `None` otherwise. A window of 0 disables dedup entirely.
    pub fn check_and_mark(&self, key: &str) -> Option<u64> {
        if self.window_ms == 0 {
            return None;
        }
        let now = now_ms();
        let mut seen = self.seen.lock();

        if let Some(&last) = seen.get(key) {
            let elapsed = now.saturating_sub(last);
            if elapsed < self.window_ms {
                return Some((self.window_ms - elapsed).max(1));
            }
        }

        seen.insert(key.to_string(), now);
        if seen.len() > self.max_keys {
            // Full reset on overflow keeps the common path O(1)
            seen.clear();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let b = json!({"messages": [{"role": "user", "content": "hi"}], "model": "m"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_drop_model() {
        let a = json!({"model": "m1", "messages": []});
        let b = json!({"model": "m2", "messages": []});
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(
            fingerprint_drop(&a, &["model"]),
            fingerprint_drop(&b, &["model"])
        );
    }

    #[test]
    fn test_duplicate_inside_window() {
        let deduper = RequestDeduper::new(60_000, 100);
        assert!(deduper.check_and_mark("k").is_none());
        let retry = deduper.check_and_mark("k").expect("duplicate");
        assert!(retry > 0 && retry <= 60_000);
        assert!(deduper.check_and_mark("other").is_none());
    }

    #[test]
    fn test_window_zero_disables() {
        let deduper = RequestDeduper::new(0, 100);
        assert!(!deduper.enabled());
        assert!(deduper.check_and_mark("k").is_none());
        assert!(deduper.check_and_mark("k").is_none());
    }

    #[test]
    fn test_capacity_cap_resets_map() {
        let deduper = RequestDeduper::new(60_000, 100);
        for i in 0..101 {
            deduper.check_and_mark(&format!("key-{}", i));
        }
        // The map was cleared, so an early key registers as fresh
        assert!(deduper.check_and_mark("key-0").is_none());
    }

    #[test]
    fn test_client_id_priority() {
        let mut headers = HeaderMap::new();
        headers.insert("x-end-user-id", HeaderValue::from_static("alice"));
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-x"));
        assert_eq!(client_id(&headers, "1.2.3.4"), "u:alice");

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-x"));
        assert!(client_id(&headers, "1.2.3.4").starts_with("k:"));

        assert_eq!(client_id(&HeaderMap::new(), "1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn test_bypass_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-dedupe-bypass", HeaderValue::from_static("1"));
        assert!(bypass_requested(&headers));
        assert!(!bypass_requested(&HeaderMap::new()));
    }
}
