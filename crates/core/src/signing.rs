//! Worker请求签名
//!
//! `signature = HMAC-SHA256(secret, "{timestamp}.{nonce}.{canonical_json(payload)}")`，
//! 十六进制小写编码。

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{SchedulerError, SchedulerResult};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_WORKER_ID: &str = "x-worker-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_NONCE: &str = "x-nonce";
pub const HEADER_SIGNATURE: &str = "x-signature";
pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_CERT_SUBJECT: &str = "x-client-cert-subject";

/// 规范化JSON：对象键递归排序，不含多余空白
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // 字符串转义交给serde_json
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn signing_input(timestamp: i64, nonce: &str, payload: &serde_json::Value) -> String {
    format!("{timestamp}.{nonce}.{}", canonical_json(payload))
}

pub fn sign(secret: &str, timestamp: i64, nonce: &str, payload: &serde_json::Value) -> SchedulerResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SchedulerError::Internal(format!("HMAC密钥无效: {e}")))?;
    mac.update(signing_input(timestamp, nonce, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// 常量时间比较签名
pub fn verify(
    secret: &str,
    timestamp: i64,
    nonce: &str,
    payload: &serde_json::Value,
    signature: &str,
) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signing_input(timestamp, nonce, payload).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// 常量时间比较共享密钥
///
/// 以期望值为HMAC密钥分别对两边求摘要，再用 `verify_slice` 比较定长摘要，
/// 长度不同的输入也走同样的路径。
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let digest = |value: &str| {
        HmacSha256::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    let (Ok(reference), Ok(candidate)) = (digest(expected), digest(presented)) else {
        return false;
    };
    candidate.verify_slice(&reference.finalize().into_bytes()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": 1, "x": 2}], "c": "s"}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":"s","z":[3,{"x":2,"y":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_signature_is_independent_of_key_order() {
        let a = json!({"worker_id": "w1", "count": 5});
        let b = json!({"count": 5, "worker_id": "w1"});
        let sig = sign("secret", 1_700_000_000, "n1", &a).unwrap();
        assert!(verify("secret", 1_700_000_000, "n1", &b, &sig));
    }

    #[test]
    fn test_tampered_inputs_fail_verification() {
        let payload = json!({"count": 5});
        let sig = sign("secret", 100, "n1", &payload).unwrap();
        assert!(!verify("other", 100, "n1", &payload, &sig));
        assert!(!verify("secret", 101, "n1", &payload, &sig));
        assert!(!verify("secret", 100, "n2", &payload, &sig));
        assert!(!verify("secret", 100, "n1", &json!({"count": 6}), &sig));
        assert!(!verify("secret", 100, "n1", &payload, "not-hex"));
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("key-1", "key-1"));
        assert!(!secrets_match("key-1", "key-2"));
        assert!(!secrets_match("key-1", "key-10"));
        assert!(!secrets_match("key-1", ""));
    }
}
