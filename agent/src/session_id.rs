use std::collections::BTreeMap;
use std::fmt;

use blake2::{Blake2s256, Digest};
use http::Uri;
use serde_json::Value;

use crate::agent::SessionOptions;

/// Stable key for a group of equivalent sessions.
///
/// Derived from the authority origin and a fingerprint of the normalized
/// connection options. Option structs with equal values always map to the same
/// identity; an explicit `id` is appended as an extra discriminator segment so
/// otherwise identical option sets can be forced into different groups.
///
/// The fingerprint is deterministic across processes, so it is safe to log or
/// persist even though it is only used as an in-memory map key here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    origin: String,
    pathname: String,
}

impl SessionId {
    pub fn new(authority: &Uri, options: &SessionOptions) -> Self {
        let scheme = authority.scheme_str().unwrap_or("https");
        let host = authority.host().unwrap_or_default();
        let origin = match authority.port_u16() {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        };
        let mut pathname = format!("/{}", fingerprint(options));
        if let Some(id) = &options.id {
            pathname.push('/');
            pathname.push_str(id);
        }
        SessionId { origin, pathname }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.origin, self.pathname)
    }
}

/// Hex digest of the deterministic serialization of the options, with the
/// `id` discriminator excluded (it is appended to the pathname instead).
fn fingerprint(options: &SessionOptions) -> String {
    let mut value = serde_json::to_value(options).expect("session options are serializable");
    if let Value::Object(map) = &mut value {
        map.remove("id");
    }
    let serialized =
        serde_json::to_string(&normalized(&value)).expect("normalized options are serializable");
    hex(&Blake2s256::digest(serialized.as_bytes()))
}

/// Recursively sorts object keys and drops null values, so that semantically
/// equal option sets serialize identically.
fn normalized(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, normalized(v)))
                .collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(normalized).collect()),
        other => other.clone(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
