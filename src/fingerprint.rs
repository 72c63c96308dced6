//! Request fingerprinting (spec.md §4.D, §6): wire-stable across
//! instances, used for both cache keys and scheduler dedup.

use std::hash::{Hash, Hasher};

use ahash::AHasher;
use http::HeaderMap;

use crate::logger::default_redacted_headers;
use crate::request::{Body, QueryParams};

/// Opaque, content-addressed key for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// `fingerprint(request) = hash(method || path || canonicalJson(sorted(queryParams))
/// || canonicalJson(sorted(headers)))` unless a `keyOverride` is set
/// (spec.md §4.D, §6).
///
/// Method is uppercased; path is used exactly as given; query params are
/// stably sorted by key with duplicates preserved in insertion order;
/// headers are lowercased, sorted, and filtered through `deny_list`
/// (defaulting to `Authorization`/`Date`-style headers) so auth rotation
/// never causes a cache miss (spec.md §6).
pub fn fingerprint(
    method: &http::Method,
    path: &str,
    query_params: &QueryParams,
    headers: &HeaderMap,
    body: &Body,
    key_override: Option<&str>,
    deny_list: Option<&[String]>,
) -> Fingerprint {
    if let Some(key) = key_override {
        let mut hasher = AHasher::default();
        key.hash(&mut hasher);
        return Fingerprint(hasher.finish());
    }

    let owned_deny;
    let deny_list = match deny_list {
        Some(list) => list,
        None => {
            owned_deny = default_redacted_headers();
            &owned_deny
        }
    };

    let mut hasher = AHasher::default();
    method.as_str().to_uppercase().hash(&mut hasher);
    path.hash(&mut hasher);

    for (key, value) in query_params.sorted() {
        key.hash(&mut hasher);
        value.hash(&mut hasher);
    }

    let mut header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            if deny_list.iter().any(|denied| denied.to_lowercase() == name) {
                return None;
            }
            value.to_str().ok().map(|v| (name, v.to_string()))
        })
        .collect();
    header_pairs.sort();
    for (key, value) in header_pairs {
        key.hash(&mut hasher);
        value.hash(&mut hasher);
    }

    if let Body::Bytes(bytes) = body {
        bytes.hash(&mut hasher);
    }

    Fingerprint(hasher.finish())
}
