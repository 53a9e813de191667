//! Parsing of raw secret reference strings into structured queries.
//!
//! A query names a store path, an optional sub-key applied to the fetched
//! document (`path!/sub.key`), and, for write-engine queries, an optional
//! parameter string (`write:path?param=value`). Parsing is deliberately
//! lenient: malformed input degrades to a best-effort query whose fetch or
//! extraction will fail with a descriptive error instead of failing here.

use std::collections::HashMap;

/// Sentinel marking a query that must be sent as a write call.
pub const WRITE_PREFIX: &str = "write:";

/// Delimiter between the store path and the sub-key expression.
pub const SUB_KEY_MARKER: &str = "!/";

/// Delimiter between the store path (or sub-key) and the write params.
pub const PARAMS_MARKER: char = '?';

/// A parsed secret query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretQuery {
    /// Store path, normalized to carry a leading slash.
    pub path: String,
    /// Optional sub-key expression evaluated against the fetched document.
    pub sub_key: Option<String>,
    /// True only when the write sentinel was present and write mode was
    /// enabled for the caller.
    pub write: bool,
    /// Raw write-parameter string as found in the reference.
    pub params: Option<String>,
}

/// The fetch identity of a query: many queries with different sub-keys
/// collapse onto one shortened query and share a single store call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShortenedQuery {
    pub path: String,
    pub params: Option<String>,
    pub write: bool,
}

impl SecretQuery {
    /// Parse a raw reference body. Never fails; see module docs.
    pub fn parse(raw: &str, write_enabled: bool) -> Self {
        let (write, rest) = match raw.strip_prefix(WRITE_PREFIX) {
            Some(rest) if write_enabled => (true, rest),
            _ => (false, raw),
        };

        let (path, sub_key, params) = match rest.split_once(SUB_KEY_MARKER) {
            Some((path, tail)) => match tail.split_once(PARAMS_MARKER) {
                // Params are only meaningful for write queries; otherwise
                // the '?' stays part of the sub-key expression.
                Some((sub, params)) if write => {
                    (path, Some(sub.to_string()), Some(params.to_string()))
                }
                _ => (path, Some(tail.to_string()), None),
            },
            None => match rest.split_once(PARAMS_MARKER) {
                Some((path, params)) if write => (path, None, Some(params.to_string())),
                _ => (rest, None, None),
            },
        };

        Self {
            path: ensure_leading_slash(path),
            sub_key,
            write,
            params,
        }
    }

    /// Full reference form: normalized `path[!/subKey][?params]`. This is
    /// the key under which results and errors are reported.
    pub fn full(&self) -> String {
        let mut full = self.path.clone();
        if let Some(sub) = &self.sub_key {
            full.push_str(SUB_KEY_MARKER);
            full.push_str(sub);
        }
        if let Some(params) = &self.params {
            full.push(PARAMS_MARKER);
            full.push_str(params);
        }
        full
    }

    /// Identity used for fetch deduplication: sub-keys are ignored.
    pub fn shortened(&self) -> ShortenedQuery {
        ShortenedQuery {
            path: self.path.clone(),
            params: self.params.clone(),
            write: self.write,
        }
    }

    /// Parse the raw params string into a `key=value` map. Pairs that do
    /// not split into exactly two parts are silently dropped.
    pub fn write_params(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        let Some(params) = &self.params else {
            return map;
        };
        for pair in params.split('&') {
            let parts: Vec<&str> = pair.split('=').collect();
            if parts.len() == 2 {
                map.insert(parts[0].to_string(), parts[1].to_string());
            }
        }
        map
    }
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_path() {
        let query = SecretQuery::parse("secret/data/app", false);
        assert_eq!(query.path, "/secret/data/app");
        assert_eq!(query.sub_key, None);
        assert!(!query.write);
        assert_eq!(query.full(), "/secret/data/app");
    }

    #[test]
    fn path_with_sub_key_roundtrips() {
        let query = SecretQuery::parse("secret/data/app!/username", false);
        assert_eq!(query.path, "/secret/data/app");
        assert_eq!(query.sub_key.as_deref(), Some("username"));
        assert_eq!(query.full(), "/secret/data/app!/username");
    }

    #[test]
    fn leading_slash_preserved() {
        let query = SecretQuery::parse("/secret/app!/key", false);
        assert_eq!(query.path, "/secret/app");
        assert_eq!(query.full(), "/secret/app!/key");
    }

    #[test]
    fn write_sentinel_honored_when_enabled() {
        let query = SecretQuery::parse("write:database/creds/ro", true);
        assert!(query.write);
        assert_eq!(query.path, "/database/creds/ro");
    }

    #[test]
    fn write_sentinel_literal_when_disabled() {
        let query = SecretQuery::parse("write:database/creds/ro", false);
        assert!(!query.write);
        assert_eq!(query.path, "/write:database/creds/ro");
    }

    #[test]
    fn write_query_with_sub_key_and_params() {
        let query = SecretQuery::parse("write:pki/issue/web!/certificate?ttl=5m&cn=web", true);
        assert!(query.write);
        assert_eq!(query.path, "/pki/issue/web");
        assert_eq!(query.sub_key.as_deref(), Some("certificate"));
        assert_eq!(query.params.as_deref(), Some("ttl=5m&cn=web"));
        assert_eq!(query.full(), "/pki/issue/web!/certificate?ttl=5m&cn=web");

        let params = query.write_params();
        assert_eq!(params.get("ttl").unwrap(), "5m");
        assert_eq!(params.get("cn").unwrap(), "web");
    }

    #[test]
    fn write_query_params_without_sub_key() {
        let query = SecretQuery::parse("write:database/creds/ro?ttl=1h", true);
        assert_eq!(query.path, "/database/creds/ro");
        assert_eq!(query.sub_key, None);
        assert_eq!(query.params.as_deref(), Some("ttl=1h"));
    }

    #[test]
    fn question_mark_stays_in_sub_key_for_read_queries() {
        let query = SecretQuery::parse("secret/app!/key?not=params", false);
        assert_eq!(query.sub_key.as_deref(), Some("key?not=params"));
        assert_eq!(query.params, None);
    }

    #[test]
    fn malformed_param_pairs_dropped() {
        let query = SecretQuery::parse("write:path?good=1&bad&worse=a=b", true);
        let params = query.write_params();
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("good").unwrap(), "1");
    }

    #[test]
    fn empty_input_degrades_without_panicking() {
        let query = SecretQuery::parse("", false);
        assert_eq!(query.path, "/");
        assert_eq!(query.sub_key, None);
    }

    #[test]
    fn shortened_identity_ignores_sub_key() {
        let first = SecretQuery::parse("secret/app!/first", false);
        let second = SecretQuery::parse("secret/app!/second", false);
        assert_eq!(first.shortened(), second.shortened());

        let written = SecretQuery::parse("write:secret/app!/first", true);
        assert_ne!(first.shortened(), written.shortened());
    }
}
