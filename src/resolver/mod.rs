//! Fetches secret documents and prepares reference replacements.
//!
//! Queries are deduplicated by their shortened identity so each distinct
//! path is fetched exactly once per call, however many sub-keys reference
//! it. Failures are isolated per path: one unreachable secret never aborts
//! its siblings, it just lands in the error map.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::client::{VaultClient, VaultDocument, VaultError};
use crate::query::{SecretQuery, ShortenedQuery};
use crate::retry::{vault_retrier, RetryPolicy};

const DATA_KEY: &str = "data";
const METADATA_KEY: &str = "metadata";
const KV2_METADATA_KEYS: [&str; 4] = ["created_time", "deletion_time", "destroyed", "version"];
const DEFAULT_VALUE_KEY: &str = "value";

/// Outcome of one deduplicated store call.
#[derive(Debug)]
enum SecretResponse {
    Success(VaultDocument),
    Failure(String),
}

/// Result of resolving a batch of queries. Every query lands in exactly
/// one of the two maps, keyed by its full reference form.
#[derive(Debug, Clone, Default)]
pub struct ResolvingResult {
    pub replacements: HashMap<String, String>,
    pub errors: HashMap<String, String>,
}

/// The resolution engine. Stateless per call; holds only the retry policy
/// applied to store calls.
pub struct SecretsResolver {
    policy: RetryPolicy,
}

impl SecretsResolver {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Fetch every distinct path once and map each query to its extracted
    /// value or a display-ready error string.
    pub fn resolve(&self, client: &VaultClient, queries: &[SecretQuery]) -> ResolvingResult {
        let responses = self.fetch(client, queries);

        let mut result = ResolvingResult::default();
        for query in queries {
            let full = query.full();
            match responses.get(&query.shortened()) {
                Some(SecretResponse::Success(document)) => match extract(document, query) {
                    Ok(value) => {
                        result.replacements.insert(full, value);
                    }
                    Err(message) => {
                        result.errors.insert(full, message);
                    }
                },
                Some(SecretResponse::Failure(reason)) => {
                    result
                        .errors
                        .insert(full.clone(), format!("Failed to fetch data for path '{full}': {reason}"));
                }
                None => {
                    result
                        .errors
                        .insert(full.clone(), format!("Failed to fetch data for path '{full}'"));
                }
            }
        }
        info!(
            resolved = result.replacements.len(),
            failed = result.errors.len(),
            "secret resolution finished"
        );
        result
    }

    /// One store call per shortened query, through the retry policy.
    /// Errors are captured per query, not propagated.
    fn fetch(
        &self,
        client: &VaultClient,
        queries: &[SecretQuery],
    ) -> HashMap<ShortenedQuery, SecretResponse> {
        let mut responses = HashMap::new();
        for query in queries {
            let shortened = query.shortened();
            if responses.contains_key(&shortened) {
                continue;
            }
            let retrier = vault_retrier::<VaultDocument>(self.policy.clone());
            let outcome = retrier.execute(|| -> Result<VaultDocument, VaultError> {
                if shortened.write {
                    client.write(&shortened.path, &query.write_params())
                } else {
                    client.read(&shortened.path)
                }
            });
            let response = match outcome {
                Ok(document) => SecretResponse::Success(document),
                Err(err) => {
                    warn!(path = %shortened.path, error = %err, "failed to fetch data");
                    SecretResponse::Failure(err.to_string())
                }
            };
            responses.insert(shortened, response);
        }
        responses
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Pull the scalar value a query names out of a fetched document. Errors
/// are display-ready strings naming the offending path or expression.
fn extract(document: &VaultDocument, query: &SecretQuery) -> Result<String, String> {
    let data = unwrap_kv2_if_needed(&document.data);
    let path = &query.path;

    let Some(sub_key) = &query.sub_key else {
        if data.is_empty() {
            return Err(format!(
                "There's no data in HashiCorp Vault response for '{path}'"
            ));
        }
        let key = if data.len() == 1 {
            data.keys()
                .next()
                .map(String::as_str)
                .unwrap_or(DEFAULT_VALUE_KEY)
        } else {
            DEFAULT_VALUE_KEY
        };
        return match data.get(key) {
            None => Err(format!(
                "'{key}' is missing in HashiCorp Vault response for '{path}'"
            )),
            Some(Value::String(value)) => Ok(value.clone()),
            Some(other) => Err(format!(
                "Cannot extract data from non-string '{key}'. Actual type is {} for '{path}'",
                json_type_name(other)
            )),
        };
    };

    let expression = if sub_key.starts_with("$.") {
        sub_key.clone()
    } else {
        format!("$.{sub_key}")
    };
    let compiled = serde_json_path::JsonPath::parse(&expression).map_err(|_| {
        warn!(expression = %expression, "JsonPath compilation failed");
        format!("JsonPath compilation failed for '{expression}' for '{path}'")
    })?;

    let document = Value::Object(data.clone());
    let nodes = compiled.query(&document).all();
    match nodes.first().copied() {
        None => Err(format!("'{sub_key}' found nothing for '{path}'")),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(other) => Err(format!(
            "Cannot extract data from non-string '{sub_key}'. Actual type is {} for '{path}'",
            json_type_name(other)
        )),
    }
}

/// Versioned (KV2) secrets wrap the payload in a `data`/`metadata` pair.
/// Detection is a heuristic on the response shape: both keys present as
/// objects, and the metadata carrying the four version-history fields.
fn unwrap_kv2_if_needed(data: &Map<String, Value>) -> &Map<String, Value> {
    if let (Some(Value::Object(inner)), Some(Value::Object(metadata))) =
        (data.get(DATA_KEY), data.get(METADATA_KEY))
    {
        if KV2_METADATA_KEYS.iter().all(|key| metadata.contains_key(*key)) {
            return inner;
        }
    }
    data
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
