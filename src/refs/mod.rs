//! Locating secret references inside job parameter values.
//!
//! The host's generic reference syntax wraps a token in percent signs
//! (`%name%`, with `%%` escaping a literal percent). A token is a secret
//! reference when its body starts with the `vault:` prefix, optionally
//! qualified with a connection namespace (`vault:staging:/path`). This
//! module finds such references, maps them to store paths, and substitutes
//! resolved values back into the parameter set.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::settings::{is_default, REFERENCE_PREFIX};

/// Parameter keys forwarded from upstream jobs; never resolved here.
const DEPENDENCY_KEY_PREFIX: &str = "dep.";

/// Cheap pre-filter: a value without a percent sign cannot hold a
/// reference, so the extraction walk is skipped entirely.
pub fn may_contain_reference(value: &str) -> bool {
    value.contains('%')
}

// ============================================================================
// Reference walk
// ============================================================================

/// One piece of a parameter value: literal text, or a reference token
/// (stored without its surrounding percent signs).
#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Reference(&'a str),
}

/// Split a value into literal and reference segments. Unterminated
/// references and escaped `%%` pairs are kept as literal text.
fn segments(value: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('%') {
        if start > 0 {
            out.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + 1..];
        if let Some(tail) = after.strip_prefix('%') {
            out.push(Segment::Literal("%"));
            rest = tail;
            continue;
        }
        match after.find('%') {
            Some(end) => {
                out.push(Segment::Reference(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                out.push(Segment::Literal(&rest[start..]));
                rest = "";
            }
        }
    }
    if !rest.is_empty() {
        out.push(Segment::Literal(rest));
    }
    out
}

fn prefix_for(namespace: &str) -> String {
    if is_default(namespace) {
        REFERENCE_PREFIX.to_string()
    } else {
        format!("{REFERENCE_PREFIX}{namespace}:")
    }
}

/// Secret references found in a single value, restricted to the requested
/// connection namespaces.
fn references_in_value(value: &str, namespaces: &[String]) -> Vec<String> {
    let prefixes: Vec<String> = namespaces.iter().map(|ns| prefix_for(ns)).collect();
    if !prefixes.iter().any(|prefix| value.contains(prefix.as_str())) {
        return Vec::new();
    }
    segments(value)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Reference(token)
                if prefixes.iter().any(|prefix| token.starts_with(prefix.as_str()))
                    // The default prefix also matches qualified references;
                    // keep only tokens whose namespace was requested.
                    && namespaces.iter().any(|ns| ns == &namespace_of(token)) =>
            {
                Some(token.to_string())
            }
            _ => None,
        })
        .collect()
}

// ============================================================================
// Scanning a parameter set
// ============================================================================

/// True when any parameter value holds at least one secret reference for
/// one of the given namespaces.
pub fn has_references(parameters: &HashMap<String, String>, namespaces: &[String]) -> bool {
    parameters.values().any(|value| {
        may_contain_reference(value) && !references_in_value(value, namespaces).is_empty()
    })
}

/// Collect every secret reference in the parameter set, along with the
/// keys of the parameters that own them. Dependency parameters (`dep.*`)
/// are skipped.
pub fn collect(
    parameters: &HashMap<String, String>,
    namespaces: &[String],
) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut references = BTreeSet::new();
    let mut keys = BTreeSet::new();
    for (key, value) in parameters {
        if key.starts_with(DEPENDENCY_KEY_PREFIX) {
            continue;
        }
        if !may_contain_reference(value) {
            continue;
        }
        let found = references_in_value(value, namespaces);
        if !found.is_empty() {
            keys.insert(key.clone());
            references.extend(found);
        }
    }
    debug!(
        count = references.len(),
        "collected secret references from parameter set"
    );
    (references, keys)
}

// ============================================================================
// Reference anatomy
// ============================================================================

/// Connection namespace of a reference, `""` for the default connection.
/// A qualifier is only a namespace when its colon precedes any slash.
pub fn namespace_of(reference: &str) -> String {
    let body = reference
        .strip_prefix(REFERENCE_PREFIX)
        .unwrap_or(reference);
    let colon = body.find(':');
    let slash = body.find('/');
    match (colon, slash) {
        (Some(c), Some(s)) if s < c => String::new(),
        (Some(c), _) => body[..c].to_string(),
        _ => String::new(),
    }
}

/// Store path named by a reference, with the prefix (and namespace
/// qualifier) removed and a leading slash ensured.
pub fn path_of(reference: &str, namespace: &str) -> String {
    let path = reference
        .strip_prefix(&prefix_for(namespace))
        .unwrap_or(reference);
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Build the full reference text for a query, e.g.
/// `%vault:staging:/secret/app!/key%`.
pub fn make_reference(namespace: &str, query: &str) -> String {
    format!("%{}{}%", prefix_for(namespace), query)
}

// ============================================================================
// Replacement
// ============================================================================

/// Substitute resolved values into a parameter set.
///
/// `replacements` is keyed by the textual path form of each reference, as
/// produced by [`path_of`]. Values whose references all resolved are
/// rewritten; unresolved references stay in place as literal text so the
/// caller can decide how to handle them.
pub fn apply_replacements(
    parameters: &HashMap<String, String>,
    replacements: &HashMap<String, String>,
    namespace: &str,
) -> HashMap<String, String> {
    let namespaces = [namespace.to_string()];
    parameters
        .iter()
        .map(|(key, value)| {
            if key.starts_with(DEPENDENCY_KEY_PREFIX) || !may_contain_reference(value) {
                return (key.clone(), value.clone());
            }
            let mut rewritten = String::with_capacity(value.len());
            for segment in segments(value) {
                match segment {
                    Segment::Literal(text) => rewritten.push_str(text),
                    Segment::Reference(token) => {
                        let resolved = references_in_value(
                            &format!("%{token}%"),
                            &namespaces,
                        )
                        .first()
                        .and_then(|reference| {
                            replacements.get(&path_of(reference, namespace))
                        });
                        match resolved {
                            Some(value) => rewritten.push_str(value),
                            // Not ours, or unresolved: keep the token as-is.
                            None => {
                                rewritten.push('%');
                                rewritten.push_str(token);
                                rewritten.push('%');
                            }
                        }
                    }
                }
            }
            (key.clone(), rewritten)
        })
        .collect()
}
