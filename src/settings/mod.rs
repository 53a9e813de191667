//! Connection settings for a Vault-backed secret source.
//!
//! A connection is described by a flat string property map owned by the
//! host (the same map the host persists and ships to job agents), decoded
//! here into an immutable [`ConnectionSettings`] value.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Property keys used by the host-side settings map.
pub mod keys {
    pub const NAMESPACE: &str = "namespace";
    pub const URL: &str = "url";
    pub const VAULT_NAMESPACE: &str = "vault-namespace";
    pub const AUTH_METHOD: &str = "auth-method";
    pub const ENDPOINT: &str = "endpoint";
    pub const ROLE_ID: &str = "role-id";
    pub const SECRET_ID: &str = "secure:secret-id";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "secure:password";
    pub const LDAP_PATH: &str = "path";
    pub const FAIL_ON_ERROR: &str = "fail-on-error";
    pub const VERIFY_SSL: &str = "verify-ssl";
    pub const ENABLED: &str = "enabled";
}

/// Prefix of secret references embedded in parameter values.
pub const REFERENCE_PREFIX: &str = "vault:";

/// Root of the host parameter names this integration publishes.
pub const PARAMETER_PREFIX: &str = "vault";

/// Behaviour-parameter suffix: expose `VAULT_ADDR`/`VAULT_TOKEN` to the job.
pub const SET_ENV_SUFFIX: &str = ".set.env";

/// Default AppRole mount when the settings map carries none.
pub const DEFAULT_AUTH_ENDPOINT: &str = "approle";

/// Environment variables exposed to jobs that opt in.
pub const VAULT_ADDR_VAR: &str = "VAULT_ADDR";
pub const VAULT_TOKEN_VAR: &str = "VAULT_TOKEN";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("unsupported auth method '{0}'")]
    UnsupportedAuthMethod(String),
}

// ============================================================================
// Auth strategies
// ============================================================================

/// How a token is obtained from the store. The two strategies differ only
/// in the login path and body; everything downstream treats them as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    AppRole {
        /// Auth mount, stored without leading slashes.
        endpoint: String,
        role_id: String,
        secret_id: String,
    },
    Ldap {
        username: String,
        password: String,
        path: String,
    },
}

impl Auth {
    pub fn method(&self) -> &'static str {
        match self {
            Auth::AppRole { .. } => "approle",
            Auth::Ldap { .. } => "ldap",
        }
    }

    /// Login request path relative to the API root.
    pub fn login_path(&self) -> String {
        match self {
            Auth::AppRole { endpoint, .. } => format!("auth/{endpoint}/login"),
            Auth::Ldap { username, path, .. } => format!("auth/{path}/login/{username}"),
        }
    }

    /// JSON body of the login request. An empty AppRole secret id is
    /// omitted entirely rather than sent blank.
    pub fn login_body(&self) -> HashMap<String, String> {
        let mut body = HashMap::new();
        match self {
            Auth::AppRole {
                role_id, secret_id, ..
            } => {
                body.insert("role_id".to_string(), role_id.clone());
                if !secret_id.is_empty() {
                    body.insert("secret_id".to_string(), secret_id.clone());
                }
            }
            Auth::Ldap { password, .. } => {
                body.insert("password".to_string(), password.clone());
            }
        }
        body
    }

    /// The credential that must never appear in surfaced error text.
    pub fn sensitive_value(&self) -> &str {
        match self {
            Auth::AppRole { secret_id, .. } => secret_id,
            Auth::Ldap { password, .. } => password,
        }
    }

    fn from_properties(map: &HashMap<String, String>) -> Result<Self, SettingsError> {
        let method = map
            .get(keys::AUTH_METHOD)
            .map(String::as_str)
            .unwrap_or("approle");
        match method {
            "approle" => Ok(Auth::AppRole {
                endpoint: map
                    .get(keys::ENDPOINT)
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_AUTH_ENDPOINT)
                    .trim_start_matches('/')
                    .to_string(),
                role_id: map.get(keys::ROLE_ID).cloned().unwrap_or_default(),
                secret_id: map.get(keys::SECRET_ID).cloned().unwrap_or_default(),
            }),
            "ldap" => Ok(Auth::Ldap {
                username: map.get(keys::USERNAME).cloned().unwrap_or_default(),
                password: map.get(keys::PASSWORD).cloned().unwrap_or_default(),
                path: map
                    .get(keys::LDAP_PATH)
                    .cloned()
                    .unwrap_or_else(|| "ldap".to_string()),
            }),
            other => Err(SettingsError::UnsupportedAuthMethod(other.to_string())),
        }
    }

    fn to_properties(&self, map: &mut HashMap<String, String>) {
        map.insert(keys::AUTH_METHOD.to_string(), self.method().to_string());
        match self {
            Auth::AppRole {
                endpoint,
                role_id,
                secret_id,
            } => {
                map.insert(keys::ENDPOINT.to_string(), endpoint.clone());
                map.insert(keys::ROLE_ID.to_string(), role_id.clone());
                map.insert(keys::SECRET_ID.to_string(), secret_id.clone());
            }
            Auth::Ldap {
                username,
                password,
                path,
            } => {
                map.insert(keys::USERNAME.to_string(), username.clone());
                map.insert(keys::PASSWORD.to_string(), password.clone());
                map.insert(keys::LDAP_PATH.to_string(), path.clone());
            }
        }
    }
}

// ============================================================================
// Connection settings
// ============================================================================

/// Immutable description of one Vault connection. Owned by the caller and
/// passed by reference into every component of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Connection id within the host ("" is the default connection).
    pub namespace: String,
    /// Store endpoint URL.
    pub url: String,
    /// Vault enterprise namespace, sent as `X-Vault-Namespace` when set.
    pub vault_namespace: String,
    /// Verify TLS certificates when talking to the store.
    pub verify_ssl: bool,
    /// Terminate the job when resolution fails, instead of logging only.
    pub fail_on_error: bool,
    /// Connections can be kept configured but switched off.
    pub enabled: bool,
    pub auth: Auth,
}

impl ConnectionSettings {
    pub fn from_properties(map: &HashMap<String, String>) -> Result<Self, SettingsError> {
        Ok(Self {
            namespace: map.get(keys::NAMESPACE).cloned().unwrap_or_default(),
            url: map.get(keys::URL).cloned().unwrap_or_default(),
            vault_namespace: map.get(keys::VAULT_NAMESPACE).cloned().unwrap_or_default(),
            verify_ssl: map
                .get(keys::VERIFY_SSL)
                .map(|v| v == "true")
                .unwrap_or(true),
            fail_on_error: map
                .get(keys::FAIL_ON_ERROR)
                .map(|v| v == "true")
                .unwrap_or(false),
            enabled: map.get(keys::ENABLED).map(|v| v != "false").unwrap_or(true),
            auth: Auth::from_properties(map)?,
        })
    }

    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(keys::NAMESPACE.to_string(), self.namespace.clone());
        map.insert(keys::URL.to_string(), self.url.clone());
        map.insert(
            keys::VAULT_NAMESPACE.to_string(),
            self.vault_namespace.clone(),
        );
        map.insert(keys::VERIFY_SSL.to_string(), self.verify_ssl.to_string());
        map.insert(
            keys::FAIL_ON_ERROR.to_string(),
            self.fail_on_error.to_string(),
        );
        map.insert(keys::ENABLED.to_string(), self.enabled.to_string());
        self.auth.to_properties(&mut map);
        map
    }
}

// ============================================================================
// Namespace helpers
// ============================================================================

/// True for the default (unnamed) connection.
pub fn is_default(namespace: &str) -> bool {
    namespace.is_empty()
}

static ENV_SANITIZER: Lazy<Regex> = Lazy::new(|| Regex::new("[^a-zA-Z0-9_]").unwrap());

/// Environment-variable prefix for a connection namespace:
/// `""` for the default connection, `"MY_NS_"` for `my-ns`.
pub fn env_prefix(namespace: &str) -> String {
    if is_default(namespace) {
        String::new()
    } else {
        format!(
            "{}_",
            ENV_SANITIZER.replace_all(namespace, "_").to_uppercase()
        )
    }
}

/// Host parameter name for a namespace-scoped suffix, e.g.
/// `vault.set.env` or `vault.staging.set.env`.
pub fn parameter_name(namespace: &str, suffix: &str) -> String {
    if is_default(namespace) {
        format!("{PARAMETER_PREFIX}{suffix}")
    } else {
        format!("{PARAMETER_PREFIX}.{namespace}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approle_map() -> HashMap<String, String> {
        [
            (keys::URL, "https://vault.example.com:8200"),
            (keys::NAMESPACE, "staging"),
            (keys::AUTH_METHOD, "approle"),
            (keys::ENDPOINT, "/approle"),
            (keys::ROLE_ID, "role"),
            (keys::SECRET_ID, "secret"),
            (keys::FAIL_ON_ERROR, "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn approle_roundtrip() {
        let settings = ConnectionSettings::from_properties(&approle_map()).unwrap();
        assert_eq!(settings.namespace, "staging");
        assert!(settings.fail_on_error);
        assert!(settings.verify_ssl);
        assert!(settings.enabled);
        // Leading slash on the endpoint is stripped.
        assert_eq!(
            settings.auth,
            Auth::AppRole {
                endpoint: "approle".into(),
                role_id: "role".into(),
                secret_id: "secret".into(),
            }
        );

        let reparsed = ConnectionSettings::from_properties(&settings.to_properties()).unwrap();
        assert_eq!(reparsed, settings);
    }

    #[test]
    fn ldap_login_path_includes_username() {
        let auth = Auth::Ldap {
            username: "deploy".into(),
            password: "pw".into(),
            path: "ldap".into(),
        };
        assert_eq!(auth.login_path(), "auth/ldap/login/deploy");
        assert_eq!(auth.login_body().get("password").unwrap(), "pw");
    }

    #[test]
    fn empty_approle_secret_id_omitted_from_body() {
        let auth = Auth::AppRole {
            endpoint: "approle".into(),
            role_id: "role".into(),
            secret_id: String::new(),
        };
        let body = auth.login_body();
        assert_eq!(body.get("role_id").unwrap(), "role");
        assert!(!body.contains_key("secret_id"));
    }

    #[test]
    fn unknown_auth_method_rejected() {
        let mut map = approle_map();
        map.insert(keys::AUTH_METHOD.to_string(), "kerberos".to_string());
        assert!(ConnectionSettings::from_properties(&map).is_err());
    }

    #[test]
    fn env_prefix_sanitizes_namespace() {
        assert_eq!(env_prefix(""), "");
        assert_eq!(env_prefix("staging"), "STAGING_");
        assert_eq!(env_prefix("my-ns.1"), "MY_NS_1_");
    }

    #[test]
    fn parameter_names() {
        assert_eq!(parameter_name("", SET_ENV_SUFFIX), "vault.set.env");
        assert_eq!(
            parameter_name("staging", SET_ENV_SUFFIX),
            "vault.staging.set.env"
        );
    }
}
