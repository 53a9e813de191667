//! Minimal blocking HTTP client for the Vault API surface this crate uses:
//! secret read/write, login (optionally response-wrapped), and token
//! revocation. Everything else the store offers is out of scope.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::settings::{Auth, ConnectionSettings};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";
const VAULT_NAMESPACE_HEADER: &str = "X-Vault-Namespace";
const VAULT_WRAP_TTL_HEADER: &str = "X-Vault-Wrap-TTL";

const REVOKE_ACCESSOR_PATH: &str = "auth/token/revoke-accessor";
const REVOKE_SELF_PATH: &str = "auth/token/revoke-self";

/// Placeholder substituted for credentials in surfaced error text.
const MASKED: &str = "*******";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum VaultError {
    /// Non-2xx response; `message` carries the store's reported error
    /// detail when the body was a standard `{"errors": […]}` document.
    #[error("Vault returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request to Vault failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Login failure rewritten into an operator-readable message; the
    /// message text already names the auth method.
    #[error("{message}")]
    Login {
        method: &'static str,
        message: String,
    },

    /// The store answered but the expected field was absent.
    #[error("Vault hasn't returned '{0}'")]
    MissingField(&'static str),

    #[error("invalid Vault endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

// ============================================================================
// Wire documents
// ============================================================================

/// A Vault API response body. Secret reads and writes populate `data`;
/// login calls populate `auth` or, when response wrapping was requested,
/// `wrap_info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultDocument {
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub wrap_info: Option<WrapInfo>,
    #[serde(default)]
    pub auth: Option<AuthInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WrapInfo {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub wrapped_accessor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthInfo {
    #[serde(default)]
    pub client_token: Option<String>,
    #[serde(default)]
    pub accessor: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

// ============================================================================
// Client
// ============================================================================

/// One client per connection. Cheap to build; holds no token state beyond
/// what the caller gives it.
pub struct VaultClient {
    http: Client,
    base: String,
    vault_namespace: String,
    token: Option<String>,
}

impl VaultClient {
    pub fn new(settings: &ConnectionSettings) -> Result<Self, VaultError> {
        let url = Url::parse(&settings.url).map_err(|err| VaultError::InvalidUrl {
            url: settings.url.clone(),
            reason: err.to_string(),
        })?;
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .build()?;
        Ok(Self {
            http,
            base: url.as_str().trim_end_matches('/').to_string(),
            vault_namespace: settings.vault_namespace.clone(),
            token: None,
        })
    }

    /// Build a client that authenticates with the given bearer token.
    pub fn with_token(
        settings: &ConnectionSettings,
        token: impl Into<String>,
    ) -> Result<Self, VaultError> {
        let mut client = Self::new(settings)?;
        client.token = Some(token.into());
        Ok(client)
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base, path.trim_start_matches('/'))
    }

    fn prepare(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder;
        if let Some(token) = &self.token {
            builder = builder.header(VAULT_TOKEN_HEADER, token);
        }
        if !self.vault_namespace.is_empty() {
            builder = builder.header(VAULT_NAMESPACE_HEADER, &self.vault_namespace);
        }
        builder
    }

    /// Check the status and decode the body, turning non-2xx responses
    /// into [`VaultError::Status`] with the store's error detail.
    fn decode(response: Response) -> Result<VaultDocument, VaultError> {
        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(VaultDocument::default());
            }
            return Ok(response.json()?);
        }
        Err(Self::status_error(status, response))
    }

    fn status_error(status: StatusCode, response: Response) -> VaultError {
        let body = response.text().unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .filter(|parsed| !parsed.errors.is_empty())
            .map(|parsed| parsed.errors.join("; "))
            .unwrap_or(body);
        VaultError::Status {
            status: status.as_u16(),
            message,
        }
    }

    // ------------------------------------------------------------------
    // Secret access
    // ------------------------------------------------------------------

    /// Read a secret document.
    pub fn read(&self, path: &str) -> Result<VaultDocument, VaultError> {
        let response = self.prepare(self.http.get(self.endpoint(path))).send()?;
        Self::decode(response)
    }

    /// Write to a path and return the response document. Dynamic-secret
    /// engines answer writes with generated data.
    pub fn write(
        &self,
        path: &str,
        body: &HashMap<String, String>,
    ) -> Result<VaultDocument, VaultError> {
        let response = self
            .prepare(self.http.post(self.endpoint(path)).json(body))
            .send()?;
        Self::decode(response)
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    /// Perform the role/credential exchange for the given auth strategy.
    /// With `wrap_ttl` set, the store wraps the issued token and the
    /// response carries `wrap_info` instead of `auth`.
    pub fn login(&self, auth: &Auth, wrap_ttl: Option<&str>) -> Result<VaultDocument, VaultError> {
        let mut builder = self
            .prepare(self.http.post(self.endpoint(&auth.login_path())))
            .json(&auth.login_body());
        if let Some(ttl) = wrap_ttl {
            builder = builder.header(VAULT_WRAP_TTL_HEADER, ttl);
        }
        let response = builder.send()?;
        Self::decode(response).map_err(|err| Self::readable_login_error(err, auth))
    }

    /// Rewrite login client errors into operator-readable messages, with
    /// the credential value masked out of any surfaced text.
    fn readable_login_error(error: VaultError, auth: &Auth) -> VaultError {
        let VaultError::Status { status, message } = &error else {
            return error;
        };
        if !(400..500).contains(status) {
            return error;
        }
        let prefix = format!("Cannot log in to HashiCorp Vault using {} method", auth.method());
        let detail = ["failed to validate credentials: ", "failed to validate SecretID: "]
            .iter()
            .find_map(|marker| message.strip_prefix(marker))
            .and_then(|suberror| {
                if suberror.contains("invalid secret_id") {
                    Some(format!("{prefix}, SecretID is incorrect or expired"))
                } else if suberror.contains("failed to find secondary index for role_id") {
                    Some(format!("{prefix}, RoleID is incorrect or there's no such role"))
                } else {
                    None
                }
            })
            .unwrap_or_else(|| format!("{prefix}: {message}"));
        let masked = match auth.sensitive_value() {
            "" => detail,
            secret => detail.replace(secret, MASKED),
        };
        VaultError::Login {
            method: auth.method(),
            message: masked,
        }
    }

    // ------------------------------------------------------------------
    // Revocation
    // ------------------------------------------------------------------

    /// Revoke a token through its accessor. Returns `Ok(true)` when the
    /// token is gone or retrying later cannot help: 403 means this login
    /// role lacks `update` access to the revocation endpoint, 400 means
    /// the accessor is already invalid (token expired or revoked).
    pub fn revoke_accessor(&self, accessor: &str) -> Result<bool, VaultError> {
        let mut body = HashMap::new();
        body.insert("accessor".to_string(), accessor.to_string());
        let response = self
            .prepare(self.http.post(self.endpoint(REVOKE_ACCESSOR_PATH)).json(&body))
            .send()?;
        let status = response.status();
        match status {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(true),
            StatusCode::FORBIDDEN => {
                warn!(
                    accessor,
                    "failed to revoke token via accessor: access denied, grant the login role 'update' access to '{REVOKE_ACCESSOR_PATH}'"
                );
                Ok(true)
            }
            StatusCode::BAD_REQUEST => {
                info!(
                    accessor,
                    "token accessor already invalid, most probably the token was revoked or expired"
                );
                Ok(true)
            }
            other => Err(Self::status_error(other, response)),
        }
    }

    /// Revoke the client's own token, best effort with a short fixed
    /// backoff ladder. Returns whether revocation succeeded.
    pub fn revoke_self(&self) -> bool {
        let backoffs = [1u64, 3, 6];
        let mut last_error = None;
        for (index, backoff) in backoffs.iter().enumerate() {
            let outcome = self
                .prepare(self.http.post(self.endpoint(REVOKE_SELF_PATH)))
                .send()
                .map_err(VaultError::from)
                .and_then(Self::decode);
            match outcome {
                Ok(_) => return true,
                Err(err) => {
                    last_error = Some(err);
                    if index + 1 < backoffs.len() {
                        std::thread::sleep(Duration::from_secs(*backoff));
                    }
                }
            }
        }
        if let Some(err) = last_error {
            warn!(error = %err, "cannot revoke Vault token");
        }
        false
    }
}
