//! Fetches connection settings from the host server.
//!
//! Job agents do not hold store credentials themselves; they ask the host
//! server for the connection settings (and through them the wrapped token)
//! scoped to a job. Transient server hiccups are retried with a response
//! classifier over the HTTP status, since this endpoint reports failures
//! as status codes rather than transport errors.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use thiserror::Error;
use tracing::debug;

use crate::lease::JobId;
use crate::retry::{Retrier, RetryPolicy};
use crate::settings::{ConnectionSettings, SettingsError};

/// Host endpoint serving per-job connection settings.
const CONNECTION_SETTINGS_PATH: &str = "app/vault/connection/token";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("host returned HTTP {status} for connection settings of job {job_id}: {body}")]
    Status {
        status: u16,
        job_id: JobId,
        body: String,
    },

    #[error("request for connection settings failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("cannot decode connection settings for job {job_id}: {reason}")]
    Decode { job_id: JobId, reason: String },

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Client for the host's connection-settings endpoint, authenticated with
/// the per-job access credentials the scheduler issues to its agents.
pub struct SettingsFetcher {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    policy: RetryPolicy,
}

impl SettingsFetcher {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, FetchError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            policy,
        })
    }

    /// Fetch and decode the settings of one connection for a job.
    pub fn fetch(&self, job_id: JobId, namespace: &str) -> Result<ConnectionSettings, FetchError> {
        let url = format!("{}/{CONNECTION_SETTINGS_PATH}", self.base_url);
        debug!(job_id, namespace, "fetching connection settings from host");

        let retrier: Retrier<Response, reqwest::Error> = Retrier::new(self.policy.clone())
            .with_response_classifier(Box::new(|response: &Response| {
                response.status().is_server_error()
            }));
        let response = retrier.execute(|| {
            self.http
                .get(&url)
                .query(&[("buildId", job_id.to_string().as_str()), ("namespace", namespace)])
                .basic_auth(&self.username, Some(&self.password))
                .send()
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                job_id,
                body: response.text().unwrap_or_default(),
            });
        }

        let properties: HashMap<String, String> =
            response.json().map_err(|err| FetchError::Decode {
                job_id,
                reason: err.to_string(),
            })?;
        Ok(ConnectionSettings::from_properties(&properties)?)
    }
}
