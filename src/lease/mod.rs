//! Per-job wrapped-token leases.
//!
//! Each job gets one short-TTL wrapped token, obtained on first request and
//! cached for the job's duration. When the job finishes, the underlying
//! token is revoked through its accessor; revocations that fail are parked
//! in a pending-removal set so a later sweep can retry them. Revocation is
//! always best-effort and never surfaces into job-completion handling.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{VaultClient, VaultError};
use crate::retry::{vault_retrier, RetryPolicy};
use crate::settings::ConnectionSettings;

/// Wrap TTL requested for job tokens. Long enough for the agent to unwrap
/// the token, short enough to be useless if it leaks.
pub const DEFAULT_WRAP_TTL: &str = "10m";

pub type JobId = u64;

/// The lease a job holds while it runs: the wrapped token handed to the
/// job, and the accessor used to revoke the real token afterwards.
#[derive(Debug, Clone)]
pub struct LeasedTokenInfo {
    pub job_id: JobId,
    pub wrapped_token: String,
    pub accessor: String,
    pub connection: ConnectionSettings,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    /// Without a token the job cannot resolve secrets at all, so token
    /// request failures are fatal for the requesting job.
    #[error("failed to obtain Vault token for job {job_id} (connection '{namespace}'): {source}")]
    TokenRequest {
        job_id: JobId,
        namespace: String,
        #[source]
        source: VaultError,
    },
}

#[derive(Default)]
struct LeaseTables {
    active: HashMap<JobId, LeasedTokenInfo>,
    pending_removal: Vec<LeasedTokenInfo>,
}

/// Owns the job-to-lease tables behind one lock. Created at service start
/// and shared between the token request path and the job-completion
/// callback; there is no ambient global state.
pub struct TokenLeaseManager {
    tables: Mutex<LeaseTables>,
    policy: RetryPolicy,
    wrap_ttl: String,
}

impl TokenLeaseManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            tables: Mutex::new(LeaseTables::default()),
            policy,
            wrap_ttl: DEFAULT_WRAP_TTL.to_string(),
        }
    }

    pub fn with_wrap_ttl(mut self, ttl: impl Into<String>) -> Self {
        self.wrap_ttl = ttl.into();
        self
    }

    /// Return the job's wrapped token, performing the login exchange only
    /// on the first request per job.
    pub fn request_token(
        &self,
        job_id: JobId,
        settings: &ConnectionSettings,
    ) -> Result<String, LeaseError> {
        if let Some(info) = self.tables.lock().active.get(&job_id) {
            debug!(job_id, "reusing cached wrapped token");
            return Ok(info.wrapped_token.clone());
        }

        // The lock is not held across the login call; a concurrent request
        // for the same job may win the insert below.
        let (wrapped_token, accessor) =
            self.request_wrapped_token(settings)
                .map_err(|source| LeaseError::TokenRequest {
                    job_id,
                    namespace: settings.namespace.clone(),
                    source,
                })?;

        let mut tables = self.tables.lock();
        if let Some(existing) = tables.active.get(&job_id).cloned() {
            drop(tables);
            warn!(job_id, "concurrent token request lost the race, revoking the extra token");
            self.try_revoke(&LeasedTokenInfo {
                job_id,
                wrapped_token,
                accessor,
                connection: settings.clone(),
            });
            return Ok(existing.wrapped_token);
        }
        info!(job_id, namespace = %settings.namespace, "obtained wrapped token");
        tables.active.insert(
            job_id,
            LeasedTokenInfo {
                job_id,
                wrapped_token: wrapped_token.clone(),
                accessor,
                connection: settings.clone(),
            },
        );
        Ok(wrapped_token)
    }

    /// Login with a wrap TTL and extract the wrapped token and its
    /// accessor from the response's wrap-info section.
    fn request_wrapped_token(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<(String, String), VaultError> {
        let client = VaultClient::new(settings)?;
        let retrier = vault_retrier(self.policy.clone());
        let response = retrier.execute(|| client.login(&settings.auth, Some(&self.wrap_ttl)))?;
        let wrap = response
            .wrap_info
            .ok_or(VaultError::MissingField("wrap_info"))?;
        let token = wrap.token.ok_or(VaultError::MissingField("token"))?;
        let accessor = wrap
            .wrapped_accessor
            .ok_or(VaultError::MissingField("wrapped_accessor"))?;
        Ok((token, accessor))
    }

    /// Drop the job's lease and revoke its token. Failures are logged and
    /// parked, never propagated: job completion must not depend on the
    /// store being reachable.
    pub fn on_job_finished(&self, job_id: JobId) {
        let Some(info) = self.tables.lock().active.remove(&job_id) else {
            return;
        };
        if self.try_revoke(&info) {
            info!(job_id, "revoked job token");
        } else {
            warn!(job_id, "token revocation failed, parking lease for a later sweep");
            self.tables.lock().pending_removal.push(info);
        }
    }

    /// Leases whose revocation failed, awaiting [`Self::sweep_pending`].
    pub fn pending_revocations(&self) -> Vec<LeasedTokenInfo> {
        self.tables.lock().pending_removal.clone()
    }

    pub fn has_active_lease(&self, job_id: JobId) -> bool {
        self.tables.lock().active.contains_key(&job_id)
    }

    /// Retry every parked revocation once; whatever still fails stays
    /// parked.
    pub fn sweep_pending(&self) {
        let parked = std::mem::take(&mut self.tables.lock().pending_removal);
        if parked.is_empty() {
            return;
        }
        info!(count = parked.len(), "retrying parked token revocations");
        let mut still_parked = Vec::new();
        for info in parked {
            if !self.try_revoke(&info) {
                still_parked.push(info);
            }
        }
        self.tables.lock().pending_removal.extend(still_parked);
    }

    fn try_revoke(&self, info: &LeasedTokenInfo) -> bool {
        match self.revoke(info) {
            Ok(revoked) => revoked,
            Err(err) => {
                warn!(job_id = info.job_id, error = %err, "failed to revoke token");
                false
            }
        }
    }

    /// Revocation needs its own credential: log in, revoke the job token
    /// through its accessor, then revoke the helper token we just
    /// obtained.
    fn revoke(&self, info: &LeasedTokenInfo) -> Result<bool, VaultError> {
        let settings = &info.connection;
        let mut client = VaultClient::new(settings)?;
        let response = client.login(&settings.auth, None)?;
        let auth = response.auth.ok_or(VaultError::MissingField("auth"))?;
        let token = auth
            .client_token
            .ok_or(VaultError::MissingField("client_token"))?;
        client.set_token(token);

        let revoked = client.revoke_accessor(&info.accessor);
        // The helper token is revoked regardless of the accessor outcome.
        client.revoke_self();
        revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finishing_unknown_job_is_a_noop() {
        let manager = TokenLeaseManager::new(RetryPolicy::default());
        manager.on_job_finished(42);
        assert!(manager.pending_revocations().is_empty());
        assert!(!manager.has_active_lease(42));
    }
}
