//! Glue between the resolution engine and the host job scheduler.
//!
//! The host drives everything: it hands us a parameter snapshot when a job
//! starts and tells us when the job finished. We only consume the narrow
//! callback surface modeled by [`JobContext`]; how the host stores
//! parameters, renders logs, or schedules jobs is its business.

mod fetcher;

pub use fetcher::{FetchError, SettingsFetcher};

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::client::VaultClient;
use crate::lease::{JobId, TokenLeaseManager};
use crate::query::SecretQuery;
use crate::refs;
use crate::resolver::SecretsResolver;
use crate::retry::RetryPolicy;
use crate::settings::{
    self, ConnectionSettings, SET_ENV_SUFFIX, VAULT_ADDR_VAR, VAULT_TOKEN_VAR,
};

/// Parameter-key prefixes the host uses to scope write-backs.
const ENV_PARAMETER_PREFIX: &str = "env.";
const SYSTEM_PARAMETER_PREFIX: &str = "system.";

// ============================================================================
// Host callback surface
// ============================================================================

/// What the engine needs from a running job. Implemented by the host; a
/// test double is enough to exercise the whole pipeline.
pub trait JobContext {
    fn job_id(&self) -> JobId;

    /// Snapshot of the job's parameters at resolution time.
    fn parameters(&self) -> std::collections::HashMap<String, String>;

    fn set_config_parameter(&mut self, name: &str, value: &str);
    fn set_env_variable(&mut self, name: &str, value: &str);
    fn set_system_property(&mut self, name: &str, value: &str);

    /// Register a secret value with the host's log masking, so any log
    /// line containing it is redacted.
    fn mask_value(&mut self, value: &str);

    fn warning(&mut self, message: &str);

    /// Report a structured build problem (shown in the job's results).
    fn report_problem(&mut self, identity: &str, message: &str);

    /// Ask the host to terminate the job.
    fn stop_job(&mut self, reason: &str);
}

// ============================================================================
// Per-job orchestration
// ============================================================================

/// Wires scanner, parser, lease manager, and resolver together for one
/// job lifecycle. One instance serves all jobs; the lease manager is the
/// only shared mutable state and carries its own lock.
pub struct SecretsFeature {
    leases: Arc<TokenLeaseManager>,
    resolver: SecretsResolver,
    write_enabled: bool,
}

impl SecretsFeature {
    pub fn new(leases: Arc<TokenLeaseManager>, policy: RetryPolicy) -> Self {
        Self {
            leases,
            resolver: SecretsResolver::new(policy),
            write_enabled: false,
        }
    }

    /// Allow `write:` queries against dynamic-secret engines.
    pub fn with_write_engines(mut self, enabled: bool) -> Self {
        self.write_enabled = enabled;
        self
    }

    /// Resolve every secret reference the job's parameters hold against
    /// the given connections. Call once when the job starts.
    pub fn on_job_started(&self, job: &mut dyn JobContext, connections: &[ConnectionSettings]) {
        for settings in connections {
            if !settings.enabled {
                debug!(namespace = %settings.namespace, "connection disabled, skipping");
                continue;
            }
            self.resolve_connection(job, settings);
        }
    }

    /// Release the job's lease. Call once when the job completes, success
    /// or not.
    pub fn on_job_finished(&self, job_id: JobId) {
        self.leases.on_job_finished(job_id);
    }

    fn resolve_connection(&self, job: &mut dyn JobContext, settings: &ConnectionSettings) {
        let namespace = settings.namespace.clone();
        let parameters = job.parameters();
        let namespaces = [namespace.clone()];
        let (references, _owning_keys) = refs::collect(&parameters, &namespaces);
        let expose_env = should_expose_env(&parameters, &namespace);

        if references.is_empty() && !expose_env {
            debug!(namespace = %namespace, "no secret references, nothing to resolve");
            return;
        }

        let token = match self.leases.request_token(job.job_id(), settings) {
            Ok(token) => token,
            Err(err) => {
                let message = err.to_string();
                if settings.fail_on_error {
                    job.report_problem(&problem_identity(job.job_id(), &namespace), &message);
                    job.stop_job(&message);
                } else {
                    job.warning(&message);
                }
                return;
            }
        };
        job.mask_value(&token);

        if expose_env {
            let prefix = settings::env_prefix(&namespace);
            job.set_env_variable(&format!("{prefix}{VAULT_ADDR_VAR}"), &settings.url);
            job.set_env_variable(&format!("{prefix}{VAULT_TOKEN_VAR}"), &token);
            info!(namespace = %namespace, "exposed Vault address and token to the job environment");
        }

        if references.is_empty() {
            return;
        }
        info!(
            count = references.len(),
            namespace = %namespace,
            "resolving secret references"
        );

        let parsed = parse_queries(&references, &namespace, self.write_enabled);
        let queries: Vec<SecretQuery> = parsed.iter().map(|(_, query)| query.clone()).collect();
        let client = match VaultClient::with_token(settings, &token) {
            Ok(client) => client,
            Err(err) => {
                let message = err.to_string();
                job.report_problem(&problem_identity(job.job_id(), &namespace), &message);
                if settings.fail_on_error {
                    job.stop_job(&message);
                }
                return;
            }
        };

        let result = self.resolver.resolve(&client, &queries);

        for value in result.replacements.values() {
            job.mask_value(value);
        }

        if !result.errors.is_empty() {
            for error in result.errors.values() {
                job.warning(error);
            }
            let suffix = if settings::is_default(&namespace) {
                String::new()
            } else {
                format!(" ('{namespace}' namespace)")
            };
            let noun = if result.errors.len() == 1 { "error" } else { "errors" };
            let message = format!(
                "{} {noun} while fetching data from HashiCorp Vault{suffix}",
                result.errors.len()
            );
            job.report_problem(&problem_identity(job.job_id(), &namespace), &message);
            if settings.fail_on_error {
                job.stop_job(&message);
            }
        }

        // Re-key resolved values by the textual path form each reference
        // uses, so write-sentinel references find their values too.
        let mut by_reference_path = std::collections::HashMap::new();
        for (reference, query) in &parsed {
            if let Some(value) = result.replacements.get(&query.full()) {
                by_reference_path.insert(refs::path_of(reference, &namespace), value.clone());
            }
        }
        let updated = refs::apply_replacements(&parameters, &by_reference_path, &namespace);
        for (key, value) in &updated {
            if parameters.get(key) == Some(value) {
                continue;
            }
            write_back(job, key, value);
        }
    }
}

/// Parameter write-backs are scoped by the host's key prefixes: `env.`
/// keys become environment variables, `system.` keys become system
/// properties, everything else is a config parameter.
fn write_back(job: &mut dyn JobContext, key: &str, value: &str) {
    if let Some(name) = key.strip_prefix(ENV_PARAMETER_PREFIX) {
        job.set_env_variable(name, value);
    } else if let Some(name) = key.strip_prefix(SYSTEM_PARAMETER_PREFIX) {
        job.set_system_property(name, value);
    } else {
        job.set_config_parameter(key, value);
    }
}

fn parse_queries(
    references: &BTreeSet<String>,
    namespace: &str,
    write_enabled: bool,
) -> Vec<(String, SecretQuery)> {
    references
        .iter()
        .map(|reference| {
            let path = refs::path_of(reference, namespace);
            // path_of prepends a slash; the write sentinel, when present,
            // sits right behind it.
            let query = SecretQuery::parse(path.trim_start_matches('/'), write_enabled);
            (reference.clone(), query)
        })
        .collect()
}

fn should_expose_env(
    parameters: &std::collections::HashMap<String, String>,
    namespace: &str,
) -> bool {
    parameters
        .get(&settings::parameter_name(namespace, SET_ENV_SUFFIX))
        .map(|value| value == "true")
        .unwrap_or(false)
}

fn problem_identity(job_id: JobId, namespace: &str) -> String {
    format!("VC_{job_id}_{namespace}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeJob {
        id: JobId,
        parameters: HashMap<String, String>,
        config: HashMap<String, String>,
        env: HashMap<String, String>,
        system: HashMap<String, String>,
        masked: Vec<String>,
        warnings: Vec<String>,
        problems: Vec<(String, String)>,
        stopped: Option<String>,
    }

    impl JobContext for FakeJob {
        fn job_id(&self) -> JobId {
            self.id
        }
        fn parameters(&self) -> HashMap<String, String> {
            self.parameters.clone()
        }
        fn set_config_parameter(&mut self, name: &str, value: &str) {
            self.config.insert(name.to_string(), value.to_string());
        }
        fn set_env_variable(&mut self, name: &str, value: &str) {
            self.env.insert(name.to_string(), value.to_string());
        }
        fn set_system_property(&mut self, name: &str, value: &str) {
            self.system.insert(name.to_string(), value.to_string());
        }
        fn mask_value(&mut self, value: &str) {
            self.masked.push(value.to_string());
        }
        fn warning(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }
        fn report_problem(&mut self, identity: &str, message: &str) {
            self.problems.push((identity.to_string(), message.to_string()));
        }
        fn stop_job(&mut self, reason: &str) {
            self.stopped = Some(reason.to_string());
        }
    }

    #[test]
    fn write_back_scopes_by_key_prefix() {
        let mut job = FakeJob::default();
        write_back(&mut job, "env.DB_PASSWORD", "a");
        write_back(&mut job, "system.db.password", "b");
        write_back(&mut job, "db.password", "c");
        assert_eq!(job.env.get("DB_PASSWORD").unwrap(), "a");
        assert_eq!(job.system.get("db.password").unwrap(), "b");
        assert_eq!(job.config.get("db.password").unwrap(), "c");
    }

    #[test]
    fn queries_parsed_from_references() {
        let references: BTreeSet<String> =
            ["vault:/secret/app!/key".to_string()].into_iter().collect();
        let parsed = parse_queries(&references, "", false);
        assert_eq!(parsed.len(), 1);
        let (reference, query) = &parsed[0];
        assert_eq!(reference, "vault:/secret/app!/key");
        assert_eq!(query.path, "/secret/app");
        assert_eq!(query.sub_key.as_deref(), Some("key"));
    }

    #[test]
    fn env_exposure_requires_opt_in() {
        let mut parameters = HashMap::new();
        assert!(!should_expose_env(&parameters, ""));
        parameters.insert("vault.set.env".to_string(), "true".to_string());
        assert!(should_expose_env(&parameters, ""));
        assert!(!should_expose_env(&parameters, "staging"));
    }

    #[test]
    fn no_references_and_no_opt_in_skips_the_connection() {
        // No lease manager interaction happens: the job carries nothing to
        // resolve, so on_job_started must not reach for the network.
        let leases = Arc::new(TokenLeaseManager::new(RetryPolicy::default()));
        let feature = SecretsFeature::new(leases.clone(), RetryPolicy::default());
        let mut job = FakeJob {
            id: 7,
            parameters: [("plain".to_string(), "value".to_string())].into(),
            ..Default::default()
        };
        let settings = ConnectionSettings {
            namespace: String::new(),
            url: "http://127.0.0.1:1".into(),
            vault_namespace: String::new(),
            verify_ssl: true,
            fail_on_error: true,
            enabled: true,
            auth: crate::settings::Auth::AppRole {
                endpoint: "approle".into(),
                role_id: "role".into(),
                secret_id: String::new(),
            },
        };
        feature.on_job_started(&mut job, &[settings]);
        assert!(job.stopped.is_none());
        assert!(job.problems.is_empty());
        assert!(job.warnings.is_empty());
        assert!(job.masked.is_empty());
        assert!(!leases.has_active_lease(7));
    }
}
