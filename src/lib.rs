//! Secret resolution for CI jobs backed by HashiCorp Vault.
//!
//! Job parameters may embed secret references (`%vault:/path!/key%`). When
//! a job starts, this crate scans the parameter set, fetches each
//! referenced secret over HTTP with a failure-aware retry policy, extracts
//! the requested scalar values, and substitutes them back into the
//! parameters, reporting partial failure per reference. A per-job wrapped
//! authentication token is leased on first use and revoked when the job
//! finishes.
//!
//! The host scheduler stays in charge of job lifecycles; it drives the
//! engine through [`host::SecretsFeature`] and the [`host::JobContext`]
//! callback surface.

pub mod client;
pub mod host;
pub mod lease;
pub mod query;
pub mod refs;
pub mod resolver;
pub mod retry;
pub mod settings;

pub use client::{VaultClient, VaultDocument, VaultError};
pub use host::{JobContext, SecretsFeature, SettingsFetcher};
pub use lease::{JobId, LeaseError, LeasedTokenInfo, TokenLeaseManager};
pub use query::SecretQuery;
pub use resolver::{ResolvingResult, SecretsResolver};
pub use retry::{Classification, Retrier, RetryPolicy};
pub use settings::{Auth, ConnectionSettings};
