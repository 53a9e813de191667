//! Failure-aware retry wrapper shared by every network call in the crate.
//!
//! An operation is attempted up to `max_attempts` times. Errors are run
//! through an ordered list of classifiers: the first classification wins,
//! a fatal classification stops retrying immediately, and unclassified
//! errors are treated as transient. Returned values can likewise be
//! classified as retryable-error responses (used for host HTTP calls whose
//! failures come back as status codes rather than errors).
//!
//! The attempt loop is an explicit state machine with an injectable sleep
//! function so backoff timing is deterministic under test.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::VaultError;

/// Host parameters overriding the retry policy per job.
pub const MAX_ATTEMPTS_PARAM: &str = "vault.retry.maxAttempts";
pub const DELAY_SECONDS_PARAM: &str = "vault.retry.delaySeconds";

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_DELAY: Duration = Duration::from_secs(3);

/// Verdict of a classifier for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Worth another attempt (server-side or transient failure).
    Recoverable,
    /// Retrying cannot help (caller error); fail immediately.
    Fatal,
}

pub type ExceptionClassifier<E> = Box<dyn Fn(&E) -> Option<Classification> + Send + Sync>;
pub type ResponseClassifier<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

// ============================================================================
// Policy
// ============================================================================

/// Attempt budget and backoff shape. Immutable once built; shared across
/// concurrent calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Added to the delay once per completed attempt (linear backoff).
    /// Zero keeps the delay constant.
    pub delay_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_DELAY,
            delay_step: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Read overrides from a job parameter map, falling back to defaults
    /// for absent or unparseable values.
    pub fn from_parameters(parameters: &HashMap<String, String>) -> Self {
        let max_attempts = parameters
            .get(MAX_ATTEMPTS_PARAM)
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let base_delay = parameters
            .get(DELAY_SECONDS_PARAM)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DELAY);
        Self {
            max_attempts,
            base_delay,
            delay_step: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay + self.delay_step * attempt.saturating_sub(1)
    }
}

// ============================================================================
// Retrier
// ============================================================================

/// Retry executor for operations returning `Result<T, E>`. Each call site
/// builds its own retrier with the classifier set that fits its failure
/// modes; the attempt/backoff mechanics are shared.
pub struct Retrier<T, E> {
    policy: RetryPolicy,
    exception_classifiers: Vec<ExceptionClassifier<E>>,
    response_classifiers: Vec<ResponseClassifier<T>>,
    sleep: Box<dyn Fn(Duration) + Send + Sync>,
}

impl<T, E: std::fmt::Display> Retrier<T, E> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            exception_classifiers: Vec::new(),
            response_classifiers: Vec::new(),
            sleep: Box::new(std::thread::sleep),
        }
    }

    pub fn with_exception_classifier(mut self, classifier: ExceptionClassifier<E>) -> Self {
        self.exception_classifiers.push(classifier);
        self
    }

    pub fn with_response_classifier(mut self, classifier: ResponseClassifier<T>) -> Self {
        self.response_classifiers.push(classifier);
        self
    }

    /// Replace the backoff sleep. Tests inject a recorder here to assert
    /// sleep counts without real delays.
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    /// Run the operation under the retry policy.
    ///
    /// Exit conditions: a response not classified as an error returns
    /// immediately; a fatal error returns immediately; otherwise the last
    /// attempt's outcome is returned once the budget is exhausted (an
    /// error-classified response is returned as-is, not turned into an
    /// error).
    pub fn execute(&self, mut operation: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(response) => {
                    if attempt < max_attempts && self.is_error_response(&response) {
                        debug!(attempt, "response classified as retryable error");
                        (self.sleep)(self.policy.delay_for(attempt));
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if self.classify(&error) == Classification::Fatal {
                        debug!(attempt, error = %error, "error classified as fatal, not retrying");
                        return Err(error);
                    }
                    if attempt == max_attempts {
                        return Err(error);
                    }
                    warn!(attempt, error = %error, "attempt failed, retrying");
                    (self.sleep)(self.policy.delay_for(attempt));
                    attempt += 1;
                }
            }
        }
    }

    /// First classifier with an opinion wins; unclassified errors are
    /// transient.
    fn classify(&self, error: &E) -> Classification {
        self.exception_classifiers
            .iter()
            .find_map(|classifier| classifier(error))
            .unwrap_or(Classification::Recoverable)
    }

    fn is_error_response(&self, response: &T) -> bool {
        self.response_classifiers
            .iter()
            .any(|classifier| classifier(response))
    }
}

// ============================================================================
// Classifier building blocks
// ============================================================================

/// Walk an error's source chain looking for a cause of type `S`. Matching
/// goes through wrapper errors, not only the outermost one.
pub fn find_source<'a, S: std::error::Error + 'static>(
    error: &'a (dyn std::error::Error + 'static),
) -> Option<&'a S> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(found) = err.downcast_ref::<S>() {
            return Some(found);
        }
        current = err.source();
    }
    None
}

fn find_status(error: &VaultError) -> Option<u16> {
    if let VaultError::Status { status, .. } = error {
        return Some(*status);
    }
    find_source::<reqwest::Error>(error)
        .and_then(|err| err.status())
        .map(|status| status.as_u16())
}

/// HTTP status classifier for store calls: 4xx means the request itself is
/// wrong and retrying cannot help; 5xx is a server-side failure worth
/// another attempt; any other classified status is fatal.
pub fn http_status_classifier() -> ExceptionClassifier<VaultError> {
    Box::new(|error| match find_status(error) {
        Some(status) if (400..500).contains(&status) => Some(Classification::Fatal),
        Some(status) if (500..600).contains(&status) => Some(Classification::Recoverable),
        Some(_) => Some(Classification::Fatal),
        None => None,
    })
}

/// Transport classifier: connect failures and timeouts anywhere in the
/// cause chain are recoverable.
pub fn connect_timeout_classifier() -> ExceptionClassifier<VaultError> {
    Box::new(|error| {
        find_source::<reqwest::Error>(error)
            .filter(|err| err.is_timeout() || err.is_connect())
            .map(|_| Classification::Recoverable)
    })
}

/// The classifier stack used for secret fetch/write and login calls.
pub fn vault_retrier<T>(policy: RetryPolicy) -> Retrier<T, VaultError> {
    Retrier::new(policy)
        .with_exception_classifier(connect_timeout_classifier())
        .with_exception_classifier(http_status_classifier())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn no_sleep_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(3),
            delay_step: Duration::ZERO,
        }
    }

    fn counting_retrier<T>(
        sleeps: Arc<Mutex<Vec<Duration>>>,
        policy: RetryPolicy,
    ) -> Retrier<T, VaultError> {
        vault_retrier(policy).with_sleep(move |delay| sleeps.lock().unwrap().push(delay))
    }

    fn status(code: u16) -> VaultError {
        VaultError::Status {
            status: code,
            message: "boom".into(),
        }
    }

    #[test]
    fn success_returns_immediately() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let retrier = counting_retrier::<u32>(sleeps.clone(), no_sleep_policy());
        let calls = AtomicUsize::new(0);
        let result = retrier.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(200)
        });
        assert_eq!(result.unwrap(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeps.lock().unwrap().is_empty());
    }

    #[test]
    fn fatal_error_is_not_retried() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let retrier = counting_retrier::<u32>(sleeps.clone(), no_sleep_policy());
        let calls = AtomicUsize::new(0);
        let result = retrier.execute(|| -> Result<u32, VaultError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(status(403))
        });
        assert!(matches!(
            result,
            Err(VaultError::Status { status: 403, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeps.lock().unwrap().is_empty());
    }

    #[test]
    fn recoverable_error_then_success() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let retrier = counting_retrier::<u32>(sleeps.clone(), no_sleep_policy());
        let calls = AtomicUsize::new(0);
        let result = retrier.execute(|| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(status(503))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sleeps.lock().unwrap().len(), 1);
    }

    #[test]
    fn unclassified_error_retried_until_exhaustion() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let retrier = counting_retrier::<u32>(sleeps.clone(), no_sleep_policy());
        let calls = AtomicUsize::new(0);
        let result = retrier.execute(|| -> Result<u32, VaultError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(VaultError::MissingField("token"))
        });
        assert!(matches!(result, Err(VaultError::MissingField("token"))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // No sleep after the final attempt.
        assert_eq!(sleeps.lock().unwrap().len(), 2);
    }

    #[test]
    fn error_response_retried_then_success() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let retrier = counting_retrier::<u32>(sleeps.clone(), no_sleep_policy())
            .with_response_classifier(Box::new(|code| (500..600).contains(code)));
        let calls = AtomicUsize::new(0);
        let result = retrier.execute(|| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(502)
            } else {
                Ok(200)
            }
        });
        assert_eq!(result.unwrap(), 200);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sleeps.lock().unwrap().len(), 1);
    }

    #[test]
    fn exhausted_error_responses_returned_as_is() {
        let retrier = counting_retrier::<u32>(Arc::new(Mutex::new(Vec::new())), no_sleep_policy())
            .with_response_classifier(Box::new(|code| (500..600).contains(code)));
        let calls = AtomicUsize::new(0);
        let result = retrier.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(503)
        });
        assert_eq!(result.unwrap(), 503);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn linear_backoff_grows_per_attempt() {
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            delay_step: Duration::from_secs(2),
        };
        let retrier = counting_retrier::<u32>(sleeps.clone(), policy);
        let _ = retrier.execute(|| -> Result<u32, VaultError> {
            Err(VaultError::MissingField("accessor"))
        });
        assert_eq!(
            *sleeps.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(3)]
        );
    }

    #[test]
    fn classifier_order_first_match_wins() {
        let retrier: Retrier<u32, VaultError> = Retrier::new(no_sleep_policy())
            .with_exception_classifier(Box::new(|_| Some(Classification::Fatal)))
            .with_exception_classifier(Box::new(|_| Some(Classification::Recoverable)))
            .with_sleep(|_| {});
        let calls = AtomicUsize::new(0);
        let result = retrier.execute(|| -> Result<u32, VaultError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(status(500))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn policy_reads_parameter_overrides() {
        let mut parameters = HashMap::new();
        parameters.insert(MAX_ATTEMPTS_PARAM.to_string(), "5".to_string());
        parameters.insert(DELAY_SECONDS_PARAM.to_string(), "1".to_string());
        let policy = RetryPolicy::from_parameters(&parameters);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));

        let defaults = RetryPolicy::from_parameters(&HashMap::new());
        assert_eq!(defaults.max_attempts, 3);
    }

    #[test]
    fn status_classifier_sees_through_wrappers() {
        // A login failure wrapping a 4xx must still be fatal.
        let classifier = http_status_classifier();
        assert_eq!(classifier(&status(400)), Some(Classification::Fatal));
        assert_eq!(classifier(&status(500)), Some(Classification::Recoverable));
        assert_eq!(classifier(&status(302)), Some(Classification::Fatal));
        assert_eq!(classifier(&VaultError::MissingField("token")), None);
    }
}
