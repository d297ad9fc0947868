//! Configuration types.
//!
//! Everything has a sensible default; `RunnerConfig::from_env()` overrides
//! individual values from `ASSIST_RUNNER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::BackoffPolicy;

const ENV_PREFIX: &str = "ASSIST_RUNNER_";

/// Top-level runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Retry and stream-tolerance settings.
    pub retry: RetryConfig,
    /// Maximum time a session waits for its (repository, branch) lock.
    pub lock_timeout: Duration,
    /// Workspace cache settings.
    pub cache: CacheConfig,
    /// Provider rate budget.
    pub rate: RateConfig,
    /// Assistant process invocation.
    pub assistant: AssistantConfig,
    /// Maximum number of assistant processes running at once.
    pub max_parallel_sessions: usize,
    /// Number of terminal reports remembered for idempotency checks.
    pub idempotency_capacity: usize,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Retry executor settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per job, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
    /// Upper bound on a single attempt's wall time.
    pub attempt_timeout: Duration,
    /// Bytes a partial message may buffer before it is declared malformed.
    pub malformed_buffer_limit: usize,
    /// Malformed events tolerated within one attempt before it is abandoned.
    pub malformed_tolerance: usize,
}

/// Workspace cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory workspaces are materialized under.
    pub root: PathBuf,
    /// Entries kept before idle ones are evicted.
    pub capacity: usize,
    /// Age after which an idle workspace is re-materialized.
    pub ttl: Duration,
    /// Upper bound on a single materialization.
    pub materialize_timeout: Duration,
}

/// Provider rate budget settings.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Length of one budget window.
    pub window: Duration,
    /// Units available per window.
    pub limit: u64,
    /// Units reserved for each dispatched attempt.
    pub cost_per_attempt: u64,
    /// What the coordinator does when the budget is exhausted.
    pub wait: RateWaitPolicy,
}

/// Coordinator behavior on a denied rate reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWaitPolicy {
    /// Wait for `retry_after` and try again, failing once `max_wait` is spent.
    Queue { max_wait: Duration },
    /// Fail the job immediately with the retry-after hint.
    Reject,
}

/// Assistant process invocation settings.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Program to execute.
    pub program: String,
    /// Extra arguments appended after the generated ones.
    pub extra_args: Vec<String>,
}

/// Log output settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub filter: String,
    /// Directory for the rolling JSON log file (disabled when `None`).
    pub json_dir: Option<PathBuf>,
    /// File name prefix of the JSON log.
    pub json_file: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            lock_timeout: Duration::from_secs(600), // 10 minutes
            cache: CacheConfig::default(),
            rate: RateConfig::default(),
            assistant: AssistantConfig::default(),
            max_parallel_sessions: 4,
            idempotency_capacity: 10_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            attempt_timeout: Duration::from_secs(1800), // 30 minutes
            malformed_buffer_limit: 1024 * 1024,
            malformed_tolerance: 8,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("assist-runner").join("workspaces"),
            capacity: 16,
            ttl: Duration::from_secs(900), // 15 minutes
            materialize_timeout: Duration::from_secs(300),
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            limit: 50,
            cost_per_attempt: 1,
            wait: RateWaitPolicy::Queue {
                max_wait: Duration::from_secs(300),
            },
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json_dir: None,
            json_file: "assist-runner.log.jsonl".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Build a configuration from `ASSIST_RUNNER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Keys are the variable names without the `ASSIST_RUNNER_` prefix, e.g.
    /// `MAX_ATTEMPTS`. Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        if let Some(v) = env.parse("MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(ms) = env.parse("BACKOFF_INITIAL_MS")? {
            config.retry.backoff.initial = Duration::from_millis(ms);
        }
        if let Some(v) = env.parse("BACKOFF_MULTIPLIER")? {
            config.retry.backoff.multiplier = v;
        }
        if let Some(ms) = env.parse("BACKOFF_MAX_MS")? {
            config.retry.backoff.max = Duration::from_millis(ms);
        }
        if let Some(v) = env.parse("BACKOFF_JITTER")? {
            config.retry.backoff.jitter = v;
        }
        if let Some(secs) = env.parse("ATTEMPT_TIMEOUT_SECS")? {
            config.retry.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env.parse("MALFORMED_BUFFER_LIMIT")? {
            config.retry.malformed_buffer_limit = v;
        }
        if let Some(v) = env.parse("MALFORMED_TOLERANCE")? {
            config.retry.malformed_tolerance = v;
        }
        if let Some(secs) = env.parse("LOCK_TIMEOUT_SECS")? {
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(root) = env.get("CACHE_ROOT") {
            config.cache.root = PathBuf::from(root);
        }
        if let Some(v) = env.parse("CACHE_CAPACITY")? {
            config.cache.capacity = v;
        }
        if let Some(secs) = env.parse("CACHE_TTL_SECS")? {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse("MATERIALIZE_TIMEOUT_SECS")? {
            config.cache.materialize_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse("RATE_WINDOW_SECS")? {
            config.rate.window = Duration::from_secs(secs);
        }
        if let Some(v) = env.parse("RATE_LIMIT")? {
            config.rate.limit = v;
        }
        if let Some(v) = env.parse("RATE_COST_PER_ATTEMPT")? {
            config.rate.cost_per_attempt = v;
        }
        if let Some(policy) = env.get("RATE_POLICY") {
            config.rate.wait = match policy.trim().to_lowercase().as_str() {
                "reject" => RateWaitPolicy::Reject,
                "queue" => {
                    let max_wait = env
                        .parse("RATE_MAX_WAIT_SECS")?
                        .map(Duration::from_secs)
                        .unwrap_or(Duration::from_secs(300));
                    RateWaitPolicy::Queue { max_wait }
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("{ENV_PREFIX}RATE_POLICY"),
                        message: format!("expected 'queue' or 'reject', got '{other}'"),
                    });
                }
            };
        } else if let Some(secs) = env.parse("RATE_MAX_WAIT_SECS")? {
            config.rate.wait = RateWaitPolicy::Queue {
                max_wait: Duration::from_secs(secs),
            };
        }
        if let Some(program) = env.get("ASSISTANT_BIN") {
            config.assistant.program = program;
        }
        if let Some(args) = env.get("ASSISTANT_ARGS") {
            config.assistant.extra_args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(v) = env.parse("MAX_PARALLEL")? {
            config.max_parallel_sessions = v;
        }
        if let Some(v) = env.parse("IDEMPOTENCY_CAPACITY")? {
            config.idempotency_capacity = v;
        }
        if let Some(filter) = env.get("LOG") {
            config.logging.filter = filter;
        }
        if let Some(dir) = env.get("LOG_DIR") {
            config.logging.json_dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runner cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.retry.backoff.multiplier < 1.0 {
            return Err(invalid("BACKOFF_MULTIPLIER", "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.backoff.jitter) {
            return Err(invalid("BACKOFF_JITTER", "must be within 0.0..=1.0"));
        }
        if self.cache.capacity == 0 {
            return Err(invalid("CACHE_CAPACITY", "must be at least 1"));
        }
        if self.rate.limit == 0 {
            return Err(invalid("RATE_LIMIT", "must be at least 1"));
        }
        if self.rate.cost_per_attempt > self.rate.limit {
            return Err(invalid(
                "RATE_COST_PER_ATTEMPT",
                "cannot exceed RATE_LIMIT",
            ));
        }
        if self.rate.window.is_zero() {
            return Err(invalid("RATE_WINDOW_SECS", "must be positive"));
        }
        if self.max_parallel_sessions == 0 {
            return Err(invalid("MAX_PARALLEL", "must be at least 1"));
        }
        if self.retry.malformed_buffer_limit == 0 {
            return Err(invalid("MALFORMED_BUFFER_LIMIT", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{key}"),
        message: message.to_string(),
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{key}"),
                    message: format!("'{raw}': {e}"),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = RunnerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.assistant.program, "claude");
        assert!(matches!(config.rate.wait, RateWaitPolicy::Queue { .. }));
    }

    #[test]
    fn overrides_are_applied() {
        let config = RunnerConfig::from_lookup(lookup(&[
            ("MAX_ATTEMPTS", "5"),
            ("BACKOFF_INITIAL_MS", "250"),
            ("LOCK_TIMEOUT_SECS", "30"),
            ("CACHE_CAPACITY", "2"),
            ("RATE_LIMIT", "10"),
            ("RATE_POLICY", "reject"),
            ("ASSISTANT_ARGS", "--model  opus"),
            ("MALFORMED_BUFFER_LIMIT", "4096"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff.initial, Duration::from_millis(250));
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.cache.capacity, 2);
        assert_eq!(config.rate.limit, 10);
        assert_eq!(config.rate.wait, RateWaitPolicy::Reject);
        assert_eq!(config.assistant.extra_args, vec!["--model", "opus"]);
        assert_eq!(config.retry.malformed_buffer_limit, 4096);
    }

    #[test]
    fn queue_policy_reads_max_wait() {
        let config = RunnerConfig::from_lookup(lookup(&[
            ("RATE_POLICY", "queue"),
            ("RATE_MAX_WAIT_SECS", "7"),
        ]))
        .unwrap();
        assert_eq!(
            config.rate.wait,
            RateWaitPolicy::Queue {
                max_wait: Duration::from_secs(7)
            }
        );
    }

    #[test]
    fn unparsable_value_names_the_key() {
        let err = RunnerConfig::from_lookup(lookup(&[("MAX_ATTEMPTS", "many")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "ASSIST_RUNNER_MAX_ATTEMPTS"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_attempts_rejected() {
        assert!(RunnerConfig::from_lookup(lookup(&[("MAX_ATTEMPTS", "0")])).is_err());
    }

    #[test]
    fn unknown_rate_policy_rejected() {
        assert!(RunnerConfig::from_lookup(lookup(&[("RATE_POLICY", "drop")])).is_err());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = RunnerConfig::from_lookup(lookup(&[("MAX_ATTEMPTS", "  ")])).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }
}
