use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use jobrelay_observability::redact_text;

pub const DEFAULT_NAMESPACE: &str = "ddbmetadata-qa";
pub const DEFAULT_TEMPLATE_NAME: &str = "ddbmetadata-qa";
pub const DEFAULT_AUTH_REALM: &str = "metadata-qa";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;

/// What happens to a run whose execution unit never appeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Leave the pending run in the cluster for inspection.
    #[default]
    Retain,
    Delete,
}

impl TimeoutPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "retain" => Some(TimeoutPolicy::Retain),
            "delete" => Some(TimeoutPolicy::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutPolicy::Retain => "retain",
            TimeoutPolicy::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    pub fn parse(raw: &str) -> Self {
        let origins: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(origins)
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
    pub realm: String,
}

impl std::fmt::Debug for BasicAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthConfig")
            .field("username", &self.username)
            .field("password", &redact_text(&self.password))
            .field("realm", &self.realm)
            .finish()
    }
}

/// Process configuration, read once at startup.
#[derive(Clone)]
pub struct EngineConfig {
    pub namespace: String,
    pub template_name: String,
    pub secret_key: String,
    pub allowed_origins: AllowedOrigins,
    pub basic_auth: Option<BasicAuthConfig>,
    pub host: String,
    pub port: u16,
    pub start_timeout: Duration,
    pub start_poll_interval: Duration,
    pub timeout_policy: TimeoutPolicy,
    pub adopt_existing: bool,
    pub stop_timeout: Duration,
    pub stop_poll_interval: Duration,
    pub stream_read_timeout: Duration,
    pub stream_retry_delay: Duration,
    pub stream_max_failures: u32,
    pub logs_dir: Option<PathBuf>,
    pub log_retention_days: u64,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("namespace", &self.namespace)
            .field("template_name", &self.template_name)
            .field("secret_key", &redact_text(&self.secret_key))
            .field("allowed_origins", &self.allowed_origins)
            .field("basic_auth", &self.basic_auth)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("start_timeout", &self.start_timeout)
            .field("timeout_policy", &self.timeout_policy)
            .field("adopt_existing", &self.adopt_existing)
            .field("stop_timeout", &self.stop_timeout)
            .field("stream_read_timeout", &self.stream_read_timeout)
            .field("stream_max_failures", &self.stream_max_failures)
            .finish_non_exhaustive()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            template_name: DEFAULT_TEMPLATE_NAME.to_string(),
            secret_key: generate_secret(),
            allowed_origins: AllowedOrigins::Any,
            basic_auth: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            start_timeout: Duration::from_secs(120),
            start_poll_interval: Duration::from_millis(1000),
            timeout_policy: TimeoutPolicy::Retain,
            adopt_existing: true,
            stop_timeout: Duration::from_secs(120),
            stop_poll_interval: Duration::from_millis(2000),
            stream_read_timeout: Duration::from_secs(10),
            stream_retry_delay: Duration::from_millis(1000),
            stream_max_failures: 5,
            logs_dir: None,
            log_retention_days: 14,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(ns) = get("NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(name) = get("CRONJOB_NAME") {
            config.template_name = name;
        }
        if let Some(secret) = get("SECRET_KEY") {
            config.secret_key = secret;
        }
        if let Some(origins) = get("CORS_ALLOWED_ORIGINS") {
            config.allowed_origins = AllowedOrigins::parse(&origins);
        }
        if let (Some(username), Some(password)) = (get("HTTPAUTH_USERNAME"), get("HTTPAUTH_PASSWORD"))
        {
            config.basic_auth = Some(BasicAuthConfig {
                username,
                password,
                realm: get("HTTPAUTH_REALM").unwrap_or_else(|| DEFAULT_AUTH_REALM.to_string()),
            });
        }
        if let Some(host) = get("HOST") {
            config.host = host;
        }
        if let Some(port) = get("PORT") {
            config.port = port
                .parse()
                .with_context(|| format!("PORT must be a port number, got `{port}`"))?;
        }
        if let Some(secs) = parse_u64(&get, "START_POD_TIMEOUT_SECONDS")? {
            config.start_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&get, "START_POD_POLL_INTERVAL_MS")? {
            config.start_poll_interval = Duration::from_millis(ms);
        }
        if let Some(raw) = get("START_POD_TIMEOUT_POLICY") {
            let Some(policy) = TimeoutPolicy::parse(&raw) else {
                bail!("START_POD_TIMEOUT_POLICY must be `retain` or `delete`, got `{raw}`");
            };
            config.timeout_policy = policy;
        }
        if let Some(raw) = get("ADOPT_EXISTING_RUNS") {
            config.adopt_existing = parse_bool(&raw)
                .with_context(|| format!("ADOPT_EXISTING_RUNS must be a boolean, got `{raw}`"))?;
        }
        if let Some(secs) = parse_u64(&get, "STOP_TIMEOUT_SECONDS")? {
            config.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&get, "STOP_POLL_INTERVAL_MS")? {
            config.stop_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&get, "LOG_STREAM_REQUEST_TIMEOUT_SECONDS")? {
            config.stream_read_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&get, "LOG_STREAM_RETRY_DELAY_MS")? {
            config.stream_retry_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_u64(&get, "LOG_STREAM_MAX_FAILURES")? {
            config.stream_max_failures = u32::try_from(n).unwrap_or(u32::MAX).max(1);
        }
        if let Some(dir) = get("JOBRELAY_LOGS_DIR") {
            config.logs_dir = Some(PathBuf::from(dir));
        }
        if let Some(days) = parse_u64(&get, "JOBRELAY_LOG_RETENTION_DAYS")? {
            config.log_retention_days = days;
        }

        if config.start_timeout.is_zero() {
            bail!("START_POD_TIMEOUT_SECONDS must be greater than zero");
        }
        if config.stream_read_timeout.is_zero() {
            bail!("LOG_STREAM_REQUEST_TIMEOUT_SECONDS must be greater than zero");
        }
        Ok(config)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_template_name(mut self, name: impl Into<String>) -> Self {
        self.template_name = name.into();
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_start_poll_interval(mut self, interval: Duration) -> Self {
        self.start_poll_interval = interval;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_adopt_existing(mut self, adopt: bool) -> Self {
        self.adopt_existing = adopt;
        self
    }

    pub fn with_stop_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.stop_timeout = timeout;
        self.stop_poll_interval = poll_interval;
        self
    }

    pub fn with_stream_timing(
        mut self,
        read_timeout: Duration,
        retry_delay: Duration,
        max_failures: u32,
    ) -> Self {
        self.stream_read_timeout = read_timeout;
        self.stream_retry_delay = retry_delay;
        self.stream_max_failures = max_failures.max(1);
        self
    }

    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.basic_auth = Some(BasicAuthConfig {
            username: username.into(),
            password: password.into(),
            realm: DEFAULT_AUTH_REALM.to_string(),
        });
        self
    }

    pub fn with_allowed_origins(mut self, origins: AllowedOrigins) -> Self {
        self.allowed_origins = origins;
        self
    }

    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<u64>> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{key} must be a non-negative integer, got `{raw}`")),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn generate_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<EngineConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = config_from(&[]).expect("config");
        assert_eq!(config.namespace, "ddbmetadata-qa");
        assert_eq!(config.template_name, "ddbmetadata-qa");
        assert_eq!(config.start_timeout, Duration::from_secs(120));
        assert_eq!(config.stream_read_timeout, Duration::from_secs(10));
        assert_eq!(config.timeout_policy, TimeoutPolicy::Retain);
        assert_eq!(config.allowed_origins, AllowedOrigins::Any);
        assert!(config.basic_auth.is_none());
        assert!(config.adopt_existing);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.secret_key.len(), 32);
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("NAMESPACE", "batch"),
            ("CRONJOB_NAME", "nightly"),
            ("START_POD_TIMEOUT_SECONDS", "30"),
            ("START_POD_TIMEOUT_POLICY", "delete"),
            ("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ("HTTPAUTH_USERNAME", "ops"),
            ("HTTPAUTH_PASSWORD", "hunter2"),
            ("ADOPT_EXISTING_RUNS", "false"),
        ])
        .expect("config");
        assert_eq!(config.namespace, "batch");
        assert_eq!(config.template_name, "nightly");
        assert_eq!(config.start_timeout, Duration::from_secs(30));
        assert_eq!(config.timeout_policy, TimeoutPolicy::Delete);
        assert_eq!(
            config.allowed_origins,
            AllowedOrigins::List(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
        let auth = config.basic_auth.expect("auth");
        assert_eq!(auth.realm, "metadata-qa");
        assert!(!format!("{auth:?}").contains("hunter2"));
        assert!(!config.adopt_existing);
    }

    #[test]
    fn basic_auth_requires_both_halves() {
        let config = config_from(&[("HTTPAUTH_USERNAME", "ops")]).expect("config");
        assert!(config.basic_auth.is_none());
    }

    #[test]
    fn rejects_invalid_numbers() {
        let err = config_from(&[("START_POD_TIMEOUT_SECONDS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("START_POD_TIMEOUT_SECONDS"));
        assert!(config_from(&[("START_POD_TIMEOUT_SECONDS", "0")]).is_err());
        assert!(config_from(&[("START_POD_TIMEOUT_POLICY", "maybe")]).is_err());
    }

    #[test]
    fn timeout_policy_accepts_only_documented_names() {
        assert_eq!(TimeoutPolicy::parse(" Retain "), Some(TimeoutPolicy::Retain));
        assert_eq!(TimeoutPolicy::parse("delete"), Some(TimeoutPolicy::Delete));
        assert_eq!(TimeoutPolicy::parse("keep"), None);
        assert_eq!(TimeoutPolicy::parse("cleanup"), None);
    }
}
