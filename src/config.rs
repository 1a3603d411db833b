//! Instrumentation and transport configuration

use crate::error::ConfigError;
use std::env;

pub const DEFAULT_NAMESPACE: &str = "openai";
pub const DEFAULT_SCOPE: &str = "openai-instrumentation";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub const ENV_NAMESPACE: &str = "OPENAI_INSTRUMENTATION_NAMESPACE";
pub const ENV_DENYLIST: &str = "OPENAI_INSTRUMENTATION_DENYLIST";
pub const ENV_SCOPE: &str = "OPENAI_INSTRUMENTATION_TRACER";
pub const ENV_API_BASE: &str = "OPENAI_API_BASE";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";

/// Settings shared by every instrumented call.
///
/// `namespace` prefixes all span names and attribute keys, `denylist` names
/// call arguments that are never copied onto spans, and `scope` is the
/// instrumentation scope used for both the tracer and the meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationConfig {
    pub namespace: String,
    pub denylist: Vec<String>,
    pub scope: String,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            denylist: vec!["prompt".to_string()],
            scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

impl InstrumentationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Adds a key to the denylist.
    pub fn deny(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.denylist.contains(&key) {
            self.denylist.push(key);
        }
        self
    }

    pub fn with_denylist<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denylist = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Builds the configuration from environment variables, falling back to
    /// the defaults for anything unset.
    ///
    /// * `OPENAI_INSTRUMENTATION_NAMESPACE` - attribute and span name prefix
    /// * `OPENAI_INSTRUMENTATION_DENYLIST` - comma separated argument names
    /// * `OPENAI_INSTRUMENTATION_TRACER` - tracer and meter scope name
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(namespace) = env::var(ENV_NAMESPACE) {
            let namespace = namespace.trim();
            if namespace.is_empty() || namespace.contains(char::is_whitespace) {
                return Err(ConfigError::InvalidValue {
                    name: ENV_NAMESPACE,
                    reason: format!("{:?} is not a valid attribute prefix", namespace),
                });
            }
            config.namespace = namespace.to_string();
        }

        if let Ok(denylist) = env::var(ENV_DENYLIST) {
            config.denylist = denylist
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(scope) = env::var(ENV_SCOPE) {
            if !scope.trim().is_empty() {
                config.scope = scope.trim().to_string();
            }
        }

        Ok(config)
    }
}

/// Connection settings for [`crate::HttpTransport`].
#[derive(Clone)]
pub struct HttpConfig {
    pub api_base: String,
    pub api_key: String,
}

impl std::fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"***")
            .finish()
    }
}

impl HttpConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Reads `OPENAI_API_KEY` (required) and `OPENAI_API_BASE` (optional).
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env::var(ENV_API_KEY).map_err(|_| ConfigError::MissingVar(ENV_API_KEY))?;
        let mut config = Self::new(api_key);
        if let Ok(api_base) = env::var(ENV_API_BASE) {
            config.api_base = api_base;
        }
        Ok(config)
    }

    /// Joins the API base and an endpoint path, tolerating a trailing slash.
    pub fn endpoint(&self, path: &str) -> String {
        let base = self.api_base.trim_end_matches('/');
        format!("{}/{}", base, path.trim_start_matches('/'))
    }
}
