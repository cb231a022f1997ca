use std::time::Duration;

use crate::keys::KeyStyle;

/// HTTP adapter configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub host: String,
    pub namespace: Option<String>,
    pub timeout_secs: u64,
    pub key_style: KeyStyle,
}

impl HttpConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            namespace: None,
            timeout_secs: 30,
            key_style: KeyStyle::Verbatim,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_key_style(mut self, key_style: KeyStyle) -> Self {
        self.key_style = key_style;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = var("LAGER_API_HOST")
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::Missing("LAGER_API_HOST"))?;

        if !host.starts_with("http://") && !host.starts_with("https://") {
            return Err(ConfigError::Invalid(
                "LAGER_API_HOST",
                "must start with http:// or https://",
            ));
        }

        let namespace = var("LAGER_API_NAMESPACE")
            .map(|ns| ns.trim_matches('/').to_string())
            .filter(|ns| !ns.is_empty());

        let timeout_secs = match var("LAGER_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::Invalid(
                    "LAGER_TIMEOUT_SECS",
                    "must be a positive number of seconds",
                ))?,
            None => 30,
        };

        let key_style = match var("LAGER_KEY_STYLE") {
            Some(raw) => KeyStyle::parse(&raw).ok_or(ConfigError::Invalid(
                "LAGER_KEY_STYLE",
                "must be 'verbatim' or 'dasherized'",
            ))?,
            None => KeyStyle::Verbatim,
        };

        Ok(HttpConfig {
            host: host.trim_end_matches('/').to_string(),
            namespace,
            timeout_secs,
            key_style,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `{host}/{namespace}` without a trailing slash.
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        match &self.namespace {
            Some(ns) => format!("{}/{}", host, ns.trim_matches('/')),
            None => host.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(var) => {
                write!(f, "Missing required environment variable: {}", var)
            }
            ConfigError::Invalid(var, msg) => write!(f, "Invalid value for {}: {}", var, msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HttpConfig::from_vars(lookup(&[("LAGER_API_HOST", "http://localhost:4200/")]))
            .unwrap();
        assert_eq!(config.host, "http://localhost:4200");
        assert_eq!(config.namespace, None);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.key_style, KeyStyle::Verbatim);
        assert_eq!(config.base_url(), "http://localhost:4200");
    }

    #[test]
    fn test_namespace_and_timeout() {
        let config = HttpConfig::from_vars(lookup(&[
            ("LAGER_API_HOST", "https://api.example.com"),
            ("LAGER_API_NAMESPACE", "/api/v1/"),
            ("LAGER_TIMEOUT_SECS", "5"),
            ("LAGER_KEY_STYLE", "dasherized"),
        ]))
        .unwrap();
        assert_eq!(config.base_url(), "https://api.example.com/api/v1");
        assert_eq!(config.key_style, KeyStyle::Dasherized);
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_missing_host() {
        let err = HttpConfig::from_vars(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("LAGER_API_HOST"));
        assert_eq!(
            err.to_string(),
            "Missing required environment variable: LAGER_API_HOST"
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = HttpConfig::from_vars(lookup(&[("LAGER_API_HOST", "localhost")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("LAGER_API_HOST", _)));

        let err = HttpConfig::from_vars(lookup(&[
            ("LAGER_API_HOST", "http://localhost"),
            ("LAGER_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().starts_with("Invalid value for LAGER_TIMEOUT_SECS"));

        let err = HttpConfig::from_vars(lookup(&[
            ("LAGER_API_HOST", "http://localhost"),
            ("LAGER_KEY_STYLE", "snake"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("LAGER_KEY_STYLE", _)));
    }
}
