//! Operator-wide configuration, threaded through the reconciler at construction.

#![forbid(unsafe_code)]

use http::Uri;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Public base URL; its host becomes the routing `Host(...)` match.
    pub base_url: String,
    /// Object storage endpoint handed to the generator.
    pub blob_endpoint: String,
    pub generator_image: String,
    pub lighttpd_image: String,
    pub replicas: i32,
    pub entry_points: Vec<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".into(),
            blob_endpoint: "http://localhost:10000/devstoreaccount1".into(),
            generator_image: "docker.io/pdok/atom-generator:latest".into(),
            lighttpd_image: "docker.io/pdok/lighttpd:latest".into(),
            replicas: 2,
            entry_points: vec!["web".into()],
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid base url {0:?}: expected absolute http(s) url")]
    BaseUrl(String),
    #[error("replicas must be at least 1 (got {0})")]
    Replicas(i32),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.host()?;
        if self.replicas < 1 {
            return Err(ConfigError::Replicas(self.replicas));
        }
        if self.generator_image.is_empty() {
            return Err(ConfigError::Empty("generator image"));
        }
        if self.lighttpd_image.is_empty() {
            return Err(ConfigError::Empty("lighttpd image"));
        }
        Ok(())
    }

    /// Host of the configured base URL.
    pub fn host(&self) -> Result<String, ConfigError> {
        host_of(&self.base_url).ok_or_else(|| ConfigError::BaseUrl(self.base_url.clone()))
    }
}

/// Host of an absolute URL, without port.
pub fn host_of(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    uri.scheme()?;
    uri.host().map(|h| h.to_string())
}

/// Path of an absolute URL with any trailing `/` removed; `""` for the root.
pub fn path_of(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    uri.scheme()?;
    Some(uri.path().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(OperatorConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_relative_base_url_and_zero_replicas() {
        let mut c = OperatorConfig { base_url: "/just/a/path".into(), ..Default::default() };
        assert!(matches!(c.validate(), Err(ConfigError::BaseUrl(_))));
        c.base_url = "https://service.example.com".into();
        c.replicas = 0;
        assert_eq!(c.validate(), Err(ConfigError::Replicas(0)));
    }

    #[test]
    fn url_parts() {
        assert_eq!(host_of("https://service.example.com:8443/a/b").as_deref(), Some("service.example.com"));
        assert_eq!(path_of("https://service.example.com/owner/ds/atom/").as_deref(), Some("/owner/ds/atom"));
        assert_eq!(path_of("https://service.example.com").as_deref(), Some(""));
        assert_eq!(path_of("owner/ds"), None);
    }
}
