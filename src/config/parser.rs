use super::MeshConfig;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Loads and validates a [`MeshConfig`] from YAML.
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Load config from file path
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<MeshConfig> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        self.parse_config(&content)
    }

    /// Parse config from a YAML string. An empty document yields the defaults.
    pub fn parse_config(&self, content: &str) -> Result<MeshConfig> {
        let config: MeshConfig = if content.trim().is_empty() {
            MeshConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_document_is_default() {
        let config = Parser::new().parse_config("").unwrap();
        assert_eq!(config.app_name, "hostmesh");
        assert_eq!(config.instances.max_instances, 100);
        assert_eq!(config.ports.base_port, 6000);
    }

    #[test]
    fn parses_partial_document_with_durations() {
        let yaml = r#"
app_name: voice-assistant
circuit_breaker:
  failure_threshold: 3
  timeout: "10s"
retry:
  initial_delay: "250ms"
shield:
  monitor_interval: 2s
rate_limit:
  window: 1m
  max_requests: 20
"#;
        let config = Parser::new().parse_config(yaml).unwrap();
        assert_eq!(config.app_name, "voice-assistant");
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout, Duration::from_secs(10));
        // Untouched fields keep their defaults
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.shield.monitor_interval, Duration::from_secs(2));
        assert_eq!(config.shield.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.rate_limit.max_requests, 20);
    }

    #[test]
    fn rejects_bad_duration() {
        let yaml = "retry:\n  max_delay: \"forever\"\n";
        assert!(Parser::new().parse_config(yaml).is_err());
    }

    #[test]
    fn rejects_invalid_values() {
        let yaml = "circuit_breaker:\n  failure_threshold: 0\n";
        let err = Parser::new().parse_config(yaml).unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {:?}", err);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.yaml");
        fs::write(&path, "app_name: from-file\n").unwrap();

        let config = Parser::new().load_config(&path).unwrap();
        assert_eq!(config.app_name, "from-file");

        let missing = Parser::new().load_config(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
