//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::MeshConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<MeshConfig, ConfigError> {
    let config: MeshConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<MeshConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_reported_together() {
        let err = parse_config(
            r#"
            [sidecar]
            service_port = 9000
            proxy_port = 9000
            request_timeout_ms = 0
            "#,
        )
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("sidecar.proxy_port"));
        assert!(msg.contains("sidecar.request_timeout_ms"));
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        let err = parse_config("[sidecar\nservice_port = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/mesh.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn bundled_config_loads() {
        let config = load_config(&Path::new(env!("CARGO_MANIFEST_DIR")).join("mesh.toml")).unwrap();
        assert_eq!(config.sidecar.service_name, "user-service");
        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.policies[0].active_canary().map(|c| c.current_weight), Some(10));
    }
}
