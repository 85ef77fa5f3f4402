use crate::error::{DalError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Name of the optional settings file inside a data directory.
pub const CONFIG_FILE: &str = "dal.yaml";

/// Settings for opening a datastore. Every field has a default, so an absent
/// or empty `dal.yaml` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DalConfig {
    /// Schema file, relative to the data directory
    pub schema_file: String,
    /// SQLite database file, relative to the data directory
    pub database_file: String,
    pub busy_timeout_ms: u64,
    /// Application value persisted when the database is created
    pub opaque: Value,
    /// Document seeded into the global root when the database is created
    pub initial_root: Option<Value>,
}

impl Default for DalConfig {
    fn default() -> Self {
        DalConfig {
            schema_file: "schema.yaml".into(),
            database_file: "_dal.db".into(),
            busy_timeout_ms: 5000,
            opaque: Value::Null,
            initial_root: None,
        }
    }
}

impl DalConfig {
    /// Load `dal.yaml` from `dir`, falling back to defaults when it is absent.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(DalConfig::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(DalConfig::default());
        }
        let config: DalConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_file.trim().is_empty() {
            return Err(DalError::Config("schema_file must not be empty".into()));
        }
        if self.database_file.trim().is_empty() {
            return Err(DalError::Config("database_file must not be empty".into()));
        }
        if let Some(root) = &self.initial_root {
            if !root.is_object() {
                return Err(DalError::Config(
                    "initial_root must be a mapping of top-level nodes".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_for_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(DalConfig::load(dir.path()).unwrap(), DalConfig::default());

        std::fs::write(dir.path().join(CONFIG_FILE), "\n").unwrap();
        assert_eq!(DalConfig::load(dir.path()).unwrap(), DalConfig::default());
    }

    #[test]
    fn test_parse_partial_config() {
        let config = DalConfig::from_yaml_str(
            r#"
database_file: ztp.db
busy_timeout_ms: 250
opaque:
  mode: "1"
initial_root:
  "ztp:devices": {}
"#,
        )
        .unwrap();
        assert_eq!(config.schema_file, "schema.yaml");
        assert_eq!(config.database_file, "ztp.db");
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));
        assert_eq!(config.opaque, json!({"mode": "1"}));
        assert_eq!(config.initial_root, Some(json!({"ztp:devices": {}})));
    }

    #[test]
    fn test_invalid_configs() {
        for yaml in [
            "database_file: ''",
            "schema_file: '  '",
            "initial_root: [1, 2]",
        ] {
            assert!(
                matches!(DalConfig::from_yaml_str(yaml), Err(DalError::Config(_))),
                "{yaml}"
            );
        }
        assert!(matches!(
            DalConfig::from_yaml_str("busy_timeout_ms: soon"),
            Err(DalError::Yaml(_))
        ));
    }
}
