//! User configuration file and per-invocation user session.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

fn default_metrics_enabled() -> bool {
    true
}

/// Contents of `~/.privado/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfigFile {
    /// Whether anonymous usage metrics may be sent.
    #[serde(rename = "metrics", default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Whether scan results are synced to Privado Cloud.
    #[serde(rename = "syncToPrivadoCloud", default)]
    pub sync_to_privado_cloud: bool,
}

impl Default for UserConfigFile {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            sync_to_privado_cloud: false,
        }
    }
}

impl UserConfigFile {
    /// Loads the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUserConfig {
            path: path.display().to_string(),
            reason,
        };

        let content = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Loads the configuration at `path`, writing defaults first if it is missing.
    pub fn bootstrap(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Creating default user configuration");
            Self::default().save(path)?;
        }
        Self::load(path)
    }
}

/// Identity and preferences resolved for one CLI invocation.
#[derive(Debug, Clone)]
pub struct UserSession {
    /// User configuration file contents.
    pub config_file: UserConfigFile,
    /// Hex SHA-256 of the user key.
    pub user_hash: String,
    /// Hex SHA-256 of the docker access key, once known.
    pub docker_access_hash: Option<String>,
    /// Random identifier of this invocation.
    pub session_id: Uuid,
}

impl UserSession {
    /// Creates a session with a fresh session id.
    pub fn new(config_file: UserConfigFile, user_hash: impl Into<String>) -> Self {
        Self {
            config_file,
            user_hash: user_hash.into(),
            docker_access_hash: None,
            session_id: Uuid::new_v4(),
        }
    }

    /// Records the docker access hash.
    pub fn with_docker_access_hash(mut self, hash: impl Into<String>) -> Self {
        self.docker_access_hash = Some(hash.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bootstrap_creates_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = UserConfigFile::bootstrap(&path).unwrap();

        assert!(path.exists());
        assert!(config.metrics_enabled);
        assert!(!config.sync_to_privado_cloud);
    }

    #[test]
    fn test_load_uses_wire_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"metrics": false, "syncToPrivadoCloud": true}"#).unwrap();

        let config = UserConfigFile::load(&path).unwrap();
        assert!(!config.metrics_enabled);
        assert!(config.sync_to_privado_cloud);
    }

    #[test]
    fn test_load_missing_fields_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{}").unwrap();

        assert_eq!(UserConfigFile::load(&path).unwrap(), UserConfigFile::default());
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();

        let err = UserConfigFile::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUserConfig { .. }));
    }

    #[test]
    fn test_save_roundtrip_preserves_toggle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = UserConfigFile::bootstrap(&path).unwrap();
        config.metrics_enabled = false;
        config.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"metrics\": false"));
        assert!(!UserConfigFile::bootstrap(&path).unwrap().metrics_enabled);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = UserSession::new(UserConfigFile::default(), "hash");
        let b = UserSession::new(UserConfigFile::default(), "hash");
        assert_ne!(a.session_id, b.session_id);
        assert!(a.docker_access_hash.is_none());
        assert_eq!(
            a.with_docker_access_hash("abc").docker_access_hash.as_deref(),
            Some("abc")
        );
    }
}
