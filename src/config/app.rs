//! Application configuration for the launcher.
//!
//! This module resolves the host-side locations the CLI works with (user
//! configuration, user key, cache directories), the remote endpoints it talks
//! to, and the fixed container-side paths the engine image expects.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::utils::parse_bool_flag;

/// Default image tag used by release builds and developer builds alike.
const DEFAULT_IMAGE_TAG: &str = "niagara-dev";

/// Host serving the telemetry endpoint.
const TELEMETRY_HOST: &str = "t.cli.privado.ai";

/// Marker printed by the engine right before the results URL.
pub const RESULTS_URL_MARKER: &str = "> Continue to view results on:";

/// Package managers whose dependency caches are shared with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PackageManager {
    /// Maven (`~/.m2`).
    Maven,
    /// Gradle (`~/.gradle`).
    Gradle,
}

impl PackageManager {
    /// All package managers with a cache mount.
    pub const ALL: [PackageManager; 2] = [PackageManager::Maven, PackageManager::Gradle];

    /// Short name used in logs and warnings.
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Maven => "m2",
            PackageManager::Gradle => "gradle",
        }
    }

    /// Name of the cache directory under a home or cache root.
    pub fn directory_name(&self) -> &'static str {
        match self {
            PackageManager::Maven => ".m2",
            PackageManager::Gradle => ".gradle",
        }
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container-side settings: the engine image and the fixed paths it mounts.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Fully qualified engine image reference.
    pub image_url: String,
    /// Image environment variable carrying the docker access key.
    pub docker_access_key_env: String,
    /// Mount target for the user key file.
    pub user_key_path: String,
    /// Mount target for the docker access key file.
    pub docker_key_path: String,
    /// Mount target for the user configuration file.
    pub user_config_path: String,
    /// Log configuration file shipped inside the image.
    pub log_config_path: String,
    /// Mount target for the scanned source code.
    pub source_code_path: String,
    /// Default rules shipped inside the image.
    pub internal_rules_path: String,
    /// Mount target for user-supplied rules.
    pub external_rules_path: String,
    /// Mount target for the Maven cache.
    pub m2_package_cache_path: String,
    /// Mount target for the Gradle cache.
    pub gradle_package_cache_path: String,
    /// Engine binary used as entrypoint for `upload` and `validate`.
    pub core_bin_path: String,
    /// Output markers announcing the results URL.
    pub results_url_markers: Vec<String>,
    /// Output markers that abort the run. Empty disables the check.
    pub error_markers: Vec<String>,
}

impl ContainerSettings {
    /// Creates the container settings for the given image tag.
    pub fn for_tag(image_tag: &str) -> Self {
        Self {
            image_url: format!("public.ecr.aws/privado/cli:{image_tag}"),
            docker_access_key_env: "PRIVADO_DOCKER_ACCESS_KEY".to_string(),
            user_key_path: "/app/keys/user.key".to_string(),
            docker_key_path: "/app/keys/docker.key".to_string(),
            user_config_path: "/app/config/config.json".to_string(),
            log_config_path: "/app/config/log4j2.xml".to_string(),
            source_code_path: "/app/code".to_string(),
            internal_rules_path: "/app/rules".to_string(),
            external_rules_path: "/app/external-rules".to_string(),
            m2_package_cache_path: "/root/.m2".to_string(),
            gradle_package_cache_path: "/root/.gradle".to_string(),
            core_bin_path: "/app/privado-core/bin/privado-core".to_string(),
            results_url_markers: vec![RESULTS_URL_MARKER.to_string()],
            error_markers: Vec::new(),
        }
    }

    /// Mount target for a package manager's cache.
    pub fn package_cache_path(&self, manager: PackageManager) -> &str {
        match manager {
            PackageManager::Maven => &self.m2_package_cache_path,
            PackageManager::Gradle => &self.gradle_package_cache_path,
        }
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self::for_tag(DEFAULT_IMAGE_TAG)
    }
}

/// Process-wide application configuration.
///
/// Created once at startup and read-only afterwards; shared through
/// [`crate::RunContext`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// User home directory.
    pub home_directory: PathBuf,
    /// `~/.privado`.
    pub configuration_directory: PathBuf,
    /// Privado cache directory, if one exists or could be created.
    pub cache_directory: Option<PathBuf>,
    /// `~/.privado/config.json`.
    pub user_configuration_file_path: PathBuf,
    /// `~/.privado/keys`.
    pub user_key_directory: PathBuf,
    /// `~/.privado/keys/user.key`.
    pub user_key_path: PathBuf,
    /// Location of scan results relative to the scanned repository.
    pub privacy_results_path_suffix: PathBuf,
    /// Public repository (issue tracker and documentation).
    pub repository_url: String,
    /// `owner/name` of the public repository, used for releases.
    pub repository_name: String,
    /// Base URL of the GitHub API.
    pub github_api_host: String,
    /// Endpoint receiving telemetry events.
    pub telemetry_endpoint: String,
    /// Pause inserted between user-facing status messages.
    pub slowdown_time: Duration,
    /// Environment variable overriding the CI user identifier.
    pub ci_user_identifier_env_key: String,
    /// Container-side settings.
    pub container: ContainerSettings,
}

impl AppConfig {
    /// Creates a configuration rooted at `home`, without touching the filesystem.
    pub fn for_home(home: impl Into<PathBuf>, image_tag: &str) -> Self {
        let home_directory = home.into();
        let configuration_directory = home_directory.join(".privado");
        let user_key_directory = configuration_directory.join("keys");

        Self {
            user_configuration_file_path: configuration_directory.join("config.json"),
            user_key_path: user_key_directory.join("user.key"),
            user_key_directory,
            configuration_directory,
            home_directory,
            cache_directory: None,
            privacy_results_path_suffix: Path::new(".privado").join("privado.json"),
            repository_url: "https://github.com/Privado-Inc/privado-cli".to_string(),
            repository_name: "Privado-Inc/privado-cli".to_string(),
            github_api_host: "https://api.github.com".to_string(),
            telemetry_endpoint: format!("https://{TELEMETRY_HOST}/api/event?version=2"),
            slowdown_time: Duration::from_millis(600),
            ci_user_identifier_env_key: "PRIVADO_USER_IDENTIFIER".to_string(),
            container: ContainerSettings::for_tag(image_tag),
        }
    }

    /// Creates configuration from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `PRIVADO_DEV`: enables developer settings
    /// - `PRIVADO_TAG`: image tag to use in developer mode (default: niagara-dev)
    /// - `PRIVADO_ERROR_MARKERS`: comma-separated output markers that abort a run
    ///
    /// A binary running from the system temp directory is treated as a
    /// developer build as well.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeDirectoryUnavailable)?;

        let mut is_dev = std::env::var("PRIVADO_DEV")
            .ok()
            .and_then(|v| parse_bool_flag(&v))
            .unwrap_or(false);
        if let Some(program) = std::env::args().next() {
            if Path::new(&program).starts_with(std::env::temp_dir()) {
                is_dev = true;
            }
        }

        let image_tag = if is_dev {
            std::env::var("PRIVADO_TAG")
                .ok()
                .filter(|tag| !tag.is_empty())
                .unwrap_or_else(|| DEFAULT_IMAGE_TAG.to_string())
        } else {
            DEFAULT_IMAGE_TAG.to_string()
        };

        let mut config = Self::for_home(home, &image_tag);
        if let Ok(markers) = std::env::var("PRIVADO_ERROR_MARKERS") {
            config.container.error_markers = markers
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }

        config.cache_directory = match config.init_cache_directory() {
            Ok(dir) => Some(dir),
            Err(e) => {
                tracing::warn!(error = %e, "Could not initialize privado cache directory");
                None
            }
        };

        Ok(config)
    }

    /// Returns the existing cache directory, creating one if none exists.
    pub fn init_cache_directory(&self) -> Result<PathBuf, ConfigError> {
        match self.existing_cache_directory() {
            Some(dir) => Ok(dir),
            None => self.create_cache_directory(),
        }
    }

    /// The fallback location is checked first so a previously created
    /// fallback keeps being used.
    fn existing_cache_directory(&self) -> Option<PathBuf> {
        let fallback = self.configuration_directory.join(".cache");
        if fallback.is_dir() {
            return Some(fallback);
        }

        dirs::cache_dir()
            .map(|dir| dir.join("privado"))
            .filter(|dir| dir.is_dir())
    }

    fn create_cache_directory(&self) -> Result<PathBuf, ConfigError> {
        let location = match dirs::cache_dir() {
            Some(system_cache) => system_cache.join("privado"),
            None => self.configuration_directory.join(".cache"),
        };
        fs::create_dir_all(&location)?;
        Ok(location)
    }

    /// Resolves the host directory to mount as `manager`'s package cache.
    ///
    /// Resolution order: an existing directory inside the privado cache, then
    /// the user's default location (`~/.m2`, `~/.gradle`), then a freshly
    /// created directory inside the privado cache.
    pub fn package_cache_directory(&self, manager: PackageManager) -> Result<PathBuf, ConfigError> {
        let unavailable = |reason: String| ConfigError::PackageCacheUnavailable {
            manager: manager.to_string(),
            reason,
        };
        let directory_name = manager.directory_name();

        if let Some(cache) = &self.cache_directory {
            let candidate = cache.join(directory_name);
            if candidate.try_exists().map_err(|e| unavailable(e.to_string()))? {
                return Ok(candidate);
            }
        }

        let default_location = self.home_directory.join(directory_name);
        if default_location
            .try_exists()
            .map_err(|e| unavailable(e.to_string()))?
        {
            return Ok(default_location);
        }

        let cache = match &self.cache_directory {
            Some(cache) => cache.clone(),
            None => self
                .create_cache_directory()
                .map_err(|e| unavailable(e.to_string()))?,
        };
        let location = cache.join(directory_name);
        fs::create_dir_all(&location).map_err(|e| unavailable(e.to_string()))?;

        Ok(location)
    }

    /// Path to existing scan results for `repository`.
    pub fn results_path(&self, repository: &Path) -> PathBuf {
        repository.join(&self.privacy_results_path_suffix)
    }

    /// Name of the release asset for the running platform.
    pub fn release_filename(&self) -> String {
        format!("privado-{}.tar.gz", platform_name())
    }
}

/// `<os>-<arch>` of the running binary, as used in release names.
pub fn platform_name() -> String {
    format!(
        "{}-{}",
        release_os_name(std::env::consts::OS),
        release_arch_name(std::env::consts::ARCH)
    )
}

/// Maps Rust target OS names to the names used in release asset files.
fn release_os_name(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

/// Maps Rust target architecture names to the names used in release asset files.
fn release_arch_name(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}
