//! Named bind-mount slots for the engine container.
//!
//! Each slot maps one host path to a fixed container path. A slot is either
//! absent or enabled with a non-empty host path; enabling and setting the path
//! happen in one step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bollard::models::{Mount, MountTypeEnum};

use crate::config::{ContainerSettings, PackageManager};

/// A named mount slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MountSlot {
    UserKey,
    DockerKey,
    UserConfig,
    SourceCode,
    ExternalRules,
    PackageCache(PackageManager),
}

impl MountSlot {
    /// Container path the slot is mounted at.
    pub fn container_path<'a>(&self, settings: &'a ContainerSettings) -> &'a str {
        match self {
            MountSlot::UserKey => &settings.user_key_path,
            MountSlot::DockerKey => &settings.docker_key_path,
            MountSlot::UserConfig => &settings.user_config_path,
            MountSlot::SourceCode => &settings.source_code_path,
            MountSlot::ExternalRules => &settings.external_rules_path,
            MountSlot::PackageCache(manager) => settings.package_cache_path(*manager),
        }
    }

    /// Key material is never writable from inside the container.
    pub fn is_read_only(&self) -> bool {
        matches!(self, MountSlot::UserKey | MountSlot::DockerKey)
    }
}

impl std::fmt::Display for MountSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountSlot::UserKey => write!(f, "user-key"),
            MountSlot::DockerKey => write!(f, "docker-key"),
            MountSlot::UserConfig => write!(f, "user-config"),
            MountSlot::SourceCode => write!(f, "source-code"),
            MountSlot::ExternalRules => write!(f, "external-rules"),
            MountSlot::PackageCache(manager) => write!(f, "package-cache({manager})"),
        }
    }
}

/// A resolved bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl From<&VolumeMount> for Mount {
    fn from(volume: &VolumeMount) -> Self {
        Mount {
            target: Some(volume.container_path.clone()),
            source: Some(volume.host_path.to_string_lossy().into_owned()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(volume.read_only),
            ..Default::default()
        }
    }
}

/// The set of enabled mount slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSet {
    mounts: BTreeMap<MountSlot, VolumeMount>,
}

impl VolumeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables `slot` with `host_path`.
    ///
    /// An empty host path leaves the slot untouched and returns `false`.
    pub fn enable(
        &mut self,
        slot: MountSlot,
        host_path: impl AsRef<Path>,
        settings: &ContainerSettings,
    ) -> bool {
        let host_path = host_path.as_ref();
        if host_path.as_os_str().is_empty() {
            tracing::warn!(%slot, "Skipping volume with empty host path");
            return false;
        }

        self.mounts.insert(
            slot,
            VolumeMount {
                host_path: host_path.to_path_buf(),
                container_path: slot.container_path(settings).to_string(),
                read_only: slot.is_read_only(),
            },
        );
        true
    }

    pub fn disable(&mut self, slot: MountSlot) {
        self.mounts.remove(&slot);
    }

    pub fn is_enabled(&self, slot: MountSlot) -> bool {
        self.mounts.contains_key(&slot)
    }

    pub fn get(&self, slot: MountSlot) -> Option<&VolumeMount> {
        self.mounts.get(&slot)
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Enabled slots in slot order.
    pub fn slots(&self) -> impl Iterator<Item = MountSlot> + '_ {
        self.mounts.keys().copied()
    }

    /// All enabled mounts, in slot order.
    pub fn resolve(&self) -> Vec<VolumeMount> {
        self.mounts.values().cloned().collect()
    }
}
