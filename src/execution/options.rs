//! Builder for a single engine run.
//!
//! [`RunOptions`] accumulates arguments, environment, mounts and behaviour
//! flags into a [`RunConfiguration`]. Each `with_*` step only reads state set
//! by earlier steps. Positional arguments and engine flags are kept apart
//! until [`RunOptions::build`], so `with_args` never discards a flag added
//! before it.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::PackageManager;
use crate::context::RunContext;
use crate::execution::output::OutputTrigger;
use crate::execution::volumes::{MountSlot, VolumeSet};

/// An environment variable passed to the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Boolean engine switches appended to the container command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFlag {
    IgnoreDefaultRules,
    SkipDependencyDownload,
    DisableDeduplication,
    EnableBetaLanguage,
    DisableRuntimeSemantics,
    DisableThisFiltering,
    DisableFlowSeparation,
    Disable2ndLevelClosure,
    GenerateUnresolvedReport,
    TestOutput,
    Upload,
    SkipUpload,
}

impl EngineFlag {
    pub fn as_arg(&self) -> &'static str {
        match self {
            EngineFlag::IgnoreDefaultRules => "-i",
            EngineFlag::SkipDependencyDownload => "-sdd",
            EngineFlag::DisableDeduplication => "-dd",
            EngineFlag::EnableBetaLanguage => "--enablejs",
            EngineFlag::DisableRuntimeSemantics => "-drs",
            EngineFlag::DisableThisFiltering => "-dtf",
            EngineFlag::DisableFlowSeparation => "-dfsde",
            EngineFlag::Disable2ndLevelClosure => "-d2lc",
            EngineFlag::GenerateUnresolvedReport => "-ur",
            EngineFlag::TestOutput => "-tout",
            EngineFlag::Upload => "--upload",
            EngineFlag::SkipUpload => "--skip-upload",
        }
    }
}

/// Everything needed to create and drive one engine container.
#[derive(Debug, Clone, Default)]
pub struct RunConfiguration {
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Container command. Starts with the source code container path.
    pub args: Vec<String>,
    /// Container environment. Keys are never empty.
    pub environment: BTreeMap<String, String>,
    /// Enabled bind mounts.
    pub volumes: VolumeSet,
    pub pull_latest_image: bool,
    /// Echo container output to the terminal.
    pub attach_output: bool,
    pub setup_interrupt: bool,
    /// Forward the terminal's stdin to the container.
    pub forward_stdin: bool,
    /// Lines containing any of these open the URL they carry.
    pub browser_triggers: Option<Vec<String>>,
    /// Lines containing any of these abort the run.
    pub exit_triggers: Option<Vec<String>>,
    /// Additional caller-defined triggers.
    pub output_triggers: Vec<OutputTrigger>,
}

impl RunConfiguration {
    /// Environment as `KEY=VALUE` strings.
    pub fn env_strings(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    /// Whether any output trigger is configured.
    pub fn has_triggers(&self) -> bool {
        self.browser_triggers.is_some()
            || self.exit_triggers.is_some()
            || !self.output_triggers.is_empty()
    }

    /// Whether the container output stream must be attached.
    pub fn needs_attach(&self) -> bool {
        self.attach_output || self.has_triggers()
    }
}

/// Builder producing a [`RunConfiguration`].
///
/// # Example
///
/// ```ignore
/// let config = RunOptions::new(&context)
///     .with_args(vec![context.app.container.source_code_path.clone()])
///     .with_source_volume("/repo")
///     .with_ignore_default_rules(true)
///     .with_interrupt()
///     .build();
/// ```
pub struct RunOptions<'a> {
    context: &'a RunContext,
    config: RunConfiguration,
    flags: Vec<String>,
}

impl<'a> RunOptions<'a> {
    pub fn new(context: &'a RunContext) -> Self {
        Self {
            context,
            config: RunConfiguration::default(),
            flags: Vec::new(),
        }
    }

    pub fn with_latest_image(mut self, pull: bool) -> Self {
        self.config.pull_latest_image = pull;
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.config.entrypoint = Some(entrypoint);
        self
    }

    /// Sets the positional arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.config.args = args;
        self
    }

    fn with_volume(mut self, slot: MountSlot, host_path: impl AsRef<Path>) -> Self {
        self.config
            .volumes
            .enable(slot, host_path, &self.context.app.container);
        self
    }

    pub fn with_user_key_volume(self, host_path: impl AsRef<Path>) -> Self {
        self.with_volume(MountSlot::UserKey, host_path)
    }

    pub fn with_docker_key_volume(self, host_path: impl AsRef<Path>) -> Self {
        self.with_volume(MountSlot::DockerKey, host_path)
    }

    pub fn with_user_config_volume(self, host_path: impl AsRef<Path>) -> Self {
        self.with_volume(MountSlot::UserConfig, host_path)
    }

    pub fn with_source_volume(self, host_path: impl AsRef<Path>) -> Self {
        self.with_volume(MountSlot::SourceCode, host_path)
    }

    /// Mounts user rules and points the engine at them.
    ///
    /// An empty path is ignored entirely.
    pub fn with_external_rules_volume(mut self, host_path: impl AsRef<Path>) -> Self {
        let host_path = host_path.as_ref();
        if host_path.as_os_str().is_empty() {
            return self;
        }

        self = self.with_volume(MountSlot::ExternalRules, host_path);
        let flag = "-ec".to_string();
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
            self.flags
                .push(self.context.app.container.external_rules_path.clone());
        }
        self
    }

    /// Passes the internal rules location to the engine.
    pub fn with_internal_rules(mut self) -> Self {
        self.flags.push("-ic".to_string());
        self.flags
            .push(self.context.app.container.internal_rules_path.clone());
        self
    }

    /// Mounts every package manager cache that can be resolved.
    ///
    /// Unresolvable caches are skipped with a warning.
    pub fn with_package_cache_volumes(mut self) -> Self {
        for manager in PackageManager::ALL {
            let resolved = self.context.app.package_cache_directory(manager);
            match resolved {
                Ok(host_path) => {
                    self = self.with_volume(MountSlot::PackageCache(manager), host_path);
                }
                Err(e) => {
                    let message = format!(
                        "Could not get package cache directory for pkg {manager}. skipping volume mount: {e}"
                    );
                    tracing::warn!("{message}");
                    self.context.telemetry.record_array("warning", message);
                }
            }
        }
        self
    }

    /// Appends `flag` when `enabled`.
    pub fn with_engine_flag(mut self, flag: EngineFlag, enabled: bool) -> Self {
        let arg = flag.as_arg().to_string();
        if enabled && !self.flags.contains(&arg) {
            self.flags.push(arg);
        }
        self
    }

    pub fn with_ignore_default_rules(self, enabled: bool) -> Self {
        self.with_engine_flag(EngineFlag::IgnoreDefaultRules, enabled)
    }

    pub fn with_skip_dependency_download(self, enabled: bool) -> Self {
        self.with_engine_flag(EngineFlag::SkipDependencyDownload, enabled)
    }

    pub fn with_disabled_deduplication(self, enabled: bool) -> Self {
        self.with_engine_flag(EngineFlag::DisableDeduplication, enabled)
    }

    /// Sets the container environment, dropping entries with empty keys.
    pub fn with_environment(mut self, vars: Vec<EnvVar>) -> Self {
        if vars.is_empty() {
            return self;
        }

        self.config.environment = vars
            .into_iter()
            .filter(|var| !var.key.is_empty())
            .map(|var| (var.key, var.value))
            .collect();
        self.context
            .telemetry
            .record_atomic("env", format!("{:?}", self.config.env_strings()));
        self
    }

    pub fn with_interrupt(mut self) -> Self {
        self.config.setup_interrupt = true;
        self
    }

    pub fn with_attached_output(mut self) -> Self {
        self.config.attach_output = true;
        self
    }

    pub fn with_forwarded_stdin(mut self) -> Self {
        self.config.forward_stdin = true;
        self
    }

    /// Opens the URL found on lines containing any of `patterns`.
    pub fn with_auto_browser_on(mut self, patterns: Vec<String>) -> Self {
        self.config.browser_triggers = Some(patterns);
        self
    }

    /// Aborts the run when a line contains any of `patterns`.
    pub fn with_exit_on_error(mut self, patterns: Vec<String>) -> Self {
        self.config.exit_triggers = Some(patterns);
        self
    }

    pub fn with_output_trigger(mut self, trigger: OutputTrigger) -> Self {
        self.config.output_triggers.push(trigger);
        self
    }

    /// Attaches output and enables the engine's debug log configuration.
    pub fn with_debug(mut self, debug: bool) -> Self {
        if debug {
            self.config.attach_output = true;
            self.flags.push(format!(
                "-Dlog4j2.configurationFile={}",
                self.context.app.container.log_config_path
            ));
        }
        self
    }

    pub fn build(self) -> RunConfiguration {
        let mut config = self.config;
        config.args.extend(self.flags);
        config
    }
}
