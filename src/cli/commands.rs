//! CLI command definitions for privado.
//!
//! Every engine-backed command follows the same path: bootstrap identity and
//! configuration, print any pending update notice, fetch the docker access
//! key from the engine image, run the image with the command's options and
//! finally post the recorded telemetry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tracing::{debug, warn};

use crate::auth;
use crate::ci::CiSession;
use crate::config::{platform_name, AppConfig, UserConfigFile, UserSession};
use crate::context::RunContext;
use crate::execution::{
    ContainerRuntime, DockerClient, EngineFlag, EnvVar, ImageRunner, RunConfiguration, RunOptions,
};
use crate::telemetry::{Telemetry, TelemetryRequest};
use crate::utils::{confirm, env_bool};
use crate::VERSION;

use super::self_update;

/// Privado launcher.
#[derive(Parser)]
#[command(name = "privado")]
#[command(version = VERSION)]
#[command(
    about = "Privado is a CLI tool that scans & monitors your repositories to build privacy, transparency reports & finds privacy issues"
)]
#[command(
    long_about = "Privado is a CLI tool that scans & monitors your repositories to build privacy, transparency reports & finds privacy issues.\nFind more at: https://github.com/Privado-Inc/privado"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Scan a codebase or repository to identify privacy issues and generate compliance reports.
    Scan(ScanArgs),

    /// Sync the results with the privado.ai Cloud Dashboard.
    Upload(UploadArgs),

    /// Validate rule structure for custom rules.
    Validate(ValidateArgs),

    /// Check for latest release and update to the latest version Privado CLI.
    Update,

    /// Print the current version of Privado CLI.
    Version,

    /// Manage Privado CLI preferences.
    Config(ConfigArgs),
}

/// Arguments for `privado scan`.
#[derive(Parser, Debug, Clone, Default)]
pub struct ScanArgs {
    /// Repository to scan.
    pub repository: PathBuf,

    /// Config (with rules) directory merged with the default Privado rules.
    #[arg(short = 'c', long = "config", value_name = "DIR")]
    pub config: Option<PathBuf>,

    /// Ignore the default rules and only use the rules given with `--config`.
    #[arg(short = 'i', long)]
    pub ignore_default_rules: bool,

    /// Skip downloading locally unavailable dependencies. Can yield incomplete results.
    #[arg(long)]
    pub skip_dependency_download: bool,

    /// Keep duplicate and subset dataflows in the results.
    #[arg(long)]
    pub disable_deduplication: bool,

    /// Upload the scan result to the Privado Dashboard.
    #[arg(long, conflicts_with = "skip_upload")]
    pub upload: bool,

    /// Never upload the result artifacts to the Privado Dashboard.
    #[arg(long)]
    pub skip_upload: bool,

    /// Overwrite existing results without asking.
    #[arg(long)]
    pub overwrite: bool,

    /// Run the engine in debug mode.
    #[arg(long)]
    pub debug: bool,

    /// JVM arguments for the scan engine (sets JAVA_TOOL_OPTIONS).
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    pub jvm_args: Option<String>,

    /// Enable experimental features.
    #[arg(long)]
    pub enable_experiments: bool,

    /// Experimental: enable the beta javascript scanner.
    #[arg(long)]
    pub enable_javascript: bool,

    /// Experimental: do not generate semantics at runtime.
    #[arg(long)]
    pub disable_runtime_semantics: bool,

    /// Experimental: skip the 'this filtering' flow algorithm.
    #[arg(long)]
    pub disable_this_filtering: bool,

    /// Experimental: skip flow separation by data element.
    #[arg(long)]
    pub disable_flow_separation_by_data_element: bool,

    /// Experimental: turn on 2nd level source derivation.
    #[arg(long = "disable-2nd-level-closure")]
    pub disable_2nd_level_closure: bool,

    /// Generate unresolved method name reports.
    #[arg(long)]
    pub generate_unresolved_name_report: bool,

    /// Generate unfiltered flow output.
    #[arg(long)]
    pub test_output: bool,
}

impl ScanArgs {
    fn uses_experiments(&self) -> bool {
        self.enable_javascript
            || self.disable_runtime_semantics
            || self.disable_this_filtering
            || self.disable_flow_separation_by_data_element
            || self.disable_2nd_level_closure
    }
}

/// Arguments for `privado upload`.
#[derive(Parser, Debug, Clone)]
pub struct UploadArgs {
    /// Repository holding scan results.
    pub repository: PathBuf,

    /// Run the engine in debug mode.
    #[arg(long)]
    pub debug: bool,
}

/// Arguments for `privado validate`.
#[derive(Parser, Debug, Clone)]
pub struct ValidateArgs {
    /// Directory with the custom rules.
    pub rules_directory: PathBuf,

    /// Run the engine in debug mode.
    #[arg(long)]
    pub debug: bool,
}

/// Arguments for `privado config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigCommand {
    /// List, enable, or disable telemetry for Privado CLI.
    Metrics(MetricsArgs),
}

#[derive(Parser, Debug)]
pub struct MetricsArgs {
    /// Enable telemetry events and performance metrics.
    #[arg(long, conflicts_with = "disable")]
    pub enable: bool,

    /// Disable telemetry events and performance metrics.
    #[arg(long)]
    pub disable: bool,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
///
/// Errors are recorded in telemetry before it is posted, then returned.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut launcher = Launcher::bootstrap()?;
    let result = launcher.dispatch(cli.command).await;

    if let Err(e) = &result {
        launcher.context.telemetry.record_array("error", format!("{e:#}"));
    }
    launcher.post_telemetry().await;

    result
}

/// Per-invocation state shared by all commands.
struct Launcher {
    context: RunContext,
    ci: CiSession,
    session: UserSession,
    http: reqwest::Client,
}

impl Launcher {
    fn bootstrap() -> anyhow::Result<Self> {
        let app = AppConfig::from_env().context("Failed to load configuration")?;
        let ci = CiSession::detect(&app.ci_user_identifier_env_key);

        auth::bootstrap_user_key(&app.user_key_path, &ci)
            .context("Failed to bootstrap user key")?;
        let config_file = UserConfigFile::bootstrap(&app.user_configuration_file_path)?;
        let user_hash = auth::user_hash(&app.user_key_path)?;
        let session = UserSession::new(config_file, user_hash);

        let http = self_update::http_client(VERSION)?;
        let context = RunContext::new(app, Telemetry::new());

        debug!(session_id = %session.session_id, ci = ci.is_ci, "Launcher ready");
        Ok(Self {
            context,
            ci,
            session,
            http,
        })
    }

    fn app(&self) -> &AppConfig {
        &self.context.app
    }

    async fn dispatch(&mut self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Scan(args) => self.scan(args).await,
            Commands::Upload(args) => self.upload(args).await,
            Commands::Validate(args) => self.validate(args).await,
            Commands::Update => self.update().await,
            Commands::Version => {
                self.version(true).await;
                Ok(())
            }
            Commands::Config(args) => match args.command {
                ConfigCommand::Metrics(args) => self.config_metrics(&args),
            },
        }
    }

    fn record_pre_run(&self, include_ci: bool) {
        let telemetry = &self.context.telemetry;
        telemetry.record_atomic("version", VERSION);
        telemetry.record_atomic("cmd", std::env::args().collect::<Vec<_>>().join(" "));
        if include_ci {
            telemetry.record_atomic("ci", self.ci.is_ci);
            if let Some(provider) = self.ci.provider_name() {
                telemetry.record_atomic("ciProvider", provider);
            }
        }
    }

    async fn update_notice(&self) -> Option<self_update::UpdateNotice> {
        match self_update::check_for_update(&self.http, self.app(), VERSION).await {
            Ok(notice) => notice,
            Err(e) => {
                debug!(error = %e, "Update check failed");
                None
            }
        }
    }

    async fn print_update_notice(&self) {
        let Some(notice) = self.update_notice().await else {
            return;
        };
        let pause = self.app().slowdown_time;
        println!("{}", notice.message);
        tokio::time::sleep(pause).await;
        println!("To use the latest version of Privado CLI, run `privado update`");
        tokio::time::sleep(pause).await;
        println!();
    }

    async fn docker_runtime(&self) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
        let client = DockerClient::new()?;
        client.ping().await.with_context(|| {
            format!(
                "Cannot reach the Docker daemon. Make sure Docker is running.\nFor more information, visit {}",
                self.app().repository_url
            )
        })?;
        Ok(Arc::new(client))
    }

    /// Pulls the engine image and stores the hash of its access key.
    async fn load_docker_access_hash(
        &mut self,
        runtime: &Arc<dyn ContainerRuntime>,
    ) -> anyhow::Result<()> {
        let key = ImageRunner::new(runtime.clone(), self.context.clone())
            .docker_access_key(true)
            .await
            .map_err(|e| {
                anyhow!(
                    "Cannot fetch docker access key: {e} \nPlease try again or raise an issue at {}",
                    self.app().repository_url
                )
            })?;
        self.session.docker_access_hash = Some(auth::sha256_hex(&key)?);
        Ok(())
    }

    async fn run_engine(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
        config: RunConfiguration,
    ) -> anyhow::Result<()> {
        let outcome = ImageRunner::new(runtime, self.context.clone())
            .run(config)
            .await
            .map_err(|e| {
                anyhow!(
                    "Received error: {e}\nPlease try again or raise an issue at {}",
                    self.app().repository_url
                )
            })?;

        match outcome.exit_code {
            Some(0) | None => {}
            Some(code) => warn!(code, "Engine container exited with a non-zero status"),
        }
        Ok(())
    }

    async fn scan(&mut self, args: ScanArgs) -> anyhow::Result<()> {
        self.record_pre_run(true);

        let external_rules = match &args.config {
            Some(path) => Some(existing_directory(path).ok_or_else(|| {
                anyhow!(
                    "Could not validate the config directory: {}",
                    absolute(path).display()
                )
            })?),
            None => None,
        };

        if args.ignore_default_rules && external_rules.is_none() {
            bail!(
                "Default rules cannot be ignored without any external config.\n\
                 You can specify your own rules and config using the `-c or --config` option.\n\n\
                 For more info, run: 'privado help'"
            );
        }

        self.print_update_notice().await;

        let repository = absolute(&args.repository);
        if !args.overwrite {
            let results = self.app().results_path(&repository);
            if results.exists() {
                println!(
                    "> Scan report already exists ({})",
                    self.app().privacy_results_path_suffix.display()
                );
                println!("\n> Rescan will overwrite existing results");
                if !confirm("Continue?")? {
                    println!("Terminating..");
                    return Ok(());
                }
                println!();
            }
        }

        if !args.enable_experiments && args.uses_experiments() {
            bail!(
                "Experimental features cannot be used without the `--enable-experiments` flag.\n\n\
                 For more info, run: 'privado help'"
            );
        }

        println!("> Scanning directory: {}", repository.display());

        let runtime = self.docker_runtime().await?;
        self.load_docker_access_hash(&runtime).await?;

        let config = scan_configuration(
            &self.context,
            &self.ci,
            &self.session,
            &args,
            &repository,
            external_rules.as_deref(),
        );
        self.run_engine(runtime, config).await
    }

    async fn upload(&mut self, args: UploadArgs) -> anyhow::Result<()> {
        self.record_pre_run(false);
        self.print_update_notice().await;

        let repository = absolute(&args.repository);
        if !self.app().results_path(&repository).exists() {
            bail!(
                "> Cannot find scan results in the specified directory ({})\n\
                 > Run 'privado scan <dir>' instead. Run 'privado help' for more information.",
                self.app().privacy_results_path_suffix.display()
            );
        }

        let runtime = self.docker_runtime().await?;
        self.load_docker_access_hash(&runtime).await?;

        let config = upload_configuration(&self.context, &self.session, &args, &repository);
        self.run_engine(runtime, config).await
    }

    async fn validate(&mut self, args: ValidateArgs) -> anyhow::Result<()> {
        self.record_pre_run(true);
        self.print_update_notice().await;

        let rules = absolute(&args.rules_directory);
        println!("> Validating rules for the directory: {}", rules.display());
        tokio::time::sleep(self.app().slowdown_time).await;

        if !rules.exists() {
            bail!(
                "Cannot find the rules directory on disk\n\
                 Use correct path for running Privado rule validation\n\
                 Run 'privado scan <dir>' for scanning without custom rules"
            );
        }

        let runtime = self.docker_runtime().await?;
        self.load_docker_access_hash(&runtime).await?;

        let config = validate_configuration(
            &self.context,
            &self.ci,
            &self.session,
            &rules,
            args.debug,
        );
        let result = self.run_engine(runtime, config).await;
        tokio::time::sleep(self.app().slowdown_time).await;
        result
    }

    async fn version(&self, details: bool) {
        println!("{}", version_line(VERSION));
        if !details {
            return;
        }

        let pause = self.app().slowdown_time;
        if let Some(notice) = self.update_notice().await {
            println!();
            println!("{}", notice.message);
            tokio::time::sleep(pause).await;
            println!("To use the latest version of Privado CLI, run `privado update`");
            println!();
        }

        tokio::time::sleep(pause).await;
        println!("For more information, visit {}", self.app().repository_url);
    }

    async fn update(&self) -> anyhow::Result<()> {
        self.version(false).await;
        println!();
        tokio::time::sleep(self.app().slowdown_time).await;
        self_update::run_self_update(self.app(), VERSION).await
    }

    fn config_metrics(&mut self, args: &MetricsArgs) -> anyhow::Result<()> {
        if !args.enable && !args.disable {
            println!(
                "Telemetry for Privado CLI: {}",
                metrics_label(self.session.config_file.metrics_enabled)
            );
            println!("You can use `--enable` or `--disable` flag to update telemetry preferences");
            return Ok(());
        }

        self.session.config_file.metrics_enabled = args.enable;
        self.session
            .config_file
            .save(&self.app().user_configuration_file_path)
            .context("Cannot save configuration file")?;

        println!(
            "Telemetry for Privado CLI: {}",
            metrics_label(self.session.config_file.metrics_enabled)
        );
        Ok(())
    }

    /// Posts telemetry once, if the user allows it and the run got far
    /// enough to know the docker access hash.
    async fn post_telemetry(&self) {
        if !self.session.config_file.metrics_enabled || self.context.telemetry.is_recorded() {
            return;
        }
        let Some(hash) = &self.session.docker_access_hash else {
            return;
        };

        let request = TelemetryRequest {
            url: self.app().telemetry_endpoint.clone(),
            user_hash: self.session.user_hash.clone(),
            session_id: self.session.session_id.to_string(),
            authentication_key_hash: hash.clone(),
        };
        if let Err(e) = self.context.telemetry.post(&self.http, &request).await {
            debug!(error = %e, "Could not post telemetry");
        }
    }
}

fn metrics_label(enabled: bool) -> &'static str {
    if enabled {
        "ENABLED"
    } else {
        "DISABLED"
    }
}

fn version_line(version: &str) -> String {
    let shown = if version == "dev" { "Nightly" } else { version };
    format!("Privado CLI: Version {shown} ({})", platform_name())
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn existing_directory(path: &Path) -> Option<PathBuf> {
    let path = absolute(path);
    path.exists().then_some(path)
}

/// Environment shared by every engine command.
fn session_environment(session: &UserSession) -> Vec<EnvVar> {
    vec![
        EnvVar::new("PRIVADO_VERSION_CLI", VERSION),
        EnvVar::new("PRIVADO_USER_HASH", session.user_hash.clone()),
        EnvVar::new("PRIVADO_SESSION_ID", session.session_id.to_string()),
        EnvVar::new(
            "PRIVADO_SYNC_TO_CLOUD",
            env_bool(session.config_file.sync_to_privado_cloud),
        ),
        EnvVar::new(
            "PRIVADO_METRICS_ENABLED",
            env_bool(session.config_file.metrics_enabled),
        ),
    ]
}

fn with_error_markers<'a>(options: RunOptions<'a>, app: &AppConfig) -> RunOptions<'a> {
    if app.container.error_markers.is_empty() {
        options
    } else {
        options.with_exit_on_error(app.container.error_markers.clone())
    }
}

/// Options for `privado scan`.
///
/// The image was already pulled while reading the access key, so it is not
/// pulled again.
fn scan_configuration(
    context: &RunContext,
    ci: &CiSession,
    session: &UserSession,
    args: &ScanArgs,
    repository: &Path,
    external_rules: Option<&Path>,
) -> RunConfiguration {
    let app = &context.app;

    let mut environment = vec![EnvVar::new("CI", env_bool(ci.is_ci))];
    environment.extend(session_environment(session));
    environment.push(EnvVar::new(
        "PRIVADO_HOST_SCAN_DIR",
        repository.display().to_string(),
    ));
    environment.push(EnvVar::new(
        "JAVA_TOOL_OPTIONS",
        args.jvm_args.clone().unwrap_or_default(),
    ));

    let mut options = RunOptions::new(context)
        .with_latest_image(false)
        .with_args(vec![app.container.source_code_path.clone()])
        .with_internal_rules()
        .with_engine_flag(EngineFlag::Upload, args.upload)
        .with_engine_flag(EngineFlag::SkipUpload, !args.upload && args.skip_upload)
        .with_engine_flag(EngineFlag::EnableBetaLanguage, args.enable_javascript)
        .with_engine_flag(
            EngineFlag::DisableRuntimeSemantics,
            args.disable_runtime_semantics,
        )
        .with_engine_flag(
            EngineFlag::DisableFlowSeparation,
            args.disable_flow_separation_by_data_element,
        )
        .with_engine_flag(EngineFlag::DisableThisFiltering, args.disable_this_filtering)
        .with_engine_flag(
            EngineFlag::Disable2ndLevelClosure,
            args.disable_2nd_level_closure,
        )
        .with_engine_flag(
            EngineFlag::GenerateUnresolvedReport,
            args.generate_unresolved_name_report,
        )
        .with_engine_flag(EngineFlag::TestOutput, args.test_output)
        .with_attached_output()
        .with_forwarded_stdin()
        .with_source_volume(repository)
        .with_user_config_volume(&app.user_configuration_file_path)
        .with_user_key_volume(&app.user_key_path)
        .with_package_cache_volumes();

    if let Some(rules) = external_rules {
        options = options.with_external_rules_volume(rules);
    }

    options = options
        .with_ignore_default_rules(args.ignore_default_rules)
        .with_skip_dependency_download(args.skip_dependency_download)
        .with_disabled_deduplication(args.disable_deduplication)
        .with_debug(args.debug)
        .with_environment(environment)
        .with_auto_browser_on(app.container.results_url_markers.clone())
        .with_interrupt();

    with_error_markers(options, app).build()
}

/// Options for `privado upload`.
fn upload_configuration(
    context: &RunContext,
    session: &UserSession,
    args: &UploadArgs,
    repository: &Path,
) -> RunConfiguration {
    let app = &context.app;

    let mut environment = session_environment(session);
    environment.push(EnvVar::new(
        "PRIVADO_HOST_SCAN_DIR",
        repository.display().to_string(),
    ));

    let options = RunOptions::new(context)
        .with_latest_image(false)
        .with_entrypoint(vec![app.container.core_bin_path.clone(), "upload".to_string()])
        .with_args(vec![app.container.source_code_path.clone()])
        .with_attached_output()
        .with_forwarded_stdin()
        .with_source_volume(repository)
        .with_user_key_volume(&app.user_key_path)
        .with_debug(args.debug)
        .with_environment(environment)
        .with_auto_browser_on(app.container.results_url_markers.clone())
        .with_interrupt();

    with_error_markers(options, app).build()
}

/// Options for `privado validate`. The rules directory is mounted as the
/// source so the engine validates it in place.
fn validate_configuration(
    context: &RunContext,
    ci: &CiSession,
    session: &UserSession,
    rules_directory: &Path,
    debug: bool,
) -> RunConfiguration {
    let app = &context.app;

    let mut environment = vec![EnvVar::new("CI", env_bool(ci.is_ci))];
    environment.extend(session_environment(session));

    let options = RunOptions::new(context)
        .with_latest_image(false)
        .with_entrypoint(vec![
            app.container.core_bin_path.clone(),
            "validate".to_string(),
        ])
        .with_args(vec![app.container.source_code_path.clone()])
        .with_attached_output()
        .with_forwarded_stdin()
        .with_source_volume(rules_directory)
        .with_user_config_volume(&app.user_configuration_file_path)
        .with_user_key_volume(&app.user_key_path)
        .with_auto_browser_on(Vec::new())
        .with_debug(debug)
        .with_environment(environment)
        .with_interrupt();

    with_error_markers(options, app).build()
}
