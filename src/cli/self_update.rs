//! Update check and self-update for the privado binary.
//!
//! Releases are looked up on GitHub. Installing a release downloads the
//! platform archive, extracts it into a temporary directory and swaps it in
//! for the running executable, restoring the previous binary if the swap
//! fails.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AppConfig;

const RELEASE_DOWNLOAD_HOST: &str = "https://github.com";
const BINARY_NAME: &str = "privado";

/// Latest release as reported by the GitHub API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub published_at: String,
}

/// A newer release than the running one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNotice {
    pub tag: String,
    pub message: String,
}

/// HTTP client used for release lookups and downloads.
pub fn http_client(current_version: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("privado-cli/{current_version}"))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")
}

/// Fetches the latest release, or `None` when GitHub does not answer with 200.
pub async fn latest_release(
    client: &reqwest::Client,
    app: &AppConfig,
) -> Result<Option<GitHubRelease>> {
    let url = format!(
        "{}/repos/{}/releases/latest",
        app.github_api_host, app.repository_name
    );
    let response = client
        .get(&url)
        .header("Accept", "application/vnd.github.v3+json")
        .send()
        .await
        .context("Failed to check for updates")?;

    if response.status() != reqwest::StatusCode::OK {
        debug!(status = %response.status(), "No release information available");
        return Ok(None);
    }

    let release = response
        .json::<GitHubRelease>()
        .await
        .context("Failed to parse GitHub release response")?;
    Ok(Some(release))
}

/// Whether `latest_tag` is a strictly newer semantic version than `current`.
///
/// Either side may carry a leading `v`. Unparseable versions never compare
/// as newer.
pub fn is_newer_version(latest_tag: &str, current: &str) -> bool {
    let parse = |v: &str| semver::Version::parse(v.trim().trim_start_matches('v')).ok();
    match (parse(latest_tag), parse(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => false,
    }
}

/// Whole days between `published_at` (RFC 3339) and `now`, rounded to nearest.
pub fn days_since(published_at: &str, now: DateTime<Utc>) -> Option<i64> {
    let published = DateTime::parse_from_rfc3339(published_at).ok()?;
    let elapsed = now.signed_duration_since(published.with_timezone(&Utc));
    Some((elapsed.num_seconds() as f64 / 86_400.0).round() as i64)
}

pub fn release_age(days: i64) -> String {
    match days {
        d if d < 1 => "Released today".to_string(),
        1 => "Released yesterday".to_string(),
        d => format!("Released {d} days ago"),
    }
}

/// Message announcing `release`, with its age when the publish date parses.
pub fn update_message(release: &GitHubRelease, now: DateTime<Utc>) -> String {
    match days_since(&release.published_at, now) {
        Some(days) => format!(
            "New release found: {} ({})",
            release.tag_name,
            release_age(days)
        ),
        None => format!("New release found: {}\n", release.tag_name),
    }
}

/// Decides whether `release` is an update for `current_version`.
///
/// Development builds never update. Releases missing a tag or publish date
/// are ignored.
pub fn evaluate_release(
    release: &GitHubRelease,
    current_version: &str,
    now: DateTime<Utc>,
) -> Option<UpdateNotice> {
    if current_version == "dev" {
        return None;
    }
    if release.tag_name.is_empty() || release.published_at.is_empty() {
        return None;
    }
    if !is_newer_version(&release.tag_name, current_version) {
        return None;
    }

    Some(UpdateNotice {
        tag: release.tag_name.clone(),
        message: update_message(release, now),
    })
}

/// Checks GitHub for a release newer than `current_version`.
pub async fn check_for_update(
    client: &reqwest::Client,
    app: &AppConfig,
    current_version: &str,
) -> Result<Option<UpdateNotice>> {
    if current_version == "dev" {
        return Ok(None);
    }

    let Some(release) = latest_release(client, app).await? else {
        return Ok(None);
    };
    Ok(evaluate_release(&release, current_version, Utc::now()))
}

/// Download location of the release archive for this platform.
pub fn release_download_url(app: &AppConfig, tag: &str) -> String {
    format!(
        "{RELEASE_DOWNLOAD_HOST}/{}/releases/download/{tag}/{}",
        app.repository_name,
        app.release_filename()
    )
}

/// Whether the current user may replace the file at `path`.
///
/// Replacement creates a sibling file and renames it over the original, so
/// the containing directory must be writable.
pub fn has_write_permission(path: &Path) -> io::Result<bool> {
    if fs::metadata(path)?.permissions().readonly() {
        return Ok(false);
    }

    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    match tempfile::Builder::new()
        .prefix(".privado-perm-")
        .tempfile_in(directory)
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(false),
        Err(e) => Err(e),
    }
}

/// Extracts a `.tar.gz` archive into `target`.
pub fn extract_archive(archive_path: &Path, target: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let decoder = flate2::read::GzDecoder::new(file);
    tar::Archive::new(decoder)
        .unpack(target)
        .with_context(|| format!("Failed to extract {}", archive_path.display()))
}

/// Backup of the installed binary that is put back unless committed.
pub struct BinaryBackup {
    target: PathBuf,
    backup: PathBuf,
    committed: bool,
}

impl BinaryBackup {
    /// Moves `target` aside to `<target>-backup`.
    pub fn acquire(target: &Path) -> io::Result<Self> {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push("-backup");
        let backup = target.with_file_name(name);

        fs::rename(target, &backup)?;
        Ok(Self {
            target: target.to_path_buf(),
            backup,
            committed: false,
        })
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Keeps the new binary and deletes the backup.
    pub fn commit(mut self) {
        self.committed = true;
        if let Err(e) = fs::remove_file(&self.backup) {
            warn!(path = %self.backup.display(), error = %e, "Could not remove backup binary");
        }
    }
}

impl Drop for BinaryBackup {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        println!("> Restoring from backup");
        let _ = fs::remove_file(&self.target);
        if let Err(e) = fs::rename(&self.backup, &self.target) {
            println!();
            println!("Unable to restore original file:\n {e}");
            println!("Backup kept at: {}", self.backup.display());
        }
    }
}

/// Replaces `target` with `source`, keeping a backup until the swap succeeds.
pub fn replace_binary(source: &Path, target: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(source, fs::Permissions::from_mode(0o755))
            .context("Failed to set binary permissions")?;
    }

    // Stage next to the target so the final rename stays on one filesystem.
    let directory = target.parent().unwrap_or_else(|| Path::new("."));
    let staged = tempfile::Builder::new()
        .prefix(".privado-update-")
        .tempfile_in(directory)
        .context("Failed to stage new binary")?;
    fs::copy(source, staged.path()).context("Failed to stage new binary")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o755))
            .context("Failed to set binary permissions")?;
    }

    println!("> Creating backup of existing file");
    let backup = BinaryBackup::acquire(target).context("Failed to create backup")?;
    debug!(backup = %backup.backup_path().display(), "Backed up current binary");

    match staged.persist(target) {
        Ok(_) => {
            println!("> Removing backup file");
            backup.commit();
            Ok(())
        }
        Err(e) => {
            println!("> Failed to move file:\n {}", e.error);
            Err(anyhow!(e.error).context("Failed to install new binary"))
        }
    }
}

/// Runs the `update` command: installs the latest release over the running binary.
pub async fn run_self_update(app: &AppConfig, current_version: &str) -> Result<()> {
    if current_version == "dev" {
        println!(
            "Cannot perform an update on the dev build. Kindly use a release build or update manually\nFor more information, visit {}",
            app.repository_url
        );
        return Ok(());
    }

    let current_exe = std::env::current_exe()
        .and_then(|p| p.canonicalize())
        .map_err(|e| update_failed(app, anyhow!("Could not evaluate path to current binary: {e}")))?;

    let permitted = has_write_permission(&current_exe)
        .map_err(|e| update_failed(app, anyhow!("Could not open executable for write: {e}")))?;
    if !permitted {
        println!("> Error: Permission denied");
        println!(
            "> The identified installation ({}) requires privileged permissions",
            current_exe.display()
        );
        println!();
        bail!("Try again with a privileged user (sudo)?");
    }

    install_latest(app, current_version, &current_exe)
        .await
        .map_err(|e| update_failed(app, e))
}

async fn install_latest(app: &AppConfig, current_version: &str, current_exe: &Path) -> Result<()> {
    let client = http_client(current_version)?;

    println!("Fetching latest release..");
    let notice = check_for_update(&client, app, current_version)
        .await
        .context("Could not fetch latest release. Some error occurred")?;
    let Some(notice) = notice else {
        println!("You are already using the latest version of Privado CLI: {current_version}");
        return Ok(());
    };
    println!("{}", notice.message);
    tokio::time::sleep(app.slowdown_time).await;

    let download_url = release_download_url(app, &notice.tag);
    let workdir = tempfile::Builder::new()
        .prefix("privado-update-")
        .tempdir()
        .context("Could not create temporary download file")?;
    let archive_path = workdir.path().join(app.release_filename());

    println!("Downloading {download_url}..");
    let response = client
        .get(&download_url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Could not download release asset: {download_url}"))?;
    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("Could not download release asset: {download_url}"))?;
    fs::write(&archive_path, &bytes).context("Could not write release asset")?;
    println!();
    println!("Downloaded release asset: {download_url}");
    tokio::time::sleep(app.slowdown_time).await;

    println!();
    println!("Extracting release asset..");
    extract_archive(&archive_path, workdir.path())?;
    println!("Extracted release asset: {}", workdir.path().display());
    tokio::time::sleep(app.slowdown_time).await;
    println!();

    let new_binary = workdir.path().join(BINARY_NAME);
    if !new_binary.is_file() {
        bail!("Binary not found in downloaded archive");
    }

    println!("Installing latest release..");
    tokio::time::sleep(app.slowdown_time).await;
    replace_binary(&new_binary, current_exe).context("Could not update existing installation")?;

    tokio::time::sleep(app.slowdown_time).await;
    println!();
    println!("Installed latest release!");
    println!("To validate installation, run `privado version`");
    Ok(())
}

fn update_failed(app: &AppConfig, error: anyhow::Error) -> anyhow::Error {
    anyhow!(
        "{error:#}\n\n> Auto-update failed. Kindly try again or reinstall to update: {}",
        app.repository_url
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn release(tag: &str, published_at: &str) -> GitHubRelease {
        GitHubRelease {
            tag_name: tag.to_string(),
            published_at: published_at.to_string(),
        }
    }

    #[test]
    fn test_is_newer_version() {
        assert!(is_newer_version("v1.2.0", "v1.1.9"));
        assert!(is_newer_version("1.10.0", "v1.9.0"));
        assert!(!is_newer_version("v1.2.0", "v1.2.0"));
        assert!(!is_newer_version("v1.0.0", "v1.2.0"));
        assert!(!is_newer_version("nightly", "v1.2.0"));
        assert!(!is_newer_version("v1.2.0", "dev"));
    }

    #[test]
    fn test_days_since_rounds() {
        assert_eq!(days_since("2024-03-10T06:00:00Z", now()), Some(0));
        assert_eq!(days_since("2024-03-09T00:00:00Z", now()), Some(2));
        assert_eq!(days_since("2024-03-09T13:00:00Z", now()), Some(1));
        assert_eq!(days_since("not a date", now()), None);
    }

    #[test]
    fn test_release_age() {
        assert_eq!(release_age(0), "Released today");
        assert_eq!(release_age(-1), "Released today");
        assert_eq!(release_age(1), "Released yesterday");
        assert_eq!(release_age(12), "Released 12 days ago");
    }

    #[test]
    fn test_evaluate_release() {
        let newer = release("v2.0.0", "2024-03-01T12:00:00Z");
        let notice = evaluate_release(&newer, "v1.0.0", now()).unwrap();
        assert_eq!(notice.tag, "v2.0.0");
        assert_eq!(notice.message, "New release found: v2.0.0 (Released 9 days ago)");

        assert!(evaluate_release(&newer, "dev", now()).is_none());
        assert!(evaluate_release(&newer, "v2.0.0", now()).is_none());
        assert!(evaluate_release(&release("v2.0.0", ""), "v1.0.0", now()).is_none());
        assert!(evaluate_release(&release("", "2024-03-01T12:00:00Z"), "v1.0.0", now()).is_none());
    }

    #[test]
    fn test_update_message_without_date() {
        let message = update_message(&release("v2.0.0", "yesterday"), now());
        assert_eq!(message, "New release found: v2.0.0\n");
    }

    #[test]
    fn test_release_download_url() {
        let app = AppConfig::for_home("/home/dev", "test");
        let url = release_download_url(&app, "v1.2.3");
        assert!(url.starts_with("https://github.com/Privado-Inc/privado-cli/releases/download/v1.2.3/privado-"));
        assert!(url.ends_with(".tar.gz"));
    }

    #[test]
    fn test_extract_archive() {
        let dir = TempDir::new().unwrap();
        let archive_path = dir.path().join("release.tar.gz");

        let file = fs::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let content = b"#!/bin/sh\necho privado\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, BINARY_NAME, &content[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        extract_archive(&archive_path, &out).unwrap();
        assert_eq!(fs::read(out.join(BINARY_NAME)).unwrap(), content);
    }

    #[test]
    fn test_replace_binary_swaps_and_removes_backup() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("privado");
        let source = dir.path().join("new-privado");
        fs::write(&target, "old").unwrap();
        fs::write(&source, "new").unwrap();

        replace_binary(&source, &target).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
        assert!(!dir.path().join("privado-backup").exists());
    }

    #[test]
    fn test_backup_restores_when_dropped() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("privado");
        fs::write(&target, "old").unwrap();

        {
            let backup = BinaryBackup::acquire(&target).unwrap();
            assert!(!target.exists());
            assert!(backup.backup_path().exists());
            fs::write(&target, "partial").unwrap();
        }

        assert_eq!(fs::read_to_string(&target).unwrap(), "old");
        assert!(!dir.path().join("privado-backup").exists());
    }

    #[test]
    fn test_has_write_permission_in_tempdir() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("privado");
        fs::write(&target, "bin").unwrap();
        assert!(has_write_permission(&target).unwrap());
        assert!(has_write_permission(&dir.path().join("missing")).is_err());
    }
}
