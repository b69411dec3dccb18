//! User identity: the persisted user key and the hashes derived from it.
//!
//! The key is a UUID stored at `~/.privado/keys/user.key`. CI sessions derive
//! it deterministically from the CI user identifier so that repeated runs of
//! the same pipeline share one identity.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ci::CiSession;
use crate::error::ConfigError;

/// Identifier used for CI runs whose provider exposes no user identifier.
pub const DEFAULT_CI_USER_IDENTIFIER: &str = "PrivadoDefaultCIUserIdentifier";

/// Ensures a valid user key exists at `user_key_path`.
///
/// An existing key that fails verification is regenerated.
pub fn bootstrap_user_key(user_key_path: &Path, ci: &CiSession) -> Result<(), ConfigError> {
    if user_key_path.exists() && verify_user_key_file(user_key_path).is_ok() {
        return Ok(());
    }

    if let Some(directory) = user_key_path.parent() {
        fs::create_dir_all(directory)?;
    }

    let key = generate_user_key(ci)?;
    fs::write(user_key_path, key)?;
    restrict_permissions(user_key_path)?;

    tracing::debug!(path = %user_key_path.display(), "Generated user key");
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

/// Generates a new user key.
///
/// Outside CI this is a random UUID. In CI it is derived from the session's
/// user identifier, falling back to [`DEFAULT_CI_USER_IDENTIFIER`].
pub fn generate_user_key(ci: &CiSession) -> Result<String, ConfigError> {
    if !ci.is_ci {
        return Ok(Uuid::new_v4().to_string());
    }

    let identifier = match ci.user_identifier.as_deref() {
        Some(identifier) if !identifier.is_empty() => identifier,
        _ => {
            println!("> Unknown CI identifier. Setting default CI user");
            DEFAULT_CI_USER_IDENTIFIER
        }
    };
    println!("> Identified CI user: {identifier}");
    println!();

    user_key_from_string(identifier)
}

/// Derives a UUID from the first 16 bytes of the SHA-256 of `message`.
pub fn user_key_from_string(message: &str) -> Result<String, ConfigError> {
    let digest = sha256_bytes(message)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Ok(Uuid::from_bytes(bytes).to_string())
}

/// Hex-encoded SHA-256 of `key`. Empty keys are rejected.
pub fn sha256_hex(key: &str) -> Result<String, ConfigError> {
    Ok(hex::encode(sha256_bytes(key)?))
}

fn sha256_bytes(key: &str) -> Result<[u8; 32], ConfigError> {
    if key.is_empty() {
        return Err(ConfigError::EmptyKey);
    }
    Ok(Sha256::digest(key.as_bytes()).into())
}

/// Reads and validates the user key at `user_key_path`.
pub fn read_user_key(user_key_path: &Path) -> Result<String, ConfigError> {
    let content = fs::read_to_string(user_key_path)?;
    let key = Uuid::parse_str(content.trim()).map_err(|e| ConfigError::InvalidUserKey {
        path: user_key_path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(key.to_string())
}

/// Hash of the user key stored at `user_key_path`.
pub fn user_hash(user_key_path: &Path) -> Result<String, ConfigError> {
    sha256_hex(&read_user_key(user_key_path)?)
}

/// Checks that `path` holds a parseable user key.
pub fn verify_user_key_file(path: &Path) -> Result<(), ConfigError> {
    read_user_key(path).map(|_| ())
}
