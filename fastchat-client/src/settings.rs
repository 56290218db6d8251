use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use fastchat_core::DEFAULT_LOCAL_ENDPOINT;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

pub const DEFAULT_USER_NAME: &str = "User";
pub const MAX_USER_NAME_LEN: usize = 64;
pub const MAX_SERVER_URL_LEN: usize = 512;
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Persisted client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default)]
    pub host_mode: bool,
    /// Skips the shared-secret check for settings changes.
    #[serde(default)]
    pub admin_mode: bool,
    /// Hex SHA-256 of the secret gating settings changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret_sha256: Option<String>,
}

fn default_server_url() -> String {
    DEFAULT_LOCAL_ENDPOINT.to_owned()
}

fn default_user_name() -> String {
    DEFAULT_USER_NAME.to_owned()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            user_name: default_user_name(),
            host_mode: false,
            admin_mode: false,
            admin_secret_sha256: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("shared secret does not match")]
    Unauthorized,
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
}

impl Settings {
    /// Trims the user name and falls back to the default when it is empty.
    pub fn normalized(mut self) -> Self {
        let name = self.user_name.trim();
        self.user_name = if name.is_empty() {
            default_user_name()
        } else {
            name.to_owned()
        };
        self.server_url = self.server_url.trim().to_owned();
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut errors: Vec<String> = Vec::new();

        let server_url = self.server_url.trim();
        if server_url.is_empty() {
            errors.push("server URL is required".to_owned());
        } else if server_url.len() > MAX_SERVER_URL_LEN {
            errors.push(format!(
                "server URL is too long ({} > {} chars)",
                server_url.len(),
                MAX_SERVER_URL_LEN
            ));
        } else {
            match Url::parse(server_url) {
                Ok(url) => {
                    let scheme = url.scheme();
                    if scheme != "ws" && scheme != "wss" {
                        errors.push("server URL must start with ws:// or wss://".to_owned());
                    }
                }
                Err(err) => errors.push(format!("server URL is invalid: {err}")),
            }
        }

        let user_name = self.user_name.trim();
        if user_name.is_empty() {
            errors.push("user name is required".to_owned());
        } else if user_name.chars().count() > MAX_USER_NAME_LEN {
            errors.push(format!(
                "user name is too long (max {MAX_USER_NAME_LEN} chars)"
            ));
        }

        if let Some(digest) = &self.admin_secret_sha256
            && (digest.len() != 64 || hex::decode(digest).is_err())
        {
            errors.push("admin secret digest must be 64 hex chars".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(errors))
        }
    }

    /// Stores the digest of `secret`; `None` removes the gate.
    pub fn set_admin_secret(&mut self, secret: Option<&str>) {
        self.admin_secret_sha256 = secret
            .filter(|s| !s.is_empty())
            .map(|s| hex::encode(Sha256::digest(s.as_bytes())));
    }

    /// Whether a settings change may proceed with the given secret.
    pub fn authorize(&self, candidate: Option<&str>) -> bool {
        if self.admin_mode {
            return true;
        }
        let Some(expected) = self.admin_secret_sha256.as_deref() else {
            return true;
        };
        candidate.is_some_and(|secret| {
            let digest = hex::encode(Sha256::digest(secret.as_bytes()));
            digest.eq_ignore_ascii_case(expected)
        })
    }
}

/// Directory holding `settings.json`, honouring `FASTCHAT_CONFIG_DIR`.
pub fn settings_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os("FASTCHAT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    let base = std::env::var_os("XDG_CONFIG_HOME")
        .or_else(|| std::env::var_os("APPDATA"))
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("fastchat")
}

pub fn load_from_path(path: &Path) -> Result<Option<Settings>, SettingsError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let settings: Settings =
        serde_json::from_str(&data).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let settings = settings.normalized();
    settings.validate()?;
    Ok(Some(settings))
}

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_BACKOFF_BASE_MS: u64 = 50;

fn save_payload(settings: &Settings) -> Result<String, SettingsError> {
    settings.validate()?;
    serde_json::to_string_pretty(settings).map_err(SettingsError::Serialize)
}

fn save_retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(SAVE_BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1)))
}

fn write_error(target: &Path) -> impl FnOnce(io::Error) -> SettingsError {
    let path = target.to_path_buf();
    move |source| SettingsError::Write { path, source }
}

/// Writes `settings` via a temp file and rename, retrying briefly. Blocks
/// the calling thread; use [`save_to_path_async`] on the runtime.
pub fn save_to_path(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let payload = save_payload(settings)?;
    let tmp_path = path.with_extension("json.tmp");

    let mut attempt: u32 = 1;
    loop {
        match write_atomically(path, &tmp_path, payload.as_bytes()) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= SAVE_ATTEMPTS => return Err(err),
            Err(_) => {
                std::thread::sleep(save_retry_delay(attempt));
                attempt += 1;
            }
        }
    }
}

pub async fn save_to_path_async(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let payload = save_payload(settings)?;
    let tmp_path = path.with_extension("json.tmp");

    let mut attempt: u32 = 1;
    loop {
        match write_atomically_async(path, &tmp_path, payload.as_bytes()).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= SAVE_ATTEMPTS => return Err(err),
            Err(_) => {
                tokio::time::sleep(save_retry_delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}

fn write_atomically(path: &Path, tmp_path: &Path, payload: &[u8]) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(write_error(parent))?;
    }
    fs::write(tmp_path, payload).map_err(write_error(tmp_path))?;
    fs::rename(tmp_path, path).map_err(write_error(path))?;
    Ok(())
}

async fn write_atomically_async(
    path: &Path,
    tmp_path: &Path,
    payload: &[u8],
) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(write_error(parent))?;
    }
    tokio::fs::write(tmp_path, payload)
        .await
        .map_err(write_error(tmp_path))?;
    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(write_error(path))?;
    Ok(())
}
