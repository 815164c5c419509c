//! Runtime configuration for the unlock daemon and update lifecycle.

use crate::error::{IronsealError, IronsealResult};
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ironseal.toml";
pub const CONFIG_PATH_ENV: &str = "IRONSEAL_CONFIG";
const STAGING_DIR_ENV: &str = "IRONSEAL_STAGING_DIR";
const BOOTSTRAP_FILE_NAME: &str = "ironseal.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Ironseal";
const APP_NAME: &str = "ironseal";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

pub fn bootstrap_template() -> String {
    "# Auto-generated ironseal configuration bootstrap.\n\
# Review every value before deploying on a live device.\n\n\
[device]\n\
path = \"/dev/sda\"\n\
metadata_reserved_mb = 5\n\
mapping_prefix = \"ironseal-\"\n\n\
[unlock]\n\
max_attempts = 3\n\
failsafe_secs = 120\n\
poll_interval_ms = 1000\n\
# valid_to = \"2030-01-01T00:00:00Z\"\n\
allowed_virtualization = []\n\n\
[unlock.trusted_signers]\n\
# admin = \"<64 hex digits ed25519 public key>\"\n\n\
[updates]\n\
enabled = true\n\
staging_dir = \"/var/lib/ironseal/staging\"\n\
source_dir = \"/var/lib/ironseal/mirror\"\n\
# sync_command = [\"/usr/bin/rclone\", \"copy\", \"remote:builds\", \"/var/lib/ironseal/mirror\"]\n\
running_version = \"0.0.0\"\n\
signing_public_key = \"\"\n\
check_interval_secs = 3600\n\
poll_interval_secs = 5\n\
install_path = \"/run/live/medium/live/filesystem.squashfs\"\n\n\
[crypto]\n\
timeout_secs = 30\n\
pbkdf2_iterations = 600000\n"
        .to_string()
}

/// Target device and metadata region placement.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceCfg {
    pub path: String,

    #[serde(default = "default_metadata_reserved_mb")]
    pub metadata_reserved_mb: u64,

    #[serde(default = "default_mapping_prefix")]
    pub mapping_prefix: String,
}

fn default_metadata_reserved_mb() -> u64 {
    5
}

fn default_mapping_prefix() -> String {
    "ironseal-".to_string()
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            path: "/dev/sda".to_string(),
            metadata_reserved_mb: default_metadata_reserved_mb(),
            mapping_prefix: default_mapping_prefix(),
        }
    }
}

/// Lockout, failsafe and trust anchors for the unlock state machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UnlockCfg {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_failsafe_secs")]
    pub failsafe_secs: u64,

    #[serde(default = "default_unlock_poll_ms")]
    pub poll_interval_ms: u64,

    /// RFC 3339 end of the device validity window.
    #[serde(default)]
    pub valid_to: Option<String>,

    /// Hypervisors (as reported by `systemd-detect-virt`) the device may boot in.
    #[serde(default)]
    pub allowed_virtualization: Vec<String>,

    /// Signature name to hex ed25519 public key.
    #[serde(default)]
    pub trusted_signers: BTreeMap<String, String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_failsafe_secs() -> u64 {
    120
}

fn default_unlock_poll_ms() -> u64 {
    1_000
}

impl Default for UnlockCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            failsafe_secs: default_failsafe_secs(),
            poll_interval_ms: default_unlock_poll_ms(),
            valid_to: None,
            allowed_virtualization: Vec::new(),
            trusted_signers: BTreeMap::new(),
        }
    }
}

/// Update source, staging and install locations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdatesCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    #[serde(default)]
    pub sync_command: Option<Vec<String>>,

    #[serde(default = "default_running_version")]
    pub running_version: String,

    #[serde(default)]
    pub signing_public_key: Option<String>,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_update_poll_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_install_path")]
    pub install_path: String,
}

fn default_true() -> bool {
    true
}

fn default_staging_dir() -> String {
    "/var/lib/ironseal/staging".to_string()
}

fn default_source_dir() -> String {
    "/var/lib/ironseal/mirror".to_string()
}

fn default_running_version() -> String {
    "0.0.0".to_string()
}

fn default_check_interval_secs() -> u64 {
    3_600
}

fn default_update_poll_secs() -> u64 {
    5
}

fn default_install_path() -> String {
    "/run/live/medium/live/filesystem.squashfs".to_string()
}

impl Default for UpdatesCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            staging_dir: default_staging_dir(),
            source_dir: default_source_dir(),
            sync_command: None,
            running_version: default_running_version(),
            signing_public_key: None,
            check_interval_secs: default_check_interval_secs(),
            poll_interval_secs: default_update_poll_secs(),
            install_path: default_install_path(),
        }
    }
}

/// Timeouts and KDF tuning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptoCfg {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_pbkdf2_iterations() -> u32 {
    600_000
}

impl Default for CryptoCfg {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeConfig {
    pub device: DeviceCfg,

    #[serde(default)]
    pub unlock: UnlockCfg,

    #[serde(default)]
    pub updates: UpdatesCfg,

    #[serde(default)]
    pub crypto: CryptoCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceCfg::default(),
            unlock: UnlockCfg::default(),
            updates: UpdatesCfg::default(),
            crypto: CryptoCfg::default(),
            path: PathBuf::new(),
            format: ConfigFormat::Toml,
        }
    }
}

impl RuntimeConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// When the global default cannot be created (no permission on /etc), a
    /// per-user copy is written to the platform config directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> IronsealResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("ironseal config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(IronsealError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    IronsealError::InvalidConfig(
                        "unable to determine user configuration directory; \
                        create /etc/ironseal.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    IronsealError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!(
                        "ironseal config bootstrap created at {}",
                        user_path.display()
                    );
                }

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> IronsealResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        if cfg.device.path.trim().is_empty() {
            return Err(IronsealError::InvalidConfig(
                "device.path must name the live device".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !self.device.path.starts_with('/') {
            issues.push(format!(
                "device.path must be an absolute path, got {}",
                self.device.path
            ));
        }
        // The last MiB of the tail stays free for the backup partition table.
        if self.device.metadata_reserved_mb < 2 {
            issues.push("device.metadata_reserved_mb must be at least 2".to_string());
        }

        if self.unlock.max_attempts == 0 {
            issues.push("unlock.max_attempts must be at least 1".to_string());
        }
        if self.unlock.failsafe_secs == 0 {
            issues.push("unlock.failsafe_secs must be greater than 0".to_string());
        }
        if !(1_000..=2_000).contains(&self.unlock.poll_interval_ms) {
            issues.push("unlock.poll_interval_ms should be between 1000 and 2000".to_string());
        }
        if let Some(valid_to) = &self.unlock.valid_to {
            if chrono::DateTime::parse_from_rfc3339(valid_to).is_err() {
                issues.push(format!("unlock.valid_to is not RFC 3339: {valid_to}"));
            }
        }
        for (name, key) in &self.unlock.trusted_signers {
            if !is_hex_key(key) {
                issues.push(format!(
                    "unlock.trusted_signers.{name} must be a 64-character hex string"
                ));
            }
        }

        if self.updates.enabled {
            match self.updates.signing_public_key.as_deref() {
                Some(key) if is_hex_key(key) => {}
                _ => issues.push(
                    "updates.enabled is true but updates.signing_public_key is not a 64-character hex string"
                        .to_string(),
                ),
            }
            if crate::update::BuildVersion::parse(&self.updates.running_version).is_none() {
                issues.push(format!(
                    "updates.running_version is not a dotted numeric version: {}",
                    self.updates.running_version
                ));
            }
            if !(1..=60).contains(&self.updates.poll_interval_secs) {
                issues.push("updates.poll_interval_secs should be between 1 and 60".to_string());
            }
            if self.updates.check_interval_secs == 0 {
                issues.push("updates.check_interval_secs must be greater than 0".to_string());
            }
        }

        if self.crypto.pbkdf2_iterations < 10_000 {
            issues.push("crypto.pbkdf2_iterations must be at least 10000".to_string());
        }

        issues
    }

    /// Resolve the staging directory, honouring the environment override.
    pub fn staging_dir(&self) -> PathBuf {
        if let Ok(override_path) = env::var(STAGING_DIR_ENV) {
            if !override_path.is_empty() {
                return PathBuf::from(override_path);
            }
        }
        PathBuf::from(&self.updates.staging_dir)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.crypto.timeout_secs)
    }

    pub fn failsafe_delay(&self) -> Duration {
        Duration::from_secs(self.unlock.failsafe_secs)
    }

    pub fn unlock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.unlock.poll_interval_ms)
    }

    pub fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.updates.poll_interval_secs)
    }

    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.updates.check_interval_secs)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> IronsealResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

fn is_hex_key(value: &str) -> bool {
    value.len() == 64 && hex::decode(value).is_ok()
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            file.write_all(bootstrap_template().as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") {
                    0o640
                } else {
                    0o600
                };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}
