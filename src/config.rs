use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ProvisionError;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

const DEFAULT_REPO: &str = "https://github.com/LeighlinRamsay/WebVerse.git";
const DEFAULT_REF: &str = "main";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub packages: Packages,
    pub runtime: RuntimeConfig,
    pub lock: LockConfig,
    pub capability: CapabilityConfig,
    pub session_log: SessionLogConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Packages {
    pub base: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub package: String,
    pub shim_package: String,
    pub shim_signature: String,
    pub compose_plugin_package: String,
    pub compose_versioned_package: String,
    pub compose_legacy_package: String,
    pub service: String,
    pub group: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub files: Vec<String>,
    /// Checked with `pgrep -x` when `fuser` is not installed.
    pub processes: Vec<String>,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CapabilityConfig {
    pub executable: String,
    pub capability: String,
    pub sysctl_file: String,
    pub unprivileged_port_start: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionLogConfig {
    pub dir: String,
    pub tail_lines: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub repo: String,
    pub git_ref: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            packages: Packages::default(),
            runtime: RuntimeConfig::default(),
            lock: LockConfig::default(),
            capability: CapabilityConfig::default(),
            session_log: SessionLogConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl Default for Packages {
    fn default() -> Self {
        Self {
            base: [
                "ca-certificates",
                "curl",
                "git",
                "python3",
                "python3-venv",
                "python3-pip",
                "libcap2-bin",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            package: "docker.io".to_string(),
            shim_package: "podman-docker".to_string(),
            shim_signature: "podman".to_string(),
            compose_plugin_package: "docker-compose-plugin".to_string(),
            compose_versioned_package: "docker-compose-v2".to_string(),
            compose_legacy_package: "docker-compose".to_string(),
            service: "docker".to_string(),
            group: "docker".to_string(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            files: vec![
                "/var/lib/dpkg/lock-frontend".to_string(),
                "/var/lib/dpkg/lock".to_string(),
                "/var/cache/apt/archives/lock".to_string(),
            ],
            processes: vec![
                "apt".to_string(),
                "apt-get".to_string(),
                "dpkg".to_string(),
                "unattended-upgr".to_string(),
            ],
            poll_interval_secs: 2,
            timeout_secs: 120,
        }
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            executable: "python3".to_string(),
            capability: "cap_net_bind_service".to_string(),
            sysctl_file: "/etc/sysctl.d/99-webverse-unprivileged-ports.conf".to_string(),
            unprivileged_port_start: 80,
        }
    }
}

impl Default for SessionLogConfig {
    fn default() -> Self {
        Self {
            dir: "/tmp".to_string(),
            tail_lines: 80,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repo: DEFAULT_REPO.to_string(),
            git_ref: DEFAULT_REF.to_string(),
        }
    }
}

impl LockConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("WEBVERSE_PROVISION_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("WEBVERSE_PROVISION_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("webverse-provision");
    base
}

pub fn read_config_from_str(content: &str) -> Result<Config, ProvisionError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Loads the file at `path`, or built-in defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config, ProvisionError> {
    let cfg = if path.exists() {
        read_config_from_str(&fs::read_to_string(path)?)?
    } else {
        Config::default()
    };
    Ok(apply_env_overrides(cfg, |key| env::var(key).ok()))
}

fn validate_config(cfg: &Config) -> Result<(), ProvisionError> {
    if cfg.version != 1 {
        return Err(ProvisionError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.lock.poll_interval_secs == 0 {
        return Err(ProvisionError::Config(
            "lock.poll_interval_secs must be greater than zero".to_string(),
        ));
    }
    if cfg.lock.files.is_empty() {
        return Err(ProvisionError::Config(
            "lock.files must name at least one lock file".to_string(),
        ));
    }
    if cfg.capability.executable.trim().is_empty() {
        return Err(ProvisionError::Config(
            "capability.executable must not be empty".to_string(),
        ));
    }
    if !Path::new(&cfg.capability.sysctl_file).is_absolute() {
        return Err(ProvisionError::Config(format!(
            "capability.sysctl_file must be an absolute path: {}",
            cfg.capability.sysctl_file
        )));
    }
    Ok(())
}

/// `WEBVERSE_REPO` and `WEBVERSE_REF` override the source selector.
pub fn apply_env_overrides<F>(mut cfg: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(repo) = lookup("WEBVERSE_REPO").filter(|v| !v.trim().is_empty()) {
        cfg.source.repo = repo.trim().to_string();
    }
    if let Some(git_ref) = lookup("WEBVERSE_REF").filter(|v| !v.trim().is_empty()) {
        cfg.source.git_ref = git_ref.trim().to_string();
    }
    cfg
}

pub fn expand_path(input: &str) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

pub fn ensure_parent(path: &Path) -> Result<(), ProvisionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
