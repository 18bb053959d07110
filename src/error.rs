use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("do not run as root directly; run as your normal user (sudo will be used when needed) or via sudo from that user")]
    RootWithoutInvokingUser,
    #[error("elevated privileges are required but unavailable: {0}")]
    NoElevation(String),
    #[error("unable to resolve account for user {0}")]
    UnknownUser(String),
    #[error("package manager lock did not clear after {waited_secs}s (held: {held})")]
    LockTimeout { waited_secs: u64, held: String },
    #[error("{description} failed (exit {status}) while running `{command}`")]
    CommandFailed {
        description: String,
        command: String,
        status: i32,
    },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("no compose package is available ({versioned} and {legacy} are both missing from the package index)")]
    NoComposePackage { versioned: String, legacy: String },
    #[error("`docker compose` is still not functional after repair")]
    ComposeStillBroken,
    #[error("container runtime did not converge to a healthy state (last observed: {0})")]
    ReconcileDiverged(String),
    #[error("could not grant {capability} to {executable} and the sysctl fallback failed: {reason}")]
    CapabilityUnresolved {
        capability: String,
        executable: String,
        reason: String,
    },
    #[error("aborted: nothing was changed")]
    Aborted,
}

impl ProvisionError {
    /// Step description to show as the failure marker, when the error came from a command.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            ProvisionError::CommandFailed { description, .. } => Some(description),
            _ => None,
        }
    }
}
