//! Low-port binding for the target executable.
//!
//! The preferred fix is a file capability on one binary. When that cannot be
//! verified, a sysctl drop-in lowers the unprivileged port floor for the whole
//! host instead. The drop-in's presence is the only record of that choice.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::CapabilityConfig;
use crate::error::ProvisionError;
use crate::exec::{CommandSpec, Executor};
use crate::runner::Runner;

const PORT_START_KEY: &str = "net.ipv4.ip_unprivileged_port_start";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    AlreadyPresent { path: String },
    Granted { path: String },
    Fallback { file: String, written: bool, applied: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityState {
    pub executable: Option<String>,
    pub real_path: Option<String>,
    pub present: bool,
    pub fallback_active: bool,
}

/// Exact content of the sysctl drop-in.
pub fn sysctl_directive(port_start: u16) -> String {
    format!("{PORT_START_KEY}={port_start}\n")
}

/// True when `getcap` output lists `capability` for the file.
pub fn getcap_lists(output: &str, capability: &str) -> bool {
    let capability = capability.to_lowercase();
    output
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == ',' || c == '=' || c == '+')
        .any(|token| token == capability)
}

pub struct CapabilityFixer<'a, E: Executor> {
    runner: &'a Runner<'a, E>,
    cfg: &'a CapabilityConfig,
}

impl<'a, E: Executor> CapabilityFixer<'a, E> {
    pub fn new(runner: &'a Runner<'a, E>, cfg: &'a CapabilityConfig) -> Self {
        Self { runner, cfg }
    }

    /// The executable and, when it is an indirection, its real path.
    pub fn resolve_target(&self) -> Option<(PathBuf, PathBuf)> {
        let executable = if Path::new(&self.cfg.executable).is_absolute() {
            PathBuf::from(&self.cfg.executable)
        } else {
            self.runner.executor().which(&self.cfg.executable)?
        };
        let out = self.runner.probe(&CommandSpec::new(
            "readlink",
            ["-f".to_string(), executable.to_string_lossy().to_string()],
        ));
        let resolved = out.stdout_text().trim().to_string();
        let real = if out.success() && !resolved.is_empty() {
            PathBuf::from(resolved)
        } else {
            executable.clone()
        };
        Some((executable, real))
    }

    pub fn has_capability(&self, path: &Path) -> bool {
        let out = self.runner.probe(&CommandSpec::new(
            "getcap",
            [path.to_string_lossy().to_string()],
        ));
        out.success() && getcap_lists(&out.stdout_text(), &self.cfg.capability)
    }

    fn present_on(&self, executable: &Path, real: &Path) -> Option<PathBuf> {
        if self.has_capability(executable) {
            return Some(executable.to_path_buf());
        }
        if real != executable && self.has_capability(real) {
            return Some(real.to_path_buf());
        }
        None
    }

    pub fn fallback_active(&self) -> bool {
        let out = self
            .runner
            .probe(&CommandSpec::new("cat", [self.cfg.sysctl_file.as_str()]));
        out.success() && out.stdout_text() == sysctl_directive(self.cfg.unprivileged_port_start)
    }

    pub fn observe(&self) -> CapabilityState {
        let target = self.resolve_target();
        let present = target
            .as_ref()
            .map(|(executable, real)| self.present_on(executable, real).is_some())
            .unwrap_or(false);
        CapabilityState {
            executable: target
                .as_ref()
                .map(|(executable, _)| executable.display().to_string()),
            real_path: target.as_ref().map(|(_, real)| real.display().to_string()),
            present,
            fallback_active: self.fallback_active(),
        }
    }

    /// Ends in one of two verified states: capability present on the
    /// executable, or the sysctl drop-in written and in effect.
    pub fn fix(&self) -> Result<CapabilityOutcome, ProvisionError> {
        let Some((executable, real)) = self.resolve_target() else {
            self.runner.warn(&format!(
                "{} is not on PATH; using the system-wide port fallback",
                self.cfg.executable
            ));
            return self.fallback();
        };

        if let Some(path) = self.present_on(&executable, &real) {
            debug!(path = %path.display(), "capability already present");
            return Ok(CapabilityOutcome::AlreadyPresent {
                path: path.display().to_string(),
            });
        }

        let grant = format!("{}=+ep", self.cfg.capability);
        let mut candidates = vec![executable.clone()];
        if real != executable {
            candidates.push(real.clone());
        }
        for candidate in candidates {
            let out = self.runner.probe(&CommandSpec::root(
                "setcap",
                [grant.clone(), candidate.to_string_lossy().to_string()],
            ));
            if !out.success() {
                debug!(path = %candidate.display(), status = out.status_code, "setcap failed");
                continue;
            }
            // setcap's exit status alone is not trusted.
            if let Some(path) = self.present_on(&executable, &real) {
                info!(path = %path.display(), capability = %self.cfg.capability, "capability granted");
                return Ok(CapabilityOutcome::Granted {
                    path: path.display().to_string(),
                });
            }
        }

        self.runner.warn(&format!(
            "could not verify {} on {}; allowing unprivileged binding from port {} system-wide",
            self.cfg.capability,
            executable.display(),
            self.cfg.unprivileged_port_start
        ));
        self.fallback()
    }

    fn fallback(&self) -> Result<CapabilityOutcome, ProvisionError> {
        self.apply_fallback()
            .map_err(|err| ProvisionError::CapabilityUnresolved {
                capability: self.cfg.capability.clone(),
                executable: self.cfg.executable.clone(),
                reason: err.to_string(),
            })
    }

    fn apply_fallback(&self) -> Result<CapabilityOutcome, ProvisionError> {
        let port_start = self.cfg.unprivileged_port_start;
        let directive = sysctl_directive(port_start);

        let written = if self.fallback_active() {
            false
        } else {
            self.runner.run(
                &format!("Write {}", self.cfg.sysctl_file),
                &CommandSpec::root("tee", [self.cfg.sysctl_file.as_str()])
                    .with_stdin(directive.as_bytes()),
            )?;
            true
        };

        let applied = if self.effective_port_start().is_some_and(|value| value <= port_start) {
            false
        } else {
            self.runner.run(
                "Apply sysctl settings",
                &CommandSpec::root("sysctl", ["--system"]),
            )?;
            true
        };

        match self.effective_port_start() {
            Some(value) if value <= port_start => Ok(CapabilityOutcome::Fallback {
                file: self.cfg.sysctl_file.clone(),
                written,
                applied,
            }),
            other => Err(ProvisionError::Config(format!(
                "{PORT_START_KEY} is {} after applying {}",
                other.map_or_else(|| "unreadable".to_string(), |v| v.to_string()),
                self.cfg.sysctl_file
            ))),
        }
    }

    fn effective_port_start(&self) -> Option<u16> {
        let out = self
            .runner
            .probe(&CommandSpec::new("sysctl", ["-n", PORT_START_KEY]));
        if !out.success() {
            return None;
        }
        out.stdout_text().trim().parse().ok()
    }
}
