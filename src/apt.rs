//! apt/dpkg access: lock arbitration, availability filtering and mutations.
//!
//! Every mutating call waits for the dpkg/apt locks first. The wait is
//! bounded; a lock that never clears fails the run instead of hanging.

use std::cell::Cell;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::LockConfig;
use crate::error::ProvisionError;
use crate::exec::{CommandSpec, Executor};
use crate::runner::Runner;

pub trait Clock {
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Outcome of an availability-filtered install request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub already_present: Vec<String>,
    pub skipped: Vec<String>,
}

/// True when `apt-cache policy` output names a real install candidate.
pub fn policy_has_candidate(policy_output: &str) -> bool {
    policy_output.lines().any(|line| {
        line.trim()
            .strip_prefix("Candidate:")
            .map(|value| {
                let value = value.trim();
                !value.is_empty() && value != "(none)"
            })
            .unwrap_or(false)
    })
}

pub struct Apt<'a, E: Executor, C: Clock> {
    runner: &'a Runner<'a, E>,
    clock: &'a C,
    lock: &'a LockConfig,
    warned_no_fuser: Cell<bool>,
}

impl<'a, E: Executor, C: Clock> Apt<'a, E, C> {
    pub fn new(runner: &'a Runner<'a, E>, clock: &'a C, lock: &'a LockConfig) -> Self {
        Self {
            runner,
            clock,
            lock,
            warned_no_fuser: Cell::new(false),
        }
    }

    /// Lock files currently held by another process. Without `fuser` this
    /// falls back to looking for running package-manager processes.
    pub fn held_locks(&self) -> Vec<String> {
        if !self.runner.has_program("fuser") {
            if !self.warned_no_fuser.replace(true) {
                self.runner.warn(
                    "fuser is not installed (psmisc); detecting package manager activity by process name",
                );
            }
            return self.busy_processes();
        }
        self.lock
            .files
            .iter()
            .filter(|path| {
                self.runner
                    .probe(&CommandSpec::root("fuser", [path.as_str()]))
                    .success()
            })
            .cloned()
            .collect()
    }

    fn busy_processes(&self) -> Vec<String> {
        self.lock
            .processes
            .iter()
            .filter(|name| {
                self.runner
                    .probe(&CommandSpec::new("pgrep", ["-x", name.as_str()]))
                    .success()
            })
            .map(|name| format!("process {name}"))
            .collect()
    }

    /// Blocks until no lock file is held, polling every
    /// `lock.poll_interval_secs`; fails once `lock.timeout_secs` of waiting
    /// has accumulated.
    pub fn wait_for_lock(&self) -> Result<(), ProvisionError> {
        // An expired sudo session would make every lock look free.
        self.runner.refresh_elevation()?;
        let interval = self.lock.poll_interval();
        let timeout = self.lock.timeout();
        let mut waited = Duration::ZERO;
        let mut warned = false;
        loop {
            let held = self.held_locks();
            if held.is_empty() {
                if warned {
                    info!(waited_secs = waited.as_secs(), "package manager lock released");
                }
                return Ok(());
            }
            if waited >= timeout {
                return Err(ProvisionError::LockTimeout {
                    waited_secs: waited.as_secs(),
                    held: held.join(", "),
                });
            }
            if !warned {
                self.runner.warn(&format!(
                    "package manager is busy ({}); waiting up to {}s",
                    held.join(", "),
                    timeout.as_secs()
                ));
                warned = true;
            }
            self.clock.sleep(interval);
            waited += interval;
        }
    }

    pub fn is_available(&self, package: &str) -> bool {
        let out = self
            .runner
            .probe(&CommandSpec::new("apt-cache", ["policy", package]));
        out.success() && policy_has_candidate(&out.stdout_text())
    }

    pub fn is_installed(&self, package: &str) -> bool {
        let out = self
            .runner
            .probe(&CommandSpec::new("dpkg-query", ["-W", "-f=${Status}", package]));
        out.success() && out.stdout_text().contains("install ok installed")
    }

    pub fn update(&self) -> Result<(), ProvisionError> {
        self.wait_for_lock()?;
        self.runner.run(
            "Refresh package index",
            &CommandSpec::root("apt-get", ["update"]).with_env("DEBIAN_FRONTEND", "noninteractive"),
        )?;
        Ok(())
    }

    /// Installs `packages` in one batch. Unknown names are a hard failure
    /// here; use [`Apt::install_available`] for best-effort sets.
    pub fn install(&self, packages: &[String]) -> Result<(), ProvisionError> {
        if packages.is_empty() {
            return Ok(());
        }
        self.wait_for_lock()?;
        let mut args = vec![
            "install".to_string(),
            "-y".to_string(),
            "--no-install-recommends".to_string(),
        ];
        args.extend(packages.iter().cloned());
        self.runner.run(
            &format!("Install {}", packages.join(" ")),
            &CommandSpec::root("apt-get", args).with_env("DEBIAN_FRONTEND", "noninteractive"),
        )?;
        Ok(())
    }

    /// Installs the subset of `packages` present in the package index and not
    /// yet installed. Missing names are skipped with a warning and never
    /// reach apt-get.
    pub fn install_available(&self, packages: &[String]) -> Result<InstallReport, ProvisionError> {
        let mut report = InstallReport::default();
        for package in packages {
            if self.is_installed(package) {
                report.already_present.push(package.clone());
            } else if self.is_available(package) {
                report.installed.push(package.clone());
            } else {
                self.runner
                    .warn(&format!("package {package} is not available here; skipping"));
                report.skipped.push(package.clone());
            }
        }
        debug!(
            install = ?report.installed,
            present = ?report.already_present,
            skipped = ?report.skipped,
            "filtered package set"
        );
        self.install(&report.installed)?;
        Ok(report)
    }

    /// Removes `package` if it is installed. Already absent is success.
    pub fn remove(&self, package: &str) -> Result<bool, ProvisionError> {
        if !self.is_installed(package) {
            debug!(package, "not installed; nothing to remove");
            return Ok(false);
        }
        self.wait_for_lock()?;
        self.runner.run(
            &format!("Remove {package}"),
            &CommandSpec::root("apt-get", ["remove", "-y", package])
                .with_env("DEBIAN_FRONTEND", "noninteractive"),
        )?;
        Ok(true)
    }
}
