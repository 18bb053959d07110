//! Container runtime and compose reconciliation.
//!
//! The live system is probed into a [`RuntimeState`] on every pass; a pure
//! planner turns that state into an ordered action list; the driver applies
//! the actions and probes again until the runtime is healthy.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::apt::{Apt, Clock};
use crate::config::RuntimeConfig;
use crate::error::ProvisionError;
use crate::exec::{CommandSpec, Executor};
use crate::runner::Runner;

const MAX_PASSES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Absent,
    ShimmedByIncompatibleRuntime,
    ComposeBroken,
    Healthy,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RuntimeState::Absent => "absent",
            RuntimeState::ShimmedByIncompatibleRuntime => "shimmed by an incompatible runtime",
            RuntimeState::ComposeBroken => "compose broken",
            RuntimeState::Healthy => "healthy",
        };
        f.write_str(text)
    }
}

/// Raw observations behind a [`RuntimeState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeProbe {
    pub docker_on_path: bool,
    pub version_ok: bool,
    pub version_text: String,
    pub compose_ok: bool,
}

pub fn classify(probe: &RuntimeProbe, shim_signature: &str) -> RuntimeState {
    if !probe.docker_on_path || !probe.version_ok {
        return RuntimeState::Absent;
    }
    let signature = shim_signature.to_lowercase();
    if !signature.is_empty() && probe.version_text.to_lowercase().contains(&signature) {
        return RuntimeState::ShimmedByIncompatibleRuntime;
    }
    if !probe.compose_ok {
        return RuntimeState::ComposeBroken;
    }
    RuntimeState::Healthy
}

/// Package facts the compose repair branch depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeFacts {
    pub plugin_installed: bool,
    pub versioned_available: bool,
    pub legacy_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "target", rename_all = "snake_case")]
pub enum RuntimeAction {
    /// Remove a package; already absent counts as done.
    RemovePackage(String),
    InstallPackages(Vec<String>),
    StartService(String),
    /// Fail the run unless compose works now.
    VerifyCompose,
}

impl fmt::Display for RuntimeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeAction::RemovePackage(name) => write!(f, "remove {name} (if installed)"),
            RuntimeAction::InstallPackages(names) => write!(f, "install {}", names.join(" ")),
            RuntimeAction::StartService(name) => write!(f, "enable and start service {name}"),
            RuntimeAction::VerifyCompose => f.write_str("verify `docker compose` works"),
        }
    }
}

/// Maps one observed state to the actions that move it toward healthy.
pub fn plan(
    state: RuntimeState,
    facts: &ComposeFacts,
    cfg: &RuntimeConfig,
) -> Result<Vec<RuntimeAction>, ProvisionError> {
    let install_runtime = [
        RuntimeAction::InstallPackages(vec![cfg.package.clone()]),
        RuntimeAction::StartService(cfg.service.clone()),
    ];
    match state {
        RuntimeState::Healthy => Ok(Vec::new()),
        RuntimeState::Absent => Ok(install_runtime.to_vec()),
        RuntimeState::ShimmedByIncompatibleRuntime => {
            let mut actions = vec![RuntimeAction::RemovePackage(cfg.shim_package.clone())];
            actions.extend(install_runtime);
            Ok(actions)
        }
        RuntimeState::ComposeBroken => {
            let mut actions = Vec::new();
            // A half-installed plugin shadows `docker compose`.
            if facts.plugin_installed {
                actions.push(RuntimeAction::RemovePackage(
                    cfg.compose_plugin_package.clone(),
                ));
            }
            if facts.versioned_available {
                actions.push(RuntimeAction::InstallPackages(vec![
                    cfg.compose_versioned_package.clone(),
                ]));
                actions.push(RuntimeAction::RemovePackage(
                    cfg.compose_plugin_package.clone(),
                ));
            } else if facts.legacy_available {
                actions.push(RuntimeAction::InstallPackages(vec![
                    cfg.compose_legacy_package.clone(),
                ]));
            } else {
                return Err(ProvisionError::NoComposePackage {
                    versioned: cfg.compose_versioned_package.clone(),
                    legacy: cfg.compose_legacy_package.clone(),
                });
            }
            actions.push(RuntimeAction::VerifyCompose);
            Ok(actions)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeReport {
    pub initial_state: RuntimeState,
    pub actions: Vec<RuntimeAction>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub group_created: bool,
    pub membership_added: bool,
    pub daemon_reachable: bool,
    pub warnings: Vec<String>,
}

pub struct Reconciler<'a, E: Executor, C: Clock> {
    runner: &'a Runner<'a, E>,
    apt: &'a Apt<'a, E, C>,
    cfg: &'a RuntimeConfig,
}

impl<'a, E: Executor, C: Clock> Reconciler<'a, E, C> {
    pub fn new(runner: &'a Runner<'a, E>, apt: &'a Apt<'a, E, C>, cfg: &'a RuntimeConfig) -> Self {
        Self { runner, apt, cfg }
    }

    pub fn probe(&self) -> RuntimeProbe {
        let docker_on_path = self.runner.has_program("docker");
        if !docker_on_path {
            return RuntimeProbe::default();
        }
        let version = self
            .runner
            .probe(&CommandSpec::new("docker", ["--version"]));
        let version_text = format!(
            "{}{}",
            version.stdout_text(),
            String::from_utf8_lossy(&version.stderr)
        );
        let compose_ok = version.success() && self.compose_works();
        RuntimeProbe {
            docker_on_path,
            version_ok: version.success(),
            version_text,
            compose_ok,
        }
    }

    pub fn observe(&self) -> RuntimeState {
        let state = classify(&self.probe(), &self.cfg.shim_signature);
        debug!(%state, "observed container runtime");
        state
    }

    /// `docker compose`, or the standalone `docker-compose` binary.
    fn compose_works(&self) -> bool {
        if self
            .runner
            .probe(&CommandSpec::new("docker", ["compose", "version"]))
            .success()
        {
            return true;
        }
        self.runner.has_program("docker-compose")
            && self
                .runner
                .probe(&CommandSpec::new("docker-compose", ["version"]))
                .success()
    }

    pub fn compose_facts(&self, state: RuntimeState) -> ComposeFacts {
        if state != RuntimeState::ComposeBroken {
            return ComposeFacts::default();
        }
        ComposeFacts {
            plugin_installed: self.apt.is_installed(&self.cfg.compose_plugin_package),
            versioned_available: self.apt.is_available(&self.cfg.compose_versioned_package),
            legacy_available: self.apt.is_available(&self.cfg.compose_legacy_package),
        }
    }

    /// First-pass plan without touching the system.
    pub fn preview(&self) -> (RuntimeState, Result<Vec<RuntimeAction>, ProvisionError>) {
        let state = self.observe();
        let facts = self.compose_facts(state);
        (state, plan(state, &facts, self.cfg))
    }

    pub fn reconcile(&self) -> Result<RuntimeReport, ProvisionError> {
        let initial_state = self.observe();
        let mut state = initial_state;
        let mut report = RuntimeReport {
            initial_state,
            actions: Vec::new(),
            warnings: Vec::new(),
        };
        for _ in 0..MAX_PASSES {
            if state == RuntimeState::Healthy {
                break;
            }
            let facts = self.compose_facts(state);
            let actions = plan(state, &facts, self.cfg)?;
            info!(%state, ?actions, "reconciling container runtime");
            for action in &actions {
                if let Some(warning) = self.apply(action)? {
                    report.warnings.push(warning);
                }
            }
            report.actions.extend(actions);
            state = self.observe();
        }
        if state != RuntimeState::Healthy {
            return Err(ProvisionError::ReconcileDiverged(state.to_string()));
        }
        Ok(report)
    }

    fn apply(&self, action: &RuntimeAction) -> Result<Option<String>, ProvisionError> {
        match action {
            RuntimeAction::RemovePackage(name) => {
                self.apt.remove(name)?;
                Ok(None)
            }
            RuntimeAction::InstallPackages(names) => {
                self.apt.install(names)?;
                Ok(None)
            }
            RuntimeAction::StartService(name) => Ok(self.start_service(name)),
            RuntimeAction::VerifyCompose => {
                if self.compose_works() {
                    Ok(None)
                } else {
                    Err(ProvisionError::ComposeStillBroken)
                }
            }
        }
    }

    /// Degraded outcomes come back as a warning instead of an error.
    fn start_service(&self, service: &str) -> Option<String> {
        let has_systemctl = self.runner.has_program("systemctl");
        if has_systemctl
            && self
                .runner
                .probe(&CommandSpec::root("systemctl", ["enable", "--now", service]))
                .success()
        {
            return None;
        }
        let has_service = self.runner.has_program("service");
        if has_service
            && self
                .runner
                .probe(&CommandSpec::root("service", [service, "start"]))
                .success()
        {
            return None;
        }
        let message = if !has_systemctl && !has_service {
            format!("no service manager found; start the {service} daemon manually")
        } else {
            format!("could not start the {service} service; start the daemon manually")
        };
        self.runner.warn(&message);
        Some(message)
    }

    /// Group existence and target membership, evaluated on every run.
    pub fn ensure_group(&self) -> Result<GroupReport, ProvisionError> {
        let group = &self.cfg.group;
        let user = &self.runner.ctx().target_user;
        let mut report = GroupReport::default();

        if !self
            .runner
            .probe(&CommandSpec::new("getent", ["group", group.as_str()]))
            .success()
        {
            let spec = CommandSpec::root("groupadd", [group.as_str()]);
            let out = self.runner.probe(&spec);
            // 9: created concurrently by someone else.
            match out.status_code {
                0 => report.group_created = true,
                9 => debug!(group = %group, "group appeared concurrently"),
                status => {
                    return Err(ProvisionError::CommandFailed {
                        description: format!("Create group {group}"),
                        command: self.runner.ctx().wrap(&spec).render(),
                        status,
                    })
                }
            }
        }

        let groups = self
            .runner
            .probe(&CommandSpec::new("id", ["-nG", user.as_str()]))
            .stdout_text();
        if !groups.split_whitespace().any(|name| name == group) {
            self.runner.run(
                &format!("Add {user} to group {group}"),
                &CommandSpec::root("usermod", ["-aG", group.as_str(), user.as_str()]),
            )?;
            report.membership_added = true;
            let message = format!(
                "{user} was added to the {group} group; log out and back in for it to take effect"
            );
            self.runner.warn(&message);
            report.warnings.push(message);
        }

        // Membership only applies to new login sessions, so failure is expected here.
        report.daemon_reachable = match self
            .runner
            .run_as_user(&format!("Reach the docker daemon as {user}"), "docker info")
        {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "daemon check as target user failed");
                false
            }
        };
        if !report.daemon_reachable {
            let message = format!(
                "`docker info` as {user} failed; this usually clears after a fresh login session"
            );
            self.runner.warn(&message);
            report.warnings.push(message);
        }
        Ok(report)
    }
}
