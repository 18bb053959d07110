//! Run sequencing: identity, base packages, container runtime, low-port
//! capability. Each phase must succeed before the next one starts.

use std::io::IsTerminal;

use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use tracing::{info, warn};

use crate::apt::{Apt, Clock, InstallReport};
use crate::capability::{CapabilityFixer, CapabilityOutcome, CapabilityState};
use crate::config::{Config, SourceConfig};
use crate::error::ProvisionError;
use crate::exec::{CommandSpec, Executor};
use crate::identity::{self, ExecutionContext, InvocationEnv};
use crate::runner::Runner;
use crate::runtime::{GroupReport, Reconciler, RuntimeAction, RuntimeReport, RuntimeState};
use crate::session_log::SessionLog;
use crate::ui::Ui;

const TOTAL_PHASES: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    pub dry_run: bool,
}

/// Gate in front of the first mutation.
pub trait Confirmer {
    fn confirm(&self, prompt: &str) -> Result<bool, ProvisionError>;
}

/// Asks on an interactive terminal; everything else proceeds.
pub struct TerminalConfirmer {
    pub assume_yes: bool,
    pub json: bool,
}

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, prompt: &str) -> Result<bool, ProvisionError> {
        if self.assume_yes || self.json || !std::io::stdin().is_terminal() {
            return Ok(true);
        }
        let answer = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(true)
            .interact()?;
        Ok(answer)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionSummary {
    pub target_user: String,
    pub target_home: String,
    pub packages: InstallReport,
    pub runtime: RuntimeReport,
    pub group: GroupReport,
    pub capability: CapabilityOutcome,
    pub deferred_steps: Vec<String>,
    pub source: SourceConfig,
    pub session_log: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionPlan {
    pub target_user: String,
    pub packages_to_install: Vec<String>,
    pub packages_present: Vec<String>,
    pub packages_unavailable: Vec<String>,
    pub runtime_state: RuntimeState,
    pub runtime_actions: Vec<RuntimeAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_blocker: Option<String>,
    pub capability: CapabilityState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Applied(ProvisionSummary),
    Planned(ProvisionPlan),
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub target_user: String,
    pub target_home: String,
    pub is_root: bool,
    pub has_sudo: bool,
    pub runtime_state: RuntimeState,
    pub runtime_version: String,
    pub group_member: bool,
    pub capability: CapabilityState,
    pub session_log: String,
}

pub struct Provisioner<'a, E: Executor, C: Clock> {
    executor: &'a E,
    clock: &'a C,
    cfg: &'a Config,
    log: &'a SessionLog,
    ui: &'a Ui,
}

impl<'a, E: Executor, C: Clock> Provisioner<'a, E, C> {
    pub fn new(executor: &'a E, clock: &'a C, cfg: &'a Config, log: &'a SessionLog, ui: &'a Ui) -> Self {
        Self {
            executor,
            clock,
            cfg,
            log,
            ui,
        }
    }

    pub fn run(
        &self,
        env: &InvocationEnv,
        options: ProvisionOptions,
        confirmer: &dyn Confirmer,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        self.ui.phase(1, TOTAL_PHASES, "Resolve target identity");
        let ctx = self.resolve_identity(env, !options.dry_run)?;
        let runner = Runner::new(self.executor, &ctx, self.log);
        let apt = Apt::new(&runner, self.clock, &self.cfg.lock);

        if options.dry_run {
            return Ok(ProvisionOutcome::Planned(self.plan(&runner, &apt)));
        }

        let prompt = format!(
            "Install packages, container runtime and port access for {}?",
            ctx.target_user
        );
        if !confirmer.confirm(&prompt)? {
            return Err(ProvisionError::Aborted);
        }
        identity::ensure_elevation(self.executor, &ctx)?;
        self.ui.ok("elevated privileges available");

        self.ui.phase(2, TOTAL_PHASES, "Base packages");
        apt.update()?;
        let packages = apt.install_available(&self.cfg.packages.base)?;
        for name in &packages.skipped {
            self.ui.warn(&format!("{name} is not available on this distribution; skipped"));
        }
        self.ui.ok(&format!(
            "{} installed, {} already present",
            packages.installed.len(),
            packages.already_present.len()
        ));

        self.ui.phase(3, TOTAL_PHASES, "Container runtime");
        let reconciler = Reconciler::new(&runner, &apt, &self.cfg.runtime);
        let runtime = reconciler.reconcile()?;
        for action in &runtime.actions {
            self.ui.note(&action.to_string());
        }
        let group = reconciler.ensure_group()?;
        for message in runtime.warnings.iter().chain(&group.warnings) {
            self.ui.warn(message);
        }
        self.ui.ok(&format!("runtime healthy (was {})", runtime.initial_state));

        self.ui.phase(4, TOTAL_PHASES, "Low-port binding");
        let capability = CapabilityFixer::new(&runner, &self.cfg.capability).fix()?;
        match &capability {
            CapabilityOutcome::AlreadyPresent { path } => {
                self.ui.ok(&format!("{} already set on {path}", self.cfg.capability.capability))
            }
            CapabilityOutcome::Granted { path } => {
                self.ui.ok(&format!("{} granted on {path}", self.cfg.capability.capability))
            }
            CapabilityOutcome::Fallback { file, .. } => self.ui.warn(&format!(
                "unprivileged ports from {} opened system-wide via {file}",
                self.cfg.capability.unprivileged_port_start
            )),
        }

        let deferred_steps = self.deferred_steps(&ctx, &group, &capability);
        info!(user = %ctx.target_user, deferred = deferred_steps.len(), "provisioning complete");
        Ok(ProvisionOutcome::Applied(ProvisionSummary {
            target_user: ctx.target_user.clone(),
            target_home: ctx.target_home.display().to_string(),
            packages,
            runtime,
            group,
            capability,
            deferred_steps,
            source: self.cfg.source.clone(),
            session_log: self.log.path().display().to_string(),
        }))
    }

    /// Read-only view of the machine for the resolved target.
    pub fn status(&self, env: &InvocationEnv) -> Result<StatusReport, ProvisionError> {
        let ctx = identity::resolve(self.executor, env)?;
        let runner = Runner::new(self.executor, &ctx, self.log);
        let apt = Apt::new(&runner, self.clock, &self.cfg.lock);
        let reconciler = Reconciler::new(&runner, &apt, &self.cfg.runtime);
        let probe = reconciler.probe();
        let runtime_state = crate::runtime::classify(&probe, &self.cfg.runtime.shim_signature);
        let group_member = runner
            .probe(&CommandSpec::new("id", ["-nG", ctx.target_user.as_str()]))
            .stdout_text()
            .split_whitespace()
            .any(|name| name == self.cfg.runtime.group);
        let capability = CapabilityFixer::new(&runner, &self.cfg.capability).observe();
        Ok(StatusReport {
            target_user: ctx.target_user.clone(),
            target_home: ctx.target_home.display().to_string(),
            is_root: ctx.is_root,
            has_sudo: ctx.has_sudo,
            runtime_state,
            runtime_version: probe.version_text.trim().to_string(),
            group_member,
            capability,
            session_log: self.log.path().display().to_string(),
        })
    }

    /// Resolves the target. With `hand_log` set, a root run also gives the
    /// session log to the target account.
    fn resolve_identity(
        &self,
        env: &InvocationEnv,
        hand_log: bool,
    ) -> Result<ExecutionContext, ProvisionError> {
        let ctx = identity::resolve(self.executor, env)?;
        #[cfg(unix)]
        if hand_log && ctx.is_root {
            if let Err(err) = self.log.hand_to(ctx.uid, ctx.gid) {
                warn!(error = %err, "could not hand session log to target user");
            }
        }
        self.ui.ok(&format!(
            "target user {} ({})",
            ctx.target_user,
            ctx.target_home.display()
        ));
        Ok(ctx)
    }

    fn plan(&self, runner: &Runner<'_, E>, apt: &Apt<'_, E, C>) -> ProvisionPlan {
        let mut packages_to_install = Vec::new();
        let mut packages_present = Vec::new();
        let mut packages_unavailable = Vec::new();
        for name in &self.cfg.packages.base {
            if apt.is_installed(name) {
                packages_present.push(name.clone());
            } else if apt.is_available(name) {
                packages_to_install.push(name.clone());
            } else {
                packages_unavailable.push(name.clone());
            }
        }

        let reconciler = Reconciler::new(runner, apt, &self.cfg.runtime);
        let (runtime_state, planned) = reconciler.preview();
        let (runtime_actions, runtime_blocker) = match planned {
            Ok(actions) => (actions, None),
            Err(err) => (Vec::new(), Some(err.to_string())),
        };
        let capability = CapabilityFixer::new(runner, &self.cfg.capability).observe();

        self.ui.note(&format!("runtime: {runtime_state}"));
        for action in &runtime_actions {
            self.ui.note(&format!("would {action}"));
        }
        if let Some(blocker) = &runtime_blocker {
            self.ui.warn(blocker);
        }

        ProvisionPlan {
            target_user: runner.ctx().target_user.clone(),
            packages_to_install,
            packages_present,
            packages_unavailable,
            runtime_state,
            runtime_actions,
            runtime_blocker,
            capability,
        }
    }

    fn deferred_steps(
        &self,
        ctx: &ExecutionContext,
        group: &GroupReport,
        capability: &CapabilityOutcome,
    ) -> Vec<String> {
        let mut steps = Vec::new();
        if group.membership_added || !group.daemon_reachable {
            steps.push(format!(
                "log out and back in as {} so membership in the {} group takes effect",
                ctx.target_user, self.cfg.runtime.group
            ));
        }
        if let CapabilityOutcome::Fallback { file, .. } = capability {
            steps.push(format!(
                "ports from {} are open to every user; remove {file} once {} can carry {}",
                self.cfg.capability.unprivileged_port_start,
                self.cfg.capability.executable,
                self.cfg.capability.capability
            ));
        }
        steps.push(format!(
            "install WebVerse from {} ({})",
            self.cfg.source.repo, self.cfg.source.git_ref
        ));
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeClock, FakeExecutor};
    use std::cell::Cell;
    use tempfile::tempdir;

    struct Answer(bool, Cell<usize>);

    impl Confirmer for Answer {
        fn confirm(&self, _prompt: &str) -> Result<bool, ProvisionError> {
            self.1.set(self.1.get() + 1);
            Ok(self.0)
        }
    }

    fn yes() -> Answer {
        Answer(true, Cell::new(0))
    }

    fn via_sudo() -> InvocationEnv {
        InvocationEnv {
            sudo_user: Some("alice".to_string()),
        }
    }

    /// A host where every phase is already satisfied.
    fn converged_host() -> FakeExecutor {
        let fake = FakeExecutor::new();
        fake.respond("id -u", 0, "0\n");
        fake.respond("id -un", 0, "root\n");
        fake.respond(
            "getent passwd alice",
            0,
            "alice:x:1000:1000::/home/alice:/bin/bash\n",
        );
        fake.free_locks();
        for name in Config::default().packages.base {
            fake.respond(
                &format!("dpkg-query -W -f=${{Status}} {name}"),
                0,
                "install ok installed",
            );
        }
        fake.respond("docker --version", 0, "Docker version 24.0.7\n");
        fake.respond("id -nG alice", 0, "alice sudo docker\n");
        fake.respond("readlink -f /usr/bin/python3", 0, "/usr/bin/python3.11\n");
        fake.respond(
            "getcap /usr/bin/python3",
            0,
            "/usr/bin/python3 cap_net_bind_service=ep\n",
        );
        fake
    }

    fn mutations(fake: &FakeExecutor) -> Vec<String> {
        fake.commands()
            .into_iter()
            .filter(|c| {
                c.contains("apt-get install")
                    || c.contains("apt-get remove")
                    || c.starts_with("usermod")
                    || c.starts_with("groupadd")
                    || c.starts_with("setcap")
                    || c.starts_with("tee")
                    || c.starts_with("sysctl --system")
            })
            .collect()
    }

    #[test]
    fn root_without_invoking_user_fails_before_any_mutation() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let fake = FakeExecutor::new();
        fake.respond("id -u", 0, "0\n");
        fake.respond("id -un", 0, "root\n");
        let cfg = Config::default();
        let clock = FakeClock::default();
        let ui = Ui::new(true);
        let confirm = yes();

        let err = Provisioner::new(&fake, &clock, &cfg, &log, &ui)
            .run(&InvocationEnv::default(), ProvisionOptions::default(), &confirm)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::RootWithoutInvokingUser));
        assert_eq!(fake.commands(), vec!["id -u", "id -un"]);
        assert_eq!(confirm.1.get(), 0);
    }

    #[test]
    fn converged_host_is_left_untouched_on_repeat_runs() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let fake = converged_host();
        let cfg = Config::default();
        let clock = FakeClock::default();
        let ui = Ui::new(true);

        for _ in 0..2 {
            let outcome = Provisioner::new(&fake, &clock, &cfg, &log, &ui)
                .run(&via_sudo(), ProvisionOptions::default(), &yes())
                .unwrap();
            let ProvisionOutcome::Applied(summary) = outcome else {
                panic!("expected an applied run");
            };
            assert!(summary.packages.installed.is_empty());
            assert_eq!(summary.runtime.initial_state, RuntimeState::Healthy);
            assert!(summary.runtime.actions.is_empty());
            assert!(!summary.group.membership_added);
            assert!(matches!(
                summary.capability,
                CapabilityOutcome::AlreadyPresent { .. }
            ));
            assert_eq!(summary.deferred_steps.len(), 1);
        }
        assert!(mutations(&fake).is_empty(), "{:?}", mutations(&fake));
        assert_eq!(fake.count("DEBIAN_FRONTEND=noninteractive apt-get update"), 2);
    }

    #[test]
    fn phases_run_in_fixed_order() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let fake = converged_host();
        fake.replace("id -nG alice", 0, "alice\n");
        let cfg = Config::default();
        let clock = FakeClock::default();
        let ui = Ui::new(true);

        let outcome = Provisioner::new(&fake, &clock, &cfg, &log, &ui)
            .run(&via_sudo(), ProvisionOptions::default(), &yes())
            .unwrap();
        let update = fake
            .position("DEBIAN_FRONTEND=noninteractive apt-get update")
            .unwrap();
        let docker = fake.position("docker --version").unwrap();
        let usermod = fake.position("usermod -aG docker alice").unwrap();
        let getcap = fake.position("getcap /usr/bin/python3").unwrap();
        assert!(update < docker && docker < usermod && usermod < getcap);

        let ProvisionOutcome::Applied(summary) = outcome else {
            panic!("expected an applied run");
        };
        assert!(summary.group.membership_added);
        assert!(summary.deferred_steps[0].contains("log out and back in"));
    }

    #[test]
    fn dry_run_only_observes() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let fake = converged_host();
        fake.replace("docker --version", 0, "podman version 4.9.3\n");
        fake.replace("getcap /usr/bin/python3", 0, "");
        fake.respond("getcap /usr/bin/python3.11", 0, "");
        fake.replace("dpkg-query -W -f=${Status} git", 1, "");
        fake.respond("apt-cache policy git", 0, "git:\n  Candidate: 1:2.43.0\n");
        let cfg = Config::default();
        let clock = FakeClock::default();
        let ui = Ui::new(true);
        let confirm = yes();

        let outcome = Provisioner::new(&fake, &clock, &cfg, &log, &ui)
            .run(&via_sudo(), ProvisionOptions { dry_run: true }, &confirm)
            .unwrap();
        let ProvisionOutcome::Planned(plan) = outcome else {
            panic!("expected a plan");
        };
        assert_eq!(plan.packages_to_install, vec!["git".to_string()]);
        assert_eq!(plan.runtime_state, RuntimeState::ShimmedByIncompatibleRuntime);
        assert_eq!(
            plan.runtime_actions[0],
            RuntimeAction::RemovePackage("podman-docker".to_string())
        );
        assert!(!plan.capability.present);
        assert_eq!(confirm.1.get(), 0);
        assert!(mutations(&fake).is_empty());
        assert!(!fake.commands().iter().any(|c| c.contains("apt-get")));
    }

    #[cfg(unix)]
    #[test]
    fn dry_run_leaves_session_log_ownership_alone() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let owner = std::fs::metadata(log.path()).unwrap().uid();
        let fake = converged_host();
        let cfg = Config::default();
        let clock = FakeClock::default();
        let ui = Ui::new(true);

        Provisioner::new(&fake, &clock, &cfg, &log, &ui)
            .run(&via_sudo(), ProvisionOptions { dry_run: true }, &yes())
            .unwrap();
        assert_eq!(std::fs::metadata(log.path()).unwrap().uid(), owner);
    }

    #[test]
    fn declining_the_prompt_aborts_before_elevation() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let fake = converged_host();
        let cfg = Config::default();
        let clock = FakeClock::default();
        let ui = Ui::new(true);

        let err = Provisioner::new(&fake, &clock, &cfg, &log, &ui)
            .run(
                &via_sudo(),
                ProvisionOptions::default(),
                &Answer(false, Cell::new(0)),
            )
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Aborted));
        assert_eq!(fake.commands().len(), 3);
    }

    #[test]
    fn failing_package_install_stops_later_phases() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let fake = converged_host();
        fake.replace("dpkg-query -W -f=${Status} curl", 1, "");
        fake.respond("apt-cache policy curl", 0, "curl:\n  Candidate: 8.5.0\n");
        fake.respond(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends curl",
            100,
            "E: Unable to correct problems, you have held broken packages.\n",
        );
        let cfg = Config::default();
        let clock = FakeClock::default();
        let ui = Ui::new(true);

        let err = Provisioner::new(&fake, &clock, &cfg, &log, &ui)
            .run(&via_sudo(), ProvisionOptions::default(), &yes())
            .unwrap_err();
        assert!(matches!(err, ProvisionError::CommandFailed { status: 100, .. }));
        assert!(fake.position("docker --version").is_none());
        assert!(log
            .tail(80)
            .iter()
            .any(|line| line.contains("held broken packages")));
    }

    #[test]
    fn status_reports_without_mutating() {
        let dir = tempdir().unwrap();
        let log = SessionLog::create(dir.path()).unwrap();
        let fake = converged_host();
        let cfg = Config::default();
        let clock = FakeClock::default();
        let ui = Ui::new(true);

        let report = Provisioner::new(&fake, &clock, &cfg, &log, &ui)
            .status(&via_sudo())
            .unwrap();
        assert_eq!(report.target_user, "alice");
        assert_eq!(report.runtime_state, RuntimeState::Healthy);
        assert!(report.group_member);
        assert!(report.capability.present);
        assert!(mutations(&fake).is_empty());
        assert!(!fake.commands().iter().any(|c| c.contains("apt-get")));
    }
}
