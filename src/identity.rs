//! Target identity resolution.
//!
//! Exactly one non-root account is chosen at startup. Root-scoped work is
//! elevated with `sudo` when the process is not already root, and user-scoped
//! work runs through that account's login shell.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::exec::{CommandSpec, Executor, Privilege};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub target_user: String,
    pub target_home: PathBuf,
    pub login_shell: String,
    pub uid: u32,
    pub gid: u32,
    pub is_root: bool,
    pub has_sudo: bool,
}

/// Inputs read from the process environment.
#[derive(Debug, Clone, Default)]
pub struct InvocationEnv {
    pub sudo_user: Option<String>,
}

impl InvocationEnv {
    pub fn from_process() -> Self {
        Self {
            sudo_user: std::env::var("SUDO_USER")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: String,
}

/// Parses one `getent passwd` line (`name:x:uid:gid:gecos:home:shell`).
pub fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    let fields: Vec<&str> = line.trim().split(':').collect();
    if fields.len() < 7 || fields[0].is_empty() {
        return None;
    }
    let shell = if fields[6].trim().is_empty() {
        "/bin/sh".to_string()
    } else {
        fields[6].trim().to_string()
    };
    Some(PasswdEntry {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        home: PathBuf::from(fields[5]),
        shell,
    })
}

/// Picks the target account name from the invoking identity. Pure.
pub fn choose_target(
    euid: u32,
    current_user: &str,
    env: &InvocationEnv,
) -> Result<String, ProvisionError> {
    if euid != 0 {
        return Ok(current_user.to_string());
    }
    match env.sudo_user.as_deref() {
        Some(user) if user != "root" => Ok(user.to_string()),
        _ => Err(ProvisionError::RootWithoutInvokingUser),
    }
}

/// Inspects the invoking identity and resolves the target account. Nothing
/// is mutated here.
pub fn resolve<E: Executor>(
    executor: &E,
    env: &InvocationEnv,
) -> Result<ExecutionContext, ProvisionError> {
    let euid_text = query(executor, "id", &["-u"])?;
    let euid: u32 = euid_text
        .trim()
        .parse()
        .map_err(|_| ProvisionError::Config(format!("unexpected `id -u` output: {euid_text}")))?;
    let current_user = query(executor, "id", &["-un"])?.trim().to_string();

    let target = choose_target(euid, &current_user, env)?;
    let entry = lookup_account(executor, &target)?;
    if entry.uid == 0 {
        return Err(ProvisionError::RootWithoutInvokingUser);
    }

    let is_root = euid == 0;
    info!(user = %entry.name, home = %entry.home.display(), is_root, "resolved target identity");
    Ok(ExecutionContext {
        target_user: entry.name,
        target_home: entry.home,
        login_shell: entry.shell,
        uid: entry.uid,
        gid: entry.gid,
        is_root,
        has_sudo: executor.which("sudo").is_some(),
    })
}

/// Verifies that root-scoped commands can run. When not root this runs
/// `sudo -v` so later `sudo -n` calls do not prompt.
pub fn ensure_elevation<E: Executor>(
    executor: &E,
    ctx: &ExecutionContext,
) -> Result<(), ProvisionError> {
    if ctx.is_root {
        return Ok(());
    }
    if !ctx.has_sudo {
        return Err(ProvisionError::NoElevation(
            "sudo is not installed; run this from an account with sudo access".to_string(),
        ));
    }
    let check = CommandSpec::new("sudo", ["-v"]).interactive();
    let out = executor.execute(&check).map_err(|source| ProvisionError::Spawn {
        command: check.render(),
        source,
    })?;
    if !out.success() {
        return Err(ProvisionError::NoElevation(format!(
            "`sudo -v` failed for {}",
            ctx.target_user
        )));
    }
    Ok(())
}

fn query<E: Executor>(executor: &E, program: &str, args: &[&str]) -> Result<String, ProvisionError> {
    let spec = CommandSpec::new(program, args.iter().copied());
    let out = executor.execute(&spec).map_err(|source| ProvisionError::Spawn {
        command: spec.render(),
        source,
    })?;
    if !out.success() {
        return Err(ProvisionError::CommandFailed {
            description: "Inspect invoking identity".to_string(),
            command: spec.render(),
            status: out.status_code,
        });
    }
    Ok(out.stdout_text())
}

fn lookup_account<E: Executor>(executor: &E, user: &str) -> Result<PasswdEntry, ProvisionError> {
    let spec = CommandSpec::new("getent", ["passwd", user]);
    let out = executor.execute(&spec).map_err(|source| ProvisionError::Spawn {
        command: spec.render(),
        source,
    })?;
    if !out.success() {
        return Err(ProvisionError::UnknownUser(user.to_string()));
    }
    let text = out.stdout_text();
    debug!(entry = %text.trim(), "account lookup");
    text.lines()
        .find_map(parse_passwd_line)
        .ok_or_else(|| ProvisionError::UnknownUser(user.to_string()))
}

pub fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

impl ExecutionContext {
    /// Rewrites a spec so it runs with the requested privilege from this
    /// process. The result always carries `Privilege::Current`.
    pub fn wrap(&self, spec: &CommandSpec) -> CommandSpec {
        let mut wrapped = spec.clone();
        wrapped.privilege = Privilege::Current;
        match spec.privilege {
            Privilege::Current => wrapped,
            Privilege::Root => {
                if self.is_root {
                    return wrapped;
                }
                let mut args = vec!["-n".to_string()];
                if !spec.env.is_empty() {
                    args.push("env".to_string());
                    for (key, value) in &spec.env {
                        args.push(format!("{key}={value}"));
                    }
                    wrapped.env.clear();
                } else {
                    args.push("--".to_string());
                }
                args.push(spec.program.clone());
                args.extend(spec.args.iter().cloned());
                wrapped.program = "sudo".to_string();
                wrapped.args = args;
                wrapped
            }
            Privilege::TargetUser => {
                let mut words = vec![shell_single_quote(&spec.program)];
                words.extend(spec.args.iter().map(|arg| shell_single_quote(arg)));
                let script = words.join(" ");
                let shell_args = vec![
                    self.login_shell.clone(),
                    "-lc".to_string(),
                    script,
                ];
                if self.is_root {
                    let mut args = vec![
                        "-u".to_string(),
                        self.target_user.clone(),
                        "-H".to_string(),
                        "--".to_string(),
                    ];
                    args.extend(shell_args);
                    wrapped.program = "sudo".to_string();
                    wrapped.args = args;
                } else {
                    wrapped.program = shell_args[0].clone();
                    wrapped.args = shell_args[1..].to_vec();
                }
                wrapped
            }
        }
    }
}
