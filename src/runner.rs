use tracing::{debug, warn};

use crate::error::ProvisionError;
use crate::exec::{CommandOutput, CommandSpec, Executor, Privilege};
use crate::identity::{self, ExecutionContext};
use crate::session_log::SessionLog;

const SPAWN_FAILURE_STATUS: i32 = 127;

/// Executes commands on behalf of the target identity and records everything
/// in the session log.
pub struct Runner<'a, E: Executor> {
    executor: &'a E,
    ctx: &'a ExecutionContext,
    log: &'a SessionLog,
}

impl<'a, E: Executor> Runner<'a, E> {
    pub fn new(executor: &'a E, ctx: &'a ExecutionContext, log: &'a SessionLog) -> Self {
        Self { executor, ctx, log }
    }

    pub fn ctx(&self) -> &ExecutionContext {
        self.ctx
    }

    pub fn executor(&self) -> &E {
        self.executor
    }

    /// Runs a step whose failure is fatal.
    pub fn run(&self, description: &str, spec: &CommandSpec) -> Result<CommandOutput, ProvisionError> {
        if spec.privilege == Privilege::Root {
            self.refresh_elevation()?;
        }
        let wrapped = self.ctx.wrap(spec);
        let command = wrapped.render();
        self.log.append_line(&format!("==> {description}"));
        self.log.append_line(&format!("$ {command}"));
        let output = self
            .executor
            .execute(&wrapped)
            .map_err(|source| {
                self.log.append_line(&format!("spawn failed: {source}"));
                ProvisionError::Spawn {
                    command: command.clone(),
                    source,
                }
            })?;
        self.record(&output);
        if !output.success() {
            return Err(ProvisionError::CommandFailed {
                description: description.to_string(),
                command,
                status: output.status_code,
            });
        }
        Ok(output)
    }

    /// Same contract as [`Runner::run`], as the target account through its login shell.
    pub fn run_as_user(&self, description: &str, script: &str) -> Result<CommandOutput, ProvisionError> {
        self.run(description, &CommandSpec::user_script(script))
    }

    /// Runs a query whose exit status is information, not failure. A command
    /// that cannot be spawned reports status 127.
    pub fn probe(&self, spec: &CommandSpec) -> CommandOutput {
        let wrapped = self.ctx.wrap(spec);
        let command = wrapped.render();
        self.log.append_line(&format!("$ {command}"));
        match self.executor.execute(&wrapped) {
            Ok(output) => {
                self.record(&output);
                output
            }
            Err(err) => {
                debug!(%command, error = %err, "probe could not be spawned");
                self.log.append_line(&format!("spawn failed: {err}"));
                CommandOutput {
                    status_code: SPAWN_FAILURE_STATUS,
                    stdout: Vec::new(),
                    stderr: err.to_string().into_bytes(),
                    duration: Default::default(),
                }
            }
        }
    }

    /// Keeps the sudo timestamp alive across long runs. Prompts again through
    /// `sudo -v` once `sudo -n -v` reports it has expired.
    pub fn refresh_elevation(&self) -> Result<(), ProvisionError> {
        if self.ctx.is_root {
            return Ok(());
        }
        if self.probe(&CommandSpec::new("sudo", ["-n", "-v"])).success() {
            return Ok(());
        }
        self.warn("sudo credentials expired; asking again");
        identity::ensure_elevation(self.executor, self.ctx)
    }

    pub fn has_program(&self, program: &str) -> bool {
        self.executor.which(program).is_some()
    }

    pub fn warn(&self, message: &str) {
        warn!("{message}");
        self.log.append_line(&format!("WARNING: {message}"));
    }

    fn record(&self, output: &CommandOutput) {
        self.log.append_bytes(&output.combined());
        self.log.append_line(&format!(
            "[exit {} in {:.2}s]",
            output.status_code,
            output.duration.as_secs_f64()
        ));
    }
}
