//! Scripted executor and clock for unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::apt::Clock;
use crate::exec::{CommandOutput, CommandSpec, Executor};

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    SpawnError,
}

/// Responses are keyed by the rendered command line. Each key holds a queue;
/// the last queued response repeats. Unscripted commands succeed silently.
#[derive(Default)]
pub struct FakeExecutor {
    scripted: RefCell<BTreeMap<String, VecDeque<Scripted>>>,
    calls: RefCell<Vec<CommandSpec>>,
    missing_programs: RefCell<BTreeSet<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: &str, status_code: i32, stdout: &str) {
        self.push(
            command,
            Scripted::Output(CommandOutput {
                status_code,
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
                duration: Duration::from_millis(1),
            }),
        );
    }

    /// Drops anything already scripted for `command` before responding.
    pub fn replace(&self, command: &str, status_code: i32, stdout: &str) {
        self.scripted.borrow_mut().remove(command);
        self.respond(command, status_code, stdout);
    }

    pub fn fail_spawn(&self, command: &str) {
        self.push(command, Scripted::SpawnError);
    }

    /// Marks the default dpkg/apt lock files as not held.
    pub fn free_locks(&self) {
        for lock in crate::config::LockConfig::default().files {
            self.respond(&format!("fuser {lock}"), 1, "");
        }
    }

    pub fn remove_program(&self, program: &str) {
        self.missing_programs.borrow_mut().insert(program.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(CommandSpec::render).collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == command).count()
    }

    pub fn position(&self, command: &str) -> Option<usize> {
        self.commands().iter().position(|c| c == command)
    }

    pub fn stdin_of(&self, command: &str) -> Option<String> {
        self.calls
            .borrow()
            .iter()
            .find(|spec| spec.render() == command)
            .and_then(|spec| spec.stdin.clone())
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
    }

    fn push(&self, command: &str, response: Scripted) {
        self.scripted
            .borrow_mut()
            .entry(command.to_string())
            .or_default()
            .push_back(response);
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
        self.calls.borrow_mut().push(spec.clone());
        let key = spec.render();
        let mut scripted = self.scripted.borrow_mut();
        let response = match scripted.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        match response {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::SpawnError) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", spec.program),
            )),
            None => Ok(CommandOutput {
                status_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
                duration: Duration::from_millis(1),
            }),
        }
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        if self.missing_programs.borrow().contains(program) {
            return None;
        }
        Some(PathBuf::from("/usr/bin").join(program))
    }
}

#[derive(Default)]
pub struct FakeClock {
    pub slept: RefCell<Vec<Duration>>,
}

impl FakeClock {
    pub fn total(&self) -> Duration {
        self.slept.borrow().iter().sum()
    }
}

impl Clock for FakeClock {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}
