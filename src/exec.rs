use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Whose authority a command runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// As the provisioner process itself, no rewriting.
    Current,
    /// As the superuser; `sudo` is prefixed when the process is not root.
    Root,
    /// As the target account, through its login shell.
    TargetUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub privilege: Privilege,
    /// Inherit the terminal instead of capturing (password prompts).
    pub interactive: bool,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            stdin: None,
            privilege: Privilege::Current,
            interactive: false,
        }
    }

    pub fn root<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(program, args).with_privilege(Privilege::Root)
    }

    /// A shell snippet to run as the target account.
    pub fn user_script(script: &str) -> Self {
        Self::new("sh", ["-c", script]).with_privilege(Privilege::TargetUser)
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Shell-like rendering for logs and error messages.
    pub fn render(&self) -> String {
        fn shell_quote(part: &str) -> String {
            if part.is_empty() {
                return "\"\"".to_string();
            }
            if part.chars().any(|c| c.is_whitespace() || c == '"') {
                return format!("\"{}\"", part.replace('"', "\\\""));
            }
            part.to_string()
        }
        let mut parts = Vec::with_capacity(self.args.len() + self.env.len() + 1);
        for (key, value) in &self.env {
            parts.push(format!("{key}={}", shell_quote(value)));
        }
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// stdout followed by stderr, as a terminal would show them.
    pub fn combined(&self) -> Vec<u8> {
        let mut out = self.stdout.clone();
        out.extend_from_slice(&self.stderr);
        out
    }
}

/// Administrative tools live here and a normal user's PATH often omits them.
const SBIN_DIRS: [&str; 3] = ["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// `path` with any missing sbin directory appended.
pub fn search_path(path: Option<&OsStr>) -> OsString {
    let mut dirs: Vec<PathBuf> = path.map(|p| env::split_paths(p).collect()).unwrap_or_default();
    for dir in SBIN_DIRS {
        let dir = PathBuf::from(dir);
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    env::join_paths(dirs).unwrap_or_default()
}

pub trait Executor {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error>;

    fn which(&self, program: &str) -> Option<PathBuf>;
}

pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
        let started = Instant::now();
        let program = if spec.program.contains('/') {
            PathBuf::from(&spec.program)
        } else {
            self.which(&spec.program)
                .unwrap_or_else(|| PathBuf::from(&spec.program))
        };
        let mut cmd = Command::new(program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        if spec.interactive {
            let status = cmd.status()?;
            return Ok(CommandOutput {
                status_code: status.code().unwrap_or(if status.success() { 0 } else { 1 }),
                stdout: Vec::new(),
                stderr: Vec::new(),
                duration: started.elapsed(),
            });
        }

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;
        if let Some(input) = &spec.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input)?;
            }
        }
        let output = child.wait_with_output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration: started.elapsed(),
        })
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        resolve_program(program, env::var_os("PATH").as_deref())
    }
}

/// Looks `program` up in `path` plus the sbin directories.
pub fn resolve_program(program: &str, path: Option<&OsStr>) -> Option<PathBuf> {
    let cwd = env::current_dir().unwrap_or_else(|_| Path::new("/").to_path_buf());
    which::which_in(program, Some(search_path(path)), cwd).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_quotes_whitespace_and_prefixes_env() {
        let spec = CommandSpec::root("apt-get", ["install", "-y", "git"])
            .with_env("DEBIAN_FRONTEND", "noninteractive");
        assert_eq!(
            spec.render(),
            "DEBIAN_FRONTEND=noninteractive apt-get install -y git"
        );

        let spec = CommandSpec::user_script("docker info");
        assert_eq!(spec.render(), "sh -c \"docker info\"");
    }

    #[test]
    fn system_executor_captures_status_and_stdin() {
        let runner = SystemExecutor;
        let out = runner
            .execute(&CommandSpec::new("cat", Vec::<String>::new()).with_stdin("hello"))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_text(), "hello");

        let out = runner
            .execute(&CommandSpec::new("sh", ["-c", "echo oops >&2; exit 3"]))
            .unwrap();
        assert_eq!(out.status_code, 3);
        assert_eq!(String::from_utf8_lossy(&out.combined()), "oops\n");
    }

    #[test]
    fn search_path_appends_sbin_dirs_once() {
        assert_eq!(
            search_path(Some(OsStr::new("/usr/bin:/usr/sbin:/bin"))),
            OsString::from("/usr/bin:/usr/sbin:/bin:/usr/local/sbin:/sbin")
        );
        assert_eq!(
            search_path(None),
            OsString::from("/usr/local/sbin:/usr/sbin:/sbin")
        );
    }

    #[test]
    fn sbin_tools_resolve_without_sbin_on_path() {
        let Some(expected) = ["/usr/sbin/sysctl", "/sbin/sysctl"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
        else {
            return;
        };
        let found = resolve_program("sysctl", Some(OsStr::new("/nonexistent")))
            .expect("sysctl resolved through sbin");
        assert_eq!(
            std::fs::canonicalize(found).unwrap(),
            std::fs::canonicalize(expected).unwrap()
        );
        assert!(resolve_program("definitely-not-a-real-binary-xyz", None).is_none());
    }

    #[test]
    fn system_executor_reports_missing_program() {
        let err = SystemExecutor
            .execute(&CommandSpec::new("definitely-not-a-real-binary-xyz", ["x"]))
            .expect_err("spawn should fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
