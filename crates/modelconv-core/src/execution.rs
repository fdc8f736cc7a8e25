//! Scoped execution of one step with reproduction artifacts.
//!
//! An [`ExecutionContext`] owns two sibling files for a step: a standalone
//! bash script that re-runs the step's command outside the engine, and a
//! command file invoking that script with the exact arguments used. Both are
//! written on every exit path: explicitly through [`ExecutionContext::finish`]
//! or, when a step errors out or panics first, from `Drop`.

use std::fmt::Write as _;
use std::future::Future;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use container_env_manager::shell;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::StepError;

/// Result alias for step execution.
pub type StepResult<T> = std::result::Result<T, StepError>;

/// One program invocation, as it would be typed in a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<PathBuf>,
    /// Work done inside this process; `program` is only a label.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub in_process: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            in_process: false,
        }
    }

    /// Record of an in-process operation named `label`.
    pub fn in_process(label: impl Into<String>) -> Self {
        Self {
            in_process: true,
            ..Self::new(label)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Captured output of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Paths of the persisted reproduction pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reproduction {
    pub script_path: PathBuf,
    pub cmd_path: PathBuf,
}

/// Execution sandbox for exactly one step.
#[derive(Debug)]
pub struct ExecutionContext {
    script_path: PathBuf,
    cmd_path: PathBuf,
    verbose: bool,
    invocations: Vec<Invocation>,
    log: String,
    flushed: bool,
}

impl ExecutionContext {
    pub fn new(script_path: impl Into<PathBuf>, cmd_path: impl Into<PathBuf>, verbose: bool) -> Self {
        Self {
            script_path: script_path.into(),
            cmd_path: cmd_path.into(),
            verbose,
            invocations: Vec::new(),
            log: String::new(),
            flushed: false,
        }
    }

    /// Context writing `<step>.sh` and `<step>.cmd` into `workspace`.
    pub fn for_step(workspace: &Path, step: &str, verbose: bool) -> Self {
        Self::new(
            workspace.join(format!("{step}.sh")),
            workspace.join(format!("{step}.cmd")),
            verbose,
        )
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn cmd_path(&self) -> &Path {
        &self.cmd_path
    }

    /// Output captured so far.
    pub fn log(&self) -> &str {
        &self.log
    }

    /// Verbose-mode log file beside the script.
    pub fn log_path(&self) -> PathBuf {
        self.script_path.with_extension("log")
    }

    /// Run in-process work, recording `invocation` as its reproduction.
    pub async fn execute_local<T, Fut>(&mut self, invocation: Invocation, work: Fut) -> StepResult<T>
    where
        Fut: Future<Output = StepResult<T>>,
    {
        debug!(program = %invocation.program, "Executing in-process operation");
        self.invocations.push(invocation);
        let outcome = work.await;
        if let Err(e) = &outcome {
            self.append_log(&format!("error: {e}\n"));
        }
        outcome
    }

    /// Run an external program, capturing stdout and stderr.
    ///
    /// A non-zero exit is returned as [`StepError::CommandFailed`] after the
    /// output has been captured into the log.
    pub async fn execute_command(&mut self, invocation: Invocation) -> StepResult<CommandOutput> {
        debug!(program = %invocation.program, args = ?invocation.args, "Executing command");
        self.invocations.push(invocation.clone());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| StepError::Spawn {
                program: invocation.program.clone(),
                reason: e.to_string(),
            })?;

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        self.append_log(&result.stdout);
        self.append_log(&result.stderr);

        if !output.status.success() {
            return Err(StepError::CommandFailed {
                program: invocation.program,
                code: result.exit_code,
            });
        }
        Ok(result)
    }

    /// Persist the reproduction pair and release the context.
    pub fn finish(mut self) -> StepResult<Reproduction> {
        self.flush()?;
        Ok(Reproduction {
            script_path: self.script_path.clone(),
            cmd_path: self.cmd_path.clone(),
        })
    }

    fn append_log(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.log.push_str(text);
        if !text.ends_with('\n') {
            self.log.push('\n');
        }
        if self.verbose {
            if let Err(e) = append_to_file(&self.log_path(), text) {
                warn!(path = ?self.log_path(), error = %e, "Failed to write step log");
            }
        }
    }

    fn flush(&mut self) -> StepResult<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;

        if let Some(parent) = self.script_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.script_path, render_script(&self.invocations))?;
        make_executable(&self.script_path)?;
        std::fs::write(
            &self.cmd_path,
            render_command(&self.script_path, self.invocations.last()),
        )?;
        debug!(script = ?self.script_path, "Wrote reproduction script");
        Ok(())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(script = ?self.script_path, error = %e, "Failed to persist reproduction script");
        }
    }
}

/// Script re-running every recorded invocation. The last one takes its
/// arguments from the command line. In-process operations cannot be
/// replayed from a shell and are written as comments.
fn render_script(invocations: &[Invocation]) -> String {
    let mut script = String::from("#!/usr/bin/env bash\nset -e\n");
    let Some((last, earlier)) = invocations.split_last() else {
        script.push_str("# no command was recorded for this step\n");
        return script;
    };

    for invocation in earlier {
        write_cd(&mut script, invocation);
        let line = command_line(invocation);
        if invocation.in_process {
            let _ = writeln!(script, "# in-process operation: {}", shell::join(&line));
        } else {
            let _ = writeln!(script, "{}", shell::join(&line));
        }
    }
    write_cd(&mut script, last);
    if last.in_process {
        let _ = writeln!(
            script,
            "# in-process operation: {}",
            shell::join(&command_line(last))
        );
    } else {
        let _ = writeln!(script, "exec {} \"$@\"", shell::quote(&last.program));
    }
    script
}

fn write_cd(script: &mut String, invocation: &Invocation) {
    if let Some(dir) = &invocation.current_dir {
        let _ = writeln!(script, "cd {}", shell::quote(&dir.to_string_lossy()));
    }
}

fn command_line(invocation: &Invocation) -> Vec<String> {
    let mut line = vec![invocation.program.clone()];
    line.extend(invocation.args.iter().cloned());
    line
}

fn render_command(script: &Path, last: Option<&Invocation>) -> String {
    let mut line = vec!["bash".to_string(), script.to_string_lossy().to_string()];
    if let Some(invocation) = last {
        line.extend(invocation.args.iter().cloned());
    }
    format!("{}\n", shell::join(&line))
}

fn append_to_file(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
