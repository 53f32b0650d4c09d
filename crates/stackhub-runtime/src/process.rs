use crate::delegate::{Delegate, DelegateOutput, Invocation};
use crate::RuntimeError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Runs component implementations as child processes.
///
/// The implementation of a verb is the first of `<dir>/<verb>`,
/// `<dir>/<verb>.sh`, `<dir>/bin/<verb>` that exists, falling back to
/// `make <verb>` when the directory has a `Makefile`.
#[derive(Debug, Default)]
pub struct ProcessDelegate;

impl ProcessDelegate {
    pub fn new() -> Self {
        Self
    }

    fn resolve_command(invocation: &Invocation) -> Result<Command, RuntimeError> {
        let verb = invocation.verb_name();
        let dir = &invocation.dir;
        let candidates: [PathBuf; 3] = [
            dir.join(&verb),
            dir.join(format!("{verb}.sh")),
            dir.join("bin").join(&verb),
        ];
        if let Some(script) = candidates.iter().find(|p| p.is_file()) {
            return Ok(Command::new(script));
        }
        if dir.join("Makefile").is_file() {
            let mut cmd = Command::new("make");
            cmd.arg(&verb);
            return Ok(cmd);
        }
        Err(RuntimeError::NoImplementation {
            component: invocation.component.clone(),
            verb,
            dir: dir.display().to_string(),
        })
    }
}

fn drain(pipe: Option<impl Read>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut p) = pipe {
        p.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

/// Run `cmd` to completion, reading stdout and stderr on two threads so a
/// chatty child never blocks on a full pipe.
pub(crate) fn run_captured(
    mut cmd: Command,
    invocation: &Invocation,
) -> Result<DelegateOutput, RuntimeError> {
    cmd.current_dir(&invocation.dir)
        .envs(invocation.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let (stdout, stderr) = std::thread::scope(|s| {
        let out = s.spawn(move || drain(stdout_pipe));
        let err = s.spawn(move || drain(stderr_pipe));
        (out.join(), err.join())
    });
    let status = child.wait()?;

    let stdout = stdout
        .map_err(|_| RuntimeError::ExecFailed("stdout reader panicked".to_owned()))??;
    let stderr = stderr
        .map_err(|_| RuntimeError::ExecFailed("stderr reader panicked".to_owned()))??;

    for line in String::from_utf8_lossy(&stdout).lines() {
        debug!("[{}] {line}", invocation.component);
    }

    Ok(DelegateOutput {
        stdout,
        stderr,
        exit_code: status.code(),
    })
}

impl Delegate for ProcessDelegate {
    fn name(&self) -> &str {
        "process"
    }

    fn invoke(&self, invocation: &Invocation) -> Result<DelegateOutput, RuntimeError> {
        let cmd = Self::resolve_command(invocation)?;
        debug!(
            "running {} for {} in {}",
            invocation.verb_name(),
            invocation.component,
            invocation.dir.display()
        );
        run_captured(cmd, invocation)
    }

    fn run_hook(
        &self,
        script: &Path,
        invocation: &Invocation,
    ) -> Result<DelegateOutput, RuntimeError> {
        if !script.is_file() {
            return Err(RuntimeError::HookFailed {
                component: invocation.component.clone(),
                hook: script.display().to_string(),
                detail: "hook script not found".to_owned(),
            });
        }
        let mut cmd = Command::new(script);
        cmd.arg(invocation.verb_name());
        run_captured(cmd, invocation)
    }
}
