//! External process unit.
//!
//! Exclusive units block the runner thread until the child exits.
//! Non-exclusive units return [`Signal::Block`] right after spawning and
//! let the runner multiplex them through `poll`/`wait`.

mod deadline;

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::key::CacheKey;
use crate::task::{Signal, Task};
use crate::value::Value;

use self::deadline::{Deadline, ReapGuard};

/// Where a child's standard stream goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Redirect {
    #[default]
    Inherit,
    Null,
    /// Read from (stdin) or truncate-and-write to (stdout/stderr) a file.
    File(PathBuf),
    /// Stderr only: share the stdout destination.
    Stdout,
}

/// Result of a finished process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub pid: u32,
    /// Exit code, or the negated signal number if the child was killed.
    pub code: i32,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Signal that terminated the child, if any.
    pub fn signal(&self) -> Option<i32> {
        (self.code < 0).then_some(-self.code)
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(0),
    }
}

/// Runs one OS process. Never cached: every handle is a distinct run.
pub struct ExternalProcessTask {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
    timeout: Option<Duration>,
    exclusive: bool,
    child: Option<Child>,
    started_at: Option<Instant>,
    deadline: Option<Deadline>,
    guard: ReapGuard,
}

impl ExternalProcessTask {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
            timeout: None,
            exclusive: false,
            child: None,
            started_at: None,
            deadline: None,
            guard: ReapGuard::new(),
        }
    }

    /// `/bin/sh -c <script>`.
    pub fn shell(script: impl Into<OsString>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = redirect;
        self
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// Deliver `SIGXCPU` if the child outlives `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    fn command(&self) -> Result<Command, TaskError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));

        cmd.stdin(match &self.stdin {
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Null => Stdio::null(),
            Redirect::File(path) => Stdio::from(File::open(path)?),
            Redirect::Stdout => {
                return Err(TaskError::Config("stdin cannot be redirected to stdout".into()))
            }
        });

        let stdout_file = match &self.stdout {
            Redirect::File(path) => Some(File::create(path)?),
            Redirect::Stdout => {
                return Err(TaskError::Config("stdout cannot be redirected to itself".into()))
            }
            _ => None,
        };
        let stderr = match &self.stderr {
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Null => Stdio::null(),
            Redirect::File(path) => Stdio::from(File::create(path)?),
            Redirect::Stdout => match (&stdout_file, &self.stdout) {
                (Some(file), _) => Stdio::from(file.try_clone()?),
                (None, Redirect::Null) => Stdio::null(),
                (None, _) => Stdio::from(io::stdout().as_fd().try_clone_to_owned()?),
            },
        };
        cmd.stderr(stderr);
        cmd.stdout(match (stdout_file, &self.stdout) {
            (Some(file), _) => Stdio::from(file),
            (None, Redirect::Null) => Stdio::null(),
            (None, _) => Stdio::inherit(),
        });
        Ok(cmd)
    }

    fn start(&mut self) -> Result<(), TaskError> {
        if self.child.is_some() {
            return Err(TaskError::msg(format!("{} was already started", self.label())));
        }
        let mut cmd = self.command()?;
        self.guard = ReapGuard::new();
        self.started_at = Some(Instant::now());
        let child = cmd.spawn().map_err(|e| TaskError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source: Arc::new(e),
        })?;
        let pid = child.id();
        self.child = Some(child);
        debug!(pid, command = %self.label(), exclusive = self.exclusive, "process started");
        if let Some(timeout) = self.timeout {
            self.deadline = Some(Deadline::arm(pid, timeout, self.guard.clone())?);
        }
        Ok(())
    }

    /// Reap the child if it has exited.
    fn try_reap(&mut self) -> Result<Option<ExitStatus>, TaskError> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| TaskError::msg("process unit has no running child"))?;
        let mut alive = self.guard.lock();
        let status = child.try_wait()?;
        if status.is_some() {
            *alive = false;
        }
        Ok(status)
    }

    /// Block until the child has exited, without reaping it.
    fn wait_exit(&self) {
        let Some(child) = self.child.as_ref() else {
            return;
        };
        let pid = child.id();
        loop {
            // SAFETY: zeroed siginfo_t is a valid out-parameter for waitid.
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            // WNOWAIT leaves the child reapable so `try_reap` stays the
            // only place that reaps, under the guard.
            let rc = unsafe {
                libc::waitid(
                    libc::P_PID,
                    pid as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if rc == 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                debug!(pid, error = %err, "waitid failed");
                return;
            }
        }
    }

    fn finish(&mut self, status: ExitStatus) -> ProcessOutcome {
        let elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
        if let Some(mut deadline) = self.deadline.take() {
            deadline.cancel();
        }
        let pid = self.child.take().map(|c| c.id()).unwrap_or_default();
        let outcome = ProcessOutcome {
            pid,
            code: exit_code(status),
            elapsed,
        };
        debug!(pid, code = outcome.code, ?elapsed, "process finished");
        outcome
    }

    fn terminate(&mut self) {
        if let Some(mut deadline) = self.deadline.take() {
            deadline.cancel();
        }
        if let Some(mut child) = self.child.take() {
            let mut alive = self.guard.lock();
            if *alive {
                if let Err(e) = child.kill() {
                    debug!(pid = child.id(), error = %e, "kill failed");
                }
                if let Err(e) = child.wait() {
                    warn!(pid = child.id(), error = %e, "failed to reap killed process");
                }
                *alive = false;
            }
        }
    }
}

impl Task for ExternalProcessTask {
    fn cache_key(&self) -> Option<CacheKey> {
        None
    }

    fn resume(&mut self, _input: Value) -> Result<Signal, TaskError> {
        if self.exclusive {
            self.start()?;
            let status = loop {
                if let Some(status) = self.try_reap()? {
                    break status;
                }
                self.wait_exit();
            };
            return Ok(Signal::Return(self.finish(status).into()));
        }
        if self.child.is_none() {
            self.start()?;
            return Ok(Signal::Block);
        }
        match self.try_reap()? {
            Some(status) => Ok(Signal::Return(self.finish(status).into())),
            None => Ok(Signal::Block),
        }
    }

    fn throw(&mut self, error: TaskError) -> Result<Signal, TaskError> {
        Err(error)
    }

    fn poll(&mut self) -> bool {
        // Errors resurface on the next resume.
        !matches!(self.try_reap(), Ok(None))
    }

    fn wait(&mut self) {
        self.wait_exit();
    }

    fn close(&mut self) -> Result<(), TaskError> {
        self.terminate();
        Ok(())
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    fn label(&self) -> String {
        let mut label = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            label.push(' ');
            label.push_str(&arg.to_string_lossy());
        }
        label
    }
}

impl Drop for ExternalProcessTask {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for ExternalProcessTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalProcessTask")
            .field("command", &self.label())
            .field("timeout", &self.timeout)
            .field("exclusive", &self.exclusive)
            .field("pid", &self.child.as_ref().map(Child::id))
            .finish()
    }
}
