//! Node-side process execution: run with timeout and kill, shell commands,
//! and bulk termination by process name.

use crate::error::DeployError;
use crate::logger::Logger;
use crate::paths::PathResolver;
use crate::wire::{ProcessCall, ProcessOutput, Response, RunSpec};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub struct ProcessService {
    resolver: Arc<PathResolver>,
    logger: Arc<dyn Logger>,
}

/// How long output may keep flowing after the process exits when no
/// timeout bounds the call; inherited pipes of a lingering child stay open
pub const OUTPUT_GRACE: Duration = Duration::from_secs(2);

type Sink = Arc<Mutex<Vec<u8>>>;

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Sink) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                sink.lock().extend_from_slice(&chunk[..n]);
            }
        }
    }
}

fn collected(sink: &Sink) -> String {
    String::from_utf8_lossy(&sink.lock()).into_owned()
}

#[allow(unused_variables)]
fn hide_window(cmd: &mut Command, show_window: bool) {
    #[cfg(windows)]
    if !show_window {
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
}

impl ProcessService {
    pub fn new(resolver: Arc<PathResolver>, logger: Arc<dyn Logger>) -> Self {
        Self { resolver, logger }
    }

    pub async fn call(&self, call: ProcessCall) -> Result<Response> {
        Ok(match call {
            ProcessCall::Run(spec) => Response::Output(self.run(&spec).await?),
            ProcessCall::Shell {
                command,
                show_window,
            } => Response::ExitCode(self.run_shell_command(&command, show_window).await?),
            ProcessCall::KillAll { names } => {
                let killed = tokio::task::spawn_blocking(move || kill_all_by_name(&names))
                    .await
                    .context("process scan task")?;
                Response::Count(killed)
            }
        })
    }

    /// A path with a directory part is resolved on this node and must exist;
    /// a bare program name is left to the PATH search at spawn time.
    fn executable(&self, raw: &str) -> Result<PathBuf> {
        if raw.contains(['/', '\\']) {
            let path = self.resolver.resolve(raw)?;
            if !path.is_file() {
                return Err(DeployError::ExecutableNotFound(path).into());
            }
            Ok(path)
        } else {
            Ok(PathBuf::from(self.resolver.expand(raw)?))
        }
    }

    pub async fn run(&self, spec: &RunSpec) -> Result<ProcessOutput> {
        let exe = self.executable(&spec.path)?;
        let limit = spec.timeout.filter(|t| !t.is_zero());
        let deadline = limit.map(|l| Instant::now() + l);
        let capture = spec.capture_output_on_failure;
        let output = || if capture { Stdio::piped() } else { Stdio::null() };

        let mut cmd = Command::new(&exe);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true);
        hide_window(&mut cmd, spec.show_window);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                anyhow::Error::new(DeployError::ExecutableNotFound(exe.clone()))
            } else {
                anyhow::Error::new(e).context(format!("launch {}", exe.display()))
            }
        })?;

        let out_sink = Sink::default();
        let err_sink = Sink::default();
        let mut drains = Vec::new();
        if let Some(r) = child.stdout.take() {
            drains.push(tokio::spawn(drain(r, out_sink.clone())));
        }
        if let Some(r) = child.stderr.take() {
            drains.push(tokio::spawn(drain(r, err_sink.clone())));
        }

        let status = match (limit, deadline) {
            (Some(limit), Some(deadline)) => {
                match tokio::time::timeout_at(deadline, child.wait()).await {
                    Ok(status) => status.with_context(|| format!("wait for {}", exe.display()))?,
                    Err(_) => {
                        if let Err(e) = child.kill().await {
                            self.logger
                                .error("kill", &format!("{}: {}", exe.display(), e));
                            eprintln!("failed to kill {} after timeout: {}", exe.display(), e);
                        }
                        for d in &drains {
                            d.abort();
                        }
                        return Err(DeployError::Timeout {
                            path: spec.path.clone(),
                            timeout: limit,
                        }
                        .into());
                    }
                }
            }
            _ => child
                .wait()
                .await
                .with_context(|| format!("wait for {}", exe.display()))?,
        };

        // A child of the process may still hold the pipes; stop reading at the deadline
        let drain_until = deadline.unwrap_or_else(|| Instant::now() + OUTPUT_GRACE);
        let aborts: Vec<_> = drains.iter().map(|d| d.abort_handle()).collect();
        if tokio::time::timeout_at(drain_until, futures::future::join_all(drains))
            .await
            .is_err()
        {
            for a in aborts {
                a.abort();
            }
        }

        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 && capture {
            Ok(ProcessOutput {
                exit_code,
                stdout: collected(&out_sink),
                stderr: collected(&err_sink),
            })
        } else {
            Ok(ProcessOutput {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    /// Exit code of the command; a non-zero code is not an error here
    pub async fn run_shell_command(&self, command: &str, show_window: bool) -> Result<i32> {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        hide_window(&mut cmd, show_window);
        let status = cmd
            .status()
            .await
            .with_context(|| format!("run shell command {command:?}"))?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn comparable_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Kill every process whose name matches one of `names` (case-insensitive,
/// with or without `.exe`). Names with no running process are not an error.
/// Returns how many processes were actually killed.
pub fn kill_all_by_name(names: &[String]) -> u32 {
    use sysinfo::System;

    let wanted: Vec<String> = names
        .iter()
        .map(|n| comparable_name(n))
        .filter(|n| !n.is_empty())
        .collect();
    if wanted.is_empty() {
        return 0;
    }
    let sys = System::new_all();
    let me = std::process::id();
    let mut killed = 0u32;
    for (pid, process) in sys.processes() {
        if pid.as_u32() == me {
            continue;
        }
        let name: &OsStr = process.name().as_ref();
        let name = comparable_name(&name.to_string_lossy());
        if wanted.iter().any(|w| *w == name) && process.kill() {
            killed += 1;
        }
    }
    killed
}
