//! OS service start/stop with idempotent semantics.
//!
//! Each platform backend maps its native results once into `ControlOutcome`;
//! `ServiceControl` applies the idempotence rules on top and waits for the
//! service to reach the requested state.

use crate::error::DeployError;
use crate::wire::{Response, ServiceCall};
use anyhow::{bail, Context, Result};
use std::process::Command;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    Missing,
}

/// Result of one native start/stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Done,
    AlreadyRunning,
    NotRunning,
    Missing,
}

pub trait ServiceManager: Send + Sync {
    fn status(&self, name: &str) -> Result<ServiceState>;
    fn start(&self, name: &str) -> Result<ControlOutcome>;
    fn stop(&self, name: &str) -> Result<ControlOutcome>;
}

fn command_output(program: &str, args: &[&str]) -> Result<std::process::Output> {
    Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("run {} {}", program, args.join(" ")))
}

/// systemd backend
pub struct Systemctl;

impl Systemctl {
    fn parse_show(text: &str) -> ServiceState {
        let mut load = "";
        let mut active = "";
        for line in text.lines() {
            if let Some(v) = line.strip_prefix("LoadState=") {
                load = v.trim();
            } else if let Some(v) = line.strip_prefix("ActiveState=") {
                active = v.trim();
            }
        }
        if load == "not-found" || load.is_empty() {
            return ServiceState::Missing;
        }
        match active {
            "active" | "activating" | "reloading" => ServiceState::Running,
            _ => ServiceState::Stopped,
        }
    }

    fn control(&self, verb: &str, name: &str) -> Result<()> {
        let out = command_output("systemctl", &[verb, name])?;
        if !out.status.success() {
            bail!(
                "systemctl {} {} failed: {}",
                verb,
                name,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

impl ServiceManager for Systemctl {
    fn status(&self, name: &str) -> Result<ServiceState> {
        let out = command_output(
            "systemctl",
            &["show", name, "-p", "LoadState", "-p", "ActiveState"],
        )?;
        Ok(Self::parse_show(&String::from_utf8_lossy(&out.stdout)))
    }

    fn start(&self, name: &str) -> Result<ControlOutcome> {
        match self.status(name)? {
            ServiceState::Missing => Ok(ControlOutcome::Missing),
            ServiceState::Running => Ok(ControlOutcome::AlreadyRunning),
            ServiceState::Stopped => {
                self.control("start", name)?;
                Ok(ControlOutcome::Done)
            }
        }
    }

    fn stop(&self, name: &str) -> Result<ControlOutcome> {
        match self.status(name)? {
            ServiceState::Missing => Ok(ControlOutcome::Missing),
            ServiceState::Stopped => Ok(ControlOutcome::NotRunning),
            ServiceState::Running => {
                self.control("stop", name)?;
                Ok(ControlOutcome::Done)
            }
        }
    }
}

/// Windows service control manager backend, driven through `sc.exe`
pub struct ScExe;

impl ScExe {
    const ALREADY_RUNNING: i32 = 1056;
    const DOES_NOT_EXIST: i32 = 1060;
    const NOT_ACTIVE: i32 = 1062;

    fn map(code: Option<i32>, verb: &str, name: &str, stdout: &[u8]) -> Result<ControlOutcome> {
        match code {
            Some(0) => Ok(ControlOutcome::Done),
            Some(Self::ALREADY_RUNNING) => Ok(ControlOutcome::AlreadyRunning),
            Some(Self::NOT_ACTIVE) => Ok(ControlOutcome::NotRunning),
            Some(Self::DOES_NOT_EXIST) => Ok(ControlOutcome::Missing),
            other => bail!(
                "sc {} {} failed ({:?}): {}",
                verb,
                name,
                other,
                String::from_utf8_lossy(stdout).trim()
            ),
        }
    }
}

impl ServiceManager for ScExe {
    fn status(&self, name: &str) -> Result<ServiceState> {
        let out = command_output("sc", &["query", name])?;
        if out.status.code() == Some(Self::DOES_NOT_EXIST) {
            return Ok(ServiceState::Missing);
        }
        let text = String::from_utf8_lossy(&out.stdout);
        if text.contains("RUNNING") || text.contains("START_PENDING") {
            Ok(ServiceState::Running)
        } else {
            Ok(ServiceState::Stopped)
        }
    }

    fn start(&self, name: &str) -> Result<ControlOutcome> {
        let out = command_output("sc", &["start", name])?;
        Self::map(out.status.code(), "start", name, &out.stdout)
    }

    fn stop(&self, name: &str) -> Result<ControlOutcome> {
        let out = command_output("sc", &["stop", name])?;
        Self::map(out.status.code(), "stop", name, &out.stdout)
    }
}

pub fn platform_manager() -> Box<dyn ServiceManager> {
    if cfg!(windows) {
        Box::new(ScExe)
    } else {
        Box::new(Systemctl)
    }
}

pub struct ServiceControl {
    manager: Box<dyn ServiceManager>,
    wait: Duration,
    poll: Duration,
}

impl ServiceControl {
    pub fn new(manager: Box<dyn ServiceManager>, wait: Duration) -> Self {
        Self {
            manager,
            wait,
            poll: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn call(&self, call: ServiceCall) -> Result<Response> {
        match call {
            ServiceCall::Start { name } => self.start(&name)?,
            ServiceCall::Stop { name } => self.stop(&name)?,
        }
        Ok(Response::Unit)
    }

    /// Start `name`; already running is success, a missing service is not
    pub fn start(&self, name: &str) -> Result<()> {
        match self.manager.start(name)? {
            ControlOutcome::Missing => Err(DeployError::ServiceNotFound(name.to_string()).into()),
            ControlOutcome::AlreadyRunning => Ok(()),
            ControlOutcome::Done | ControlOutcome::NotRunning => {
                self.wait_for(name, ServiceState::Running)
            }
        }
    }

    /// Stop `name`; not running and missing are both success
    pub fn stop(&self, name: &str) -> Result<()> {
        match self.manager.stop(name)? {
            ControlOutcome::Missing | ControlOutcome::NotRunning => Ok(()),
            ControlOutcome::Done | ControlOutcome::AlreadyRunning => {
                self.wait_for(name, ServiceState::Stopped)
            }
        }
    }

    fn wait_for(&self, name: &str, target: ServiceState) -> Result<()> {
        let deadline = Instant::now() + self.wait;
        loop {
            match self.manager.status(name)? {
                state if state == target => return Ok(()),
                ServiceState::Missing if target == ServiceState::Running => {
                    return Err(DeployError::ServiceNotFound(name.to_string()).into())
                }
                ServiceState::Missing => return Ok(()),
                _ => {}
            }
            if Instant::now() >= deadline {
                bail!(
                    "service {} did not reach {:?} within {:?}",
                    name,
                    target,
                    self.wait
                );
            }
            std::thread::sleep(self.poll);
        }
    }
}
