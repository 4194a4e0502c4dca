//! Per-node façade. Every operation is one tracked action; failures carry
//! the node name.

use crate::config::DeployConfig;
use crate::error::{DeployError, NodeError};
use crate::logger::Logger;
use crate::net_async::client::Connection;
use crate::services::{Dispatch, LocalDispatch, SharedServices};
use crate::sync_client::{CopyStats, SyncClient};
use crate::tracker::{tracked, Tracker};
use crate::wire::{
    FileCall, ProcessCall, ProcessOutput, RegistryCall, RegistryValue, Request, RunSpec,
    ServiceCall,
};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| p.display().to_string())
}

fn non_zero(command: String, out: ProcessOutput) -> Result<()> {
    if out.exit_code == 0 {
        return Ok(());
    }
    Err(DeployError::NonZeroExit {
        command,
        code: out.exit_code,
        stdout: out.stdout,
        stderr: out.stderr,
    }
    .into())
}

/// Operations shared by remote and local nodes, all driven through a `Dispatch`
pub struct NodeCore {
    name: String,
    dispatch: Arc<dyn Dispatch>,
    sync: SyncClient,
    tracker: Arc<dyn Tracker>,
}

impl NodeCore {
    pub fn new(
        name: &str,
        dispatch: Arc<dyn Dispatch>,
        cfg: &DeployConfig,
        tracker: Arc<dyn Tracker>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            name: name.to_string(),
            sync: SyncClient::new(dispatch.clone(), cfg.chunk_size, cfg.max_in_flight, logger),
            dispatch,
            tracker,
        }
    }

    async fn op<T, F>(&self, message: String, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tracked(&self.tracker, &self.name, message, async {
            fut.await.map_err(|e| NodeError::wrap(&self.name, e))
        })
        .await
    }

    async fn call(&self, request: Request) -> Result<crate::wire::Response> {
        self.dispatch.call(request).await
    }

    async fn run(&self, path: &str, args: &[String], timeout: Option<Duration>) -> Result<ProcessOutput> {
        self.call(Request::Process(ProcessCall::Run(RunSpec {
            path: path.to_string(),
            args: args.to_vec(),
            timeout,
            capture_output_on_failure: true,
            show_window: false,
        })))
        .await?
        .into_output()
    }
}

#[async_trait]
pub trait Node: Send + Sync {
    fn core(&self) -> &NodeCore;

    fn name(&self) -> &str {
        &self.core().name
    }

    async fn copy_file(&self, source: &Path, destination: &str) -> Result<CopyStats> {
        let core = self.core();
        core.op(
            format!("Copying {} to {}", file_name(source), destination),
            core.sync.copy_file(source, destination),
        )
        .await
    }

    async fn copy_files(&self, pairs: Vec<(PathBuf, String)>) -> Result<CopyStats> {
        let core = self.core();
        core.op(format!("Copying {} files", pairs.len()), core.sync.copy_files(pairs))
            .await
    }

    async fn copy_directory(&self, source: &Path, destination: &str) -> Result<CopyStats> {
        let core = self.core();
        core.op(
            format!("Copying directory {} to {}", source.display(), destination),
            core.sync.copy_directory(source, destination),
        )
        .await
    }

    /// Copy an installer to the node temp folder and run it; `/S` when no args
    async fn install(&self, installer: &Path, args: &[String], timeout: Option<Duration>) -> Result<()> {
        let core = self.core();
        let name = file_name(installer);
        core.op(format!("Installing {name}"), async {
            let out = core.sync.install(installer, args, timeout).await?;
            non_zero(name.clone(), out)
        })
        .await
    }

    async fn execute(&self, path: &str, args: &[String], timeout: Option<Duration>) -> Result<()> {
        let core = self.core();
        let command = if args.is_empty() {
            path.to_string()
        } else {
            format!("{} {}", path, args.join(" "))
        };
        core.op(format!("Executing {command}"), async {
            let out = core.run(path, args, timeout).await?;
            non_zero(command.clone(), out)
        })
        .await
    }

    /// Exit code of a shell command; non-zero is reported, not raised
    async fn shell(&self, command: &str) -> Result<i32> {
        let core = self.core();
        core.op(format!("Running {command}"), async {
            core.call(Request::Process(ProcessCall::Shell {
                command: command.to_string(),
                show_window: false,
            }))
            .await?
            .into_exit_code()
        })
        .await
    }

    /// Like `shell`, but a non-zero exit fails the tracked operation
    async fn shell_checked(&self, command: &str) -> Result<()> {
        let core = self.core();
        core.op(format!("Running {command}"), async {
            let code = core
                .call(Request::Process(ProcessCall::Shell {
                    command: command.to_string(),
                    show_window: false,
                }))
                .await?
                .into_exit_code()?;
            non_zero(
                command.to_string(),
                ProcessOutput {
                    exit_code: code,
                    stdout: String::new(),
                    stderr: String::new(),
                },
            )
        })
        .await
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        let core = self.core();
        core.op(format!("Starting service {name}"), async {
            core.call(Request::Service(ServiceCall::Start {
                name: name.to_string(),
            }))
            .await?
            .into_unit()
        })
        .await
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        let core = self.core();
        core.op(format!("Stopping service {name}"), async {
            core.call(Request::Service(ServiceCall::Stop {
                name: name.to_string(),
            }))
            .await?
            .into_unit()
        })
        .await
    }

    async fn kill_processes(&self, names: &[String]) -> Result<u32> {
        let core = self.core();
        core.op(format!("Killing {}", names.join(", ")), async {
            core.call(Request::Process(ProcessCall::KillAll {
                names: names.to_vec(),
            }))
            .await?
            .into_count()
        })
        .await
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let core = self.core();
        core.op(format!("Deleting {path}"), async {
            core.call(Request::File(FileCall::DeleteFile {
                path: path.to_string(),
            }))
            .await?
            .into_unit()
        })
        .await
    }

    async fn delete_files(&self, pattern: &str) -> Result<u32> {
        let core = self.core();
        core.op(format!("Deleting {pattern}"), async {
            core.call(Request::File(FileCall::DeleteMatching {
                pattern: pattern.to_string(),
            }))
            .await?
            .into_count()
        })
        .await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        let core = self.core();
        core.op(format!("Creating directory {path}"), async {
            core.call(Request::File(FileCall::CreateDirectory {
                path: path.to_string(),
            }))
            .await?
            .into_unit()
        })
        .await
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        let core = self.core();
        core.op(format!("Deleting directory {path}"), async {
            core.call(Request::File(FileCall::DeleteDirectory {
                path: path.to_string(),
                recursive: true,
            }))
            .await?
            .into_unit()
        })
        .await
    }

    async fn unzip(&self, archive: &str, destination: &str, overwrite: bool) -> Result<u32> {
        let core = self.core();
        core.op(format!("Extracting {archive} to {destination}"), async {
            core.call(Request::File(FileCall::Unzip {
                archive: archive.to_string(),
                destination: destination.to_string(),
                overwrite,
            }))
            .await?
            .into_count()
        })
        .await
    }

    async fn read_registry(&self, key: &str, value_name: &str) -> Result<Option<RegistryValue>> {
        let core = self.core();
        core.op(format!("Reading {key}\\{value_name}"), async {
            core.call(Request::Registry(RegistryCall::Read {
                key: key.to_string(),
                value_name: value_name.to_string(),
            }))
            .await?
            .into_registry()
        })
        .await
    }
}

/// A node reached over an authenticated connection
pub struct RemoteNode {
    core: NodeCore,
    connection: Arc<Connection>,
}

impl RemoteNode {
    pub fn new(
        connection: Connection,
        cfg: &DeployConfig,
        tracker: Arc<dyn Tracker>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let connection = Arc::new(connection);
        let name = connection.node().to_string();
        Self {
            core: NodeCore::new(&name, connection.clone(), cfg, tracker, logger),
            connection,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_alive()
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

impl fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNode")
            .field("name", &self.core.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Node for RemoteNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }
}

/// This machine, served in-process
pub struct LocalNode {
    core: NodeCore,
}

impl LocalNode {
    pub fn new(
        shared: Arc<SharedServices>,
        cfg: &DeployConfig,
        tracker: Arc<dyn Tracker>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let dispatch = Arc::new(LocalDispatch::new(shared));
        let name = dispatch.peer().to_string();
        Self {
            core: NodeCore::new(&name, dispatch, cfg, tracker, logger),
        }
    }
}

impl Node for LocalNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }
}
