//! The node's service set and the `Dispatch` seam callers use to reach it,
//! either over a connection or in-process.

use crate::config::NodeConfig;
use crate::fs_service::FileService;
use crate::logger::Logger;
use crate::paths::PathResolver;
use crate::process_service::ProcessService;
use crate::registry;
use crate::service_control::{platform_manager, ServiceControl};
use crate::wire::{Request, Response};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Sends one request to a node's services and returns its response
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn call(&self, request: Request) -> Result<Response>;

    /// Name used to attribute failures
    fn peer(&self) -> &str;
}

/// Services shared by every session on a node
pub struct SharedServices {
    pub resolver: Arc<PathResolver>,
    pub processes: ProcessService,
    pub services: ServiceControl,
}

impl SharedServices {
    pub fn from_config(cfg: &NodeConfig, logger: Arc<dyn Logger>) -> Self {
        let tokens = cfg.paths.clone().with_environment_defaults();
        let resolver = Arc::new(PathResolver::new(&tokens, cfg.root.clone()));
        Self {
            processes: ProcessService::new(resolver.clone(), logger),
            services: ServiceControl::new(
                platform_manager(),
                Duration::from_secs(cfg.service_wait_secs),
            ),
            resolver,
        }
    }
}

/// One session's view of the node: shared services plus its own file handles
pub struct NodeServices {
    shared: Arc<SharedServices>,
    files: FileService,
}

impl NodeServices {
    pub fn new(shared: Arc<SharedServices>) -> Self {
        let files = FileService::new(shared.resolver.clone());
        Self { shared, files }
    }

    pub async fn handle(self: Arc<Self>, request: Request) -> Result<Response> {
        match request {
            Request::File(call) => {
                let this = self.clone();
                tokio::task::spawn_blocking(move || this.files.call(call))
                    .await
                    .context("file service task")?
            }
            Request::Process(call) => self.shared.processes.call(call).await,
            Request::Service(call) => {
                let shared = self.shared.clone();
                tokio::task::spawn_blocking(move || shared.services.call(call))
                    .await
                    .context("service control task")?
            }
            Request::Registry(call) => tokio::task::spawn_blocking(move || registry::call(call))
                .await
                .context("registry task")?,
        }
    }

    /// Close every handle this session left open
    pub fn close_all(&self) -> usize {
        self.files.close_all()
    }

    pub fn open_handles(&self) -> usize {
        self.files.open_handles()
    }
}

/// Runs requests against this machine's own services, no connection involved
pub struct LocalDispatch {
    services: Arc<NodeServices>,
    name: String,
}

impl LocalDispatch {
    pub fn new(shared: Arc<SharedServices>) -> Self {
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            services: Arc::new(NodeServices::new(shared)),
            name,
        }
    }
}

#[async_trait]
impl Dispatch for LocalDispatch {
    async fn call(&self, request: Request) -> Result<Response> {
        self.services.clone().handle(request).await
    }

    fn peer(&self) -> &str {
        &self.name
    }
}
