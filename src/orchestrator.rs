//! One distributor, many nodes: connection lifecycle and teardown.

use crate::auth::ClientAuthenticator;
use crate::config::{DeployConfig, NodeConfig};
use crate::discovery::{is_address, with_default_port, NodeResolver};
use crate::error::NodeError;
use crate::logger::Logger;
use crate::net_async::client::{ConnectOptions, Connection};
use crate::node::{LocalNode, RemoteNode};
use crate::services::SharedServices;
use crate::tracker::{tracked, Tracker};
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct Orchestrator {
    config: DeployConfig,
    options: ConnectOptions,
    tracker: Arc<dyn Tracker>,
    resolver: Arc<dyn NodeResolver>,
    logger: Arc<dyn Logger>,
    nodes: Mutex<Vec<Arc<RemoteNode>>>,
}

impl Orchestrator {
    pub fn new(
        config: DeployConfig,
        tracker: Arc<dyn Tracker>,
        resolver: Arc<dyn NodeResolver>,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        let auth = match &config.identity {
            Some(id) => ClientAuthenticator::new(id.clone()),
            None => ClientAuthenticator::from_hostname()?,
        };
        let options = ConnectOptions {
            auth,
            heartbeat: config.heartbeat(),
            tls: config.tls,
            known_hosts: crate::tls::known_hosts_path(),
        };
        Ok(Self {
            config,
            options,
            tracker,
            resolver,
            logger,
            nodes: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Replace how sessions are opened (identity, TLS, known_hosts file)
    pub fn with_connect_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Connect to `host:port`. A failed attempt is reported and not tracked.
    pub async fn connect(&self, address: &str) -> Result<Arc<RemoteNode>> {
        self.open(address, address).await
    }

    pub async fn connect_by_name(&self, name: &str) -> Result<Arc<RemoteNode>> {
        let address = self
            .resolver
            .resolve(name)
            .await
            .map_err(|e| NodeError::wrap(name, e))?
            .ok_or_else(|| NodeError::wrap(name, anyhow!("node {name} could not be resolved")))?;
        self.open(&address, name).await
    }

    /// Address literals connect directly; anything else goes through discovery
    pub async fn connect_target(&self, target: &str) -> Result<Arc<RemoteNode>> {
        if is_address(target) {
            self.connect(&with_default_port(target, self.config.port)).await
        } else {
            self.connect_by_name(target).await
        }
    }

    async fn open(&self, address: &str, name: &str) -> Result<Arc<RemoteNode>> {
        let message = if address == name {
            format!("Connecting to {address}")
        } else {
            format!("Connecting to {name} ({address})")
        };
        let connection = tracked(&self.tracker, name, message, async {
            Connection::connect(address, name, &self.options)
                .await
                .map_err(|e| NodeError::wrap(name, e))
        })
        .await?;
        let node = Arc::new(RemoteNode::new(
            connection,
            &self.config,
            self.tracker.clone(),
            self.logger.clone(),
        ));
        self.nodes.lock().push(node.clone());
        Ok(node)
    }

    /// The distributor machine itself, served in-process
    pub fn local(&self) -> LocalNode {
        let shared = Arc::new(SharedServices::from_config(
            &NodeConfig::default(),
            self.logger.clone(),
        ));
        LocalNode::new(shared, &self.config, self.tracker.clone(), self.logger.clone())
    }

    pub fn nodes(&self) -> Vec<Arc<RemoteNode>> {
        self.nodes.lock().clone()
    }

    /// Close every tracked connection
    pub fn dispose(&self) {
        for node in self.nodes.lock().drain(..) {
            node.close();
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.dispose();
    }
}
