//! Symbolic node names to `host:port` addresses.
//!
//! Resolution order: the `[hosts]` table of the distributor config, then an
//! mDNS browse for nodes advertising `_fleetsync._tcp`, then the name itself
//! as a host name on the default port.

use crate::config::DeployConfig;
use crate::protocol::MDNS_SERVICE_TYPE;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[async_trait]
pub trait NodeResolver: Send + Sync {
    /// `Some(host:port)` when this resolver knows the name
    async fn resolve(&self, name: &str) -> Result<Option<String>>;
}

/// Append `port` unless `target` already names one
pub fn with_default_port(target: &str, port: u16) -> String {
    let has_port = match target.rsplit_once(':') {
        Some((host, p)) => {
            p.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        target.to_string()
    } else if target.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{target}]:{port}")
    } else {
        format!("{target}:{port}")
    }
}

/// True for `host:port` and IP literals, which need no resolution
pub fn is_address(target: &str) -> bool {
    target.parse::<IpAddr>().is_ok() || with_default_port(target, 0) == target
}

pub struct StaticResolver {
    hosts: BTreeMap<String, String>,
    default_port: u16,
}

impl StaticResolver {
    pub fn new(hosts: &BTreeMap<String, String>, default_port: u16) -> Self {
        Self {
            hosts: hosts
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect(),
            default_port,
        }
    }
}

#[async_trait]
impl NodeResolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .hosts
            .get(&name.to_ascii_lowercase())
            .map(|addr| with_default_port(addr, self.default_port)))
    }
}

pub struct MdnsResolver {
    timeout: Duration,
}

impl MdnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn browse(name: &str, timeout: Duration) -> Result<Option<String>> {
        use mdns_sd::{ServiceDaemon, ServiceEvent};

        let wanted = name.to_ascii_lowercase();
        let wanted_host = format!("{wanted}.local.");
        let daemon = ServiceDaemon::new().context("start mDNS daemon")?;
        let events = daemon.browse(MDNS_SERVICE_TYPE).context("browse mDNS")?;
        let deadline = Instant::now() + timeout;
        let mut found = None;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            let Ok(event) = events.recv_timeout(left) else {
                break;
            };
            if let ServiceEvent::ServiceResolved(info) = event {
                let instance = info
                    .get_fullname()
                    .strip_suffix(MDNS_SERVICE_TYPE)
                    .unwrap_or(info.get_fullname())
                    .trim_end_matches('.')
                    .to_ascii_lowercase();
                let host = info.get_hostname().to_ascii_lowercase();
                if instance != wanted && host != wanted_host {
                    continue;
                }
                if let Some(addr) = info.get_addresses().iter().next() {
                    let ip: IpAddr = (*addr).into();
                    found = Some(with_default_port(&ip.to_string(), info.get_port()));
                    break;
                }
            }
        }
        let _ = daemon.shutdown();
        Ok(found)
    }
}

#[async_trait]
impl NodeResolver for MdnsResolver {
    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || Self::browse(&name, timeout))
            .await
            .context("mDNS browse task")?
    }
}

/// Tries each resolver in turn; unknown names fall back to `name:default_port`
pub struct ChainResolver {
    resolvers: Vec<Arc<dyn NodeResolver>>,
    default_port: u16,
}

impl ChainResolver {
    pub fn new(resolvers: Vec<Arc<dyn NodeResolver>>, default_port: u16) -> Self {
        Self {
            resolvers,
            default_port,
        }
    }

    pub fn from_config(cfg: &DeployConfig) -> Self {
        let mut resolvers: Vec<Arc<dyn NodeResolver>> =
            vec![Arc::new(StaticResolver::new(&cfg.hosts, cfg.port))];
        if cfg.mdns {
            resolvers.push(Arc::new(MdnsResolver::new(Duration::from_millis(
                cfg.mdns_timeout_ms,
            ))));
        }
        Self::new(resolvers, cfg.port)
    }
}

#[async_trait]
impl NodeResolver for ChainResolver {
    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        for resolver in &self.resolvers {
            match resolver.resolve(name).await {
                Ok(Some(addr)) => return Ok(Some(addr)),
                Ok(None) => {}
                Err(e) => eprintln!("warning: resolving {name}: {e:#}"),
            }
        }
        Ok(Some(with_default_port(name, self.default_port)))
    }
}

/// Outbound interface address, found without sending anything
fn local_ipv4() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("192.0.2.1:9").map(|_| s))
        .and_then(|s| s.local_addr())
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Register this node on mDNS; the registration lives as long as the daemon
pub fn advertise(instance: &str, port: u16) -> Result<mdns_sd::ServiceDaemon> {
    let daemon = mdns_sd::ServiceDaemon::new().context("start mDNS daemon")?;
    let host = format!("{}.local.", instance.to_ascii_lowercase());
    let ip = local_ipv4();
    let info = mdns_sd::ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        instance,
        &host,
        ip.as_str(),
        port,
        None::<std::collections::HashMap<String, String>>,
    )
    .context("build mDNS record")?;
    daemon.register(info).context("register mDNS service")?;
    Ok(daemon)
}
