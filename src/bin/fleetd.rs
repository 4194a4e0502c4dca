use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use fleetsync::cli::DaemonOpts;
use fleetsync::config::NodeConfig;
use fleetsync::logger::open_logger;
use fleetsync::net_async::server::NodeServer;
use fleetsync::{discovery, tls};

/// Flags win over the config file
fn merge(opts: &DaemonOpts) -> Result<NodeConfig> {
    let mut cfg = NodeConfig::load(opts.config.as_deref())?;
    if let Some(bind) = &opts.bind {
        cfg.bind = bind.clone();
    }
    if let Some(root) = &opts.root {
        cfg.root = Some(root.clone());
    }
    if !opts.allow.is_empty() {
        cfg.allowed_identities = opts.allow.clone();
    }
    if opts.tls {
        cfg.tls = true;
    }
    if opts.tls_cert.is_some() {
        cfg.tls_cert = opts.tls_cert.clone();
        cfg.tls_key = opts.tls_key.clone();
    }
    if opts.log_file.is_some() {
        cfg.log_file = opts.log_file.clone();
    }
    if let Some(name) = &opts.advertise {
        if !name.is_empty() {
            cfg.advertise_name = Some(name.clone());
        } else if cfg.advertise_name.is_none() {
            cfg.advertise_name = hostname::get().ok().and_then(|h| h.into_string().ok());
        }
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let cfg = merge(&opts)?;

    if let Some(root) = &cfg.root {
        if !root.is_dir() {
            anyhow::bail!("Error: Root directory does not exist: {}", root.display());
        }
    }

    println!("Starting fleetd:");
    println!("  Bind: {}", cfg.bind);
    match &cfg.root {
        Some(root) => println!("  Root: {}", root.display()),
        None => println!("  Root: (unconfined)"),
    }
    println!("  Allowed identities: {}", cfg.allowed_identities.join(", "));

    if cfg.bind.starts_with("0.0.0.0") && !cfg.tls {
        eprintln!("WARNING: listening on every interface without TLS");
        eprintln!("   Only use on trusted networks (LAN)");
    }

    let tls_config = if cfg.tls {
        let cfg = tls::load_or_generate_server_config(cfg.tls_cert.clone(), cfg.tls_key.clone())
            .context("Failed to set up TLS configuration")?;
        println!("  Security: TLS enabled");
        Some(cfg)
    } else {
        println!("  Security: plain TCP");
        None
    };

    let logger = open_logger(cfg.log_file.as_deref())?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        let server = Arc::new(NodeServer::new(&cfg, tls_config, logger));
        let listener = server.bind(&cfg.bind).await?;
        let port = listener.local_addr()?.port();

        // Registration lasts as long as the daemon handle
        let _mdns = match &cfg.advertise_name {
            Some(name) => match discovery::advertise(name, port) {
                Ok(daemon) => {
                    println!("  Advertised on mDNS as {name}");
                    Some(daemon)
                }
                Err(e) => {
                    eprintln!("warning: mDNS advertise failed: {e:#}");
                    None
                }
            },
            None => None,
        };

        server.serve(listener).await
    })
}
