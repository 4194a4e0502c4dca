//! Clap definitions for `fleet` and `fleetd`, plus the process exit codes

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Node listener options; anything given here overrides `fleetd.toml`
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "fleetd - fleetsync node listener")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Confine every file operation under this directory
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Distributor identity allowed to connect (repeatable)
    #[arg(long = "allow", action = ArgAction::Append)]
    pub allow: Vec<String>,

    /// Wrap connections in TLS
    #[arg(long)]
    pub tls: bool,

    /// PEM certificate (default: generated self-signed)
    #[arg(long = "tls-cert", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching --tls-cert
    #[arg(long = "tls-key", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Append text log lines to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Node config file (default: <config dir>/fleetd.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Advertise on mDNS under this name (default: host name)
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub advertise: Option<String>,
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "fleet - deploy to fleets of machines")]
pub struct DeployCli {
    /// Distributor config file (default: <config dir>/fleet.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print full cause chains for failures
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// No live console output; failures are summarized at the end
    #[arg(long, global = true)]
    pub headless: bool,

    /// Identity presented to nodes (default: host name)
    #[arg(long, global = true)]
    pub identity: Option<String>,

    /// Connect over TLS, trusting node certificates on first use
    #[arg(long, global = true)]
    pub tls: bool,

    /// Append operation outcomes as JSON lines to this file
    #[arg(long, global = true)]
    pub journal: Option<PathBuf>,

    /// Append text log lines to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Run a plan on one or more nodes
    Deploy {
        plan: PathBuf,

        /// Node address (host[:port]) or name (repeatable)
        #[arg(long = "node", short = 'n', required = true, action = ArgAction::Append)]
        nodes: Vec<String>,

        /// Plan argument name=value (repeatable)
        #[arg(long = "arg", short = 'a', action = ArgAction::Append)]
        args: Vec<String>,

        /// Default timeout in seconds for install and execute steps
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run a plan on this machine
    Run {
        plan: PathBuf,

        #[arg(long = "arg", short = 'a', action = ArgAction::Append)]
        args: Vec<String>,

        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    BadArguments = 1,
    ScriptAccess = 2,
    ScriptCompile = 3,
    ScriptRuntime = 4,
    Connection = 5,
    Unhandled = 6,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_deploy_with_globals_after_subcommand() {
        let cli = DeployCli::try_parse_from([
            "fleet", "deploy", "plan.toml", "-n", "web01", "--node", "10.0.0.5:9100", "--arg",
            "v=1", "--headless",
        ])
        .unwrap();
        assert!(cli.headless);
        match cli.command {
            Command::Deploy { nodes, args, .. } => {
                assert_eq!(nodes, vec!["web01", "10.0.0.5:9100"]);
                assert_eq!(args, vec!["v=1"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn deploy_needs_a_node() {
        assert!(DeployCli::try_parse_from(["fleet", "deploy", "plan.toml"]).is_err());
    }

    #[test]
    fn advertise_name_is_optional() {
        let opts = DaemonOpts::try_parse_from(["fleetd", "--advertise"]).unwrap();
        assert_eq!(opts.advertise.as_deref(), Some(""));
        let opts = DaemonOpts::try_parse_from(["fleetd", "--advertise", "web01"]).unwrap();
        assert_eq!(opts.advertise.as_deref(), Some("web01"));
        let opts = DaemonOpts::try_parse_from(["fleetd"]).unwrap();
        assert!(opts.advertise.is_none());
    }
}
