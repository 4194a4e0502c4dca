//! Error taxonomy shared by the node services, the sync client and the
//! orchestrator. Application code keeps using `anyhow::Result`; these types
//! are what `downcast_ref` looks for.

use crate::wire::{Fault, FaultKind};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("authentication rejected by {0}")]
    AuthenticationRejected(String),

    #[error("connection to {node} lost: {reason}")]
    ConnectionLost { node: String, reason: String },

    #[error("integrity check failed for {path}: local digest {local}, remote digest {remote}")]
    IntegrityMismatch {
        path: String,
        local: String,
        remote: String,
    },

    #[error("{path} did not exit within {timeout:?} and was killed")]
    Timeout { path: String, timeout: Duration },

    #[error("service {0} does not exist")]
    ServiceNotFound(String),

    #[error("unrecognized path token %{0}%")]
    UnknownPathToken(String),

    #[error("no open handle for {0}")]
    HandleNotOpen(PathBuf),

    #[error("{0} already exists")]
    AlreadyExists(PathBuf),

    #[error("executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("malformed registry key {0}")]
    MalformedRegistryKey(String),

    #[error("{command} exited with code {code}")]
    NonZeroExit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("path {0} is not allowed")]
    InvalidPath(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Remote(Fault),
}

impl DeployError {
    /// Fault kind used when this error crosses the wire
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            DeployError::Timeout { .. } => FaultKind::Timeout,
            DeployError::ServiceNotFound(_) => FaultKind::ServiceNotFound,
            DeployError::IntegrityMismatch { .. } => FaultKind::Integrity,
            DeployError::ExecutableNotFound(_) => FaultKind::NotFound,
            DeployError::UnknownPathToken(_)
            | DeployError::HandleNotOpen(_)
            | DeployError::AlreadyExists(_)
            | DeployError::MalformedRegistryKey(_)
            | DeployError::InvalidPath(_) => FaultKind::InvalidArgument,
            DeployError::Remote(f) => f.kind,
            _ => FaultKind::Other,
        }
    }
}

/// Converts any service-side failure into a wire fault
pub fn to_fault(err: &anyhow::Error) -> Fault {
    let mut kind = FaultKind::Other;
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<DeployError>() {
            kind = e.fault_kind();
            break;
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            kind = match e.kind() {
                std::io::ErrorKind::NotFound => FaultKind::NotFound,
                std::io::ErrorKind::Unsupported => FaultKind::Unsupported,
                _ => FaultKind::Io,
            };
            break;
        }
    }
    Fault {
        kind,
        message: format!("{err:#}"),
    }
}

/// A failure attributed to the node that produced it
#[derive(Debug)]
pub struct NodeError {
    pub node: String,
    pub inner: anyhow::Error,
}

impl NodeError {
    pub fn wrap(node: impl Into<String>, inner: anyhow::Error) -> anyhow::Error {
        anyhow::Error::new(NodeError {
            node: node.into(),
            inner,
        })
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.node, self.inner)
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// Several failures raised together
#[derive(Debug)]
pub struct AggregateError {
    pub errors: Vec<anyhow::Error>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed", self.errors.len())?;
        for e in &self.errors {
            write!(f, "; {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// One failed tracked operation, as kept by the aggregating tracker
#[derive(Debug, Clone)]
pub struct RecordedFailure {
    pub node: String,
    pub message: String,
    pub cause: String,
    pub timed_out: bool,
}

/// Every failure recorded during a headless run
#[derive(Debug)]
pub struct FailureReport {
    pub failures: Vec<RecordedFailure>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed:", self.failures.len())?;
        for r in &self.failures {
            write!(f, "\n  [{}] {}: {}", r.node, r.message, r.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureReport {}

/// True if a timeout appears anywhere in the cause chain, including causes
/// wrapped per node and causes aggregated from concurrent sub-operations
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(cause_is_timeout)
}

fn cause_is_timeout(cause: &(dyn std::error::Error + 'static)) -> bool {
    if let Some(e) = cause.downcast_ref::<DeployError>() {
        return match e {
            DeployError::Timeout { .. } => true,
            DeployError::Remote(f) => f.kind == FaultKind::Timeout,
            _ => false,
        };
    }
    if let Some(e) = cause.downcast_ref::<NodeError>() {
        return is_timeout(&e.inner);
    }
    if let Some(e) = cause.downcast_ref::<AggregateError>() {
        return e.errors.iter().any(is_timeout);
    }
    if let Some(e) = cause.downcast_ref::<FailureReport>() {
        return e.failures.iter().any(|r| r.timed_out);
    }
    false
}

/// Node names found in the chain, outermost first
pub fn attributed_nodes(err: &anyhow::Error) -> Vec<String> {
    let mut out = Vec::new();
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<NodeError>() {
            out.push(e.node.clone());
            out.extend(attributed_nodes(&e.inner));
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn timeout_err() -> anyhow::Error {
        anyhow::Error::new(DeployError::Timeout {
            path: "setup.exe".into(),
            timeout: Duration::from_secs(1),
        })
    }

    #[test]
    fn detects_direct_timeout() {
        assert!(is_timeout(&timeout_err()));
        assert!(!is_timeout(&anyhow!("plain failure")));
    }

    #[test]
    fn detects_timeout_under_context() {
        let err = timeout_err().context("install step");
        assert!(is_timeout(&err));
    }

    #[test]
    fn detects_timeout_wrapped_per_node() {
        let err = NodeError::wrap("web01", timeout_err().context("run"));
        assert!(is_timeout(&err));
        assert_eq!(attributed_nodes(&err), vec!["web01".to_string()]);
        assert!(err.to_string().starts_with("[web01]"));
    }

    #[test]
    fn detects_timeout_in_aggregate() {
        let agg = anyhow::Error::new(AggregateError {
            errors: vec![anyhow!("disk full"), NodeError::wrap("db01", timeout_err())],
        });
        assert!(is_timeout(&agg));
        let none = anyhow::Error::new(AggregateError {
            errors: vec![anyhow!("disk full")],
        });
        assert!(!is_timeout(&none));
    }

    #[test]
    fn detects_remote_timeout_fault() {
        let err = anyhow::Error::new(DeployError::Remote(Fault {
            kind: FaultKind::Timeout,
            message: "killed".into(),
        }));
        assert!(is_timeout(&err));
    }

    #[test]
    fn fault_kind_follows_chain() {
        let err = anyhow::Error::new(DeployError::ServiceNotFound("spooler".into()))
            .context("start service");
        let fault = to_fault(&err);
        assert_eq!(fault.kind, FaultKind::ServiceNotFound);
        assert!(fault.message.contains("spooler"));

        let io = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(to_fault(&io).kind, FaultKind::NotFound);
    }
}
