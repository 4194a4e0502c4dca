//! Request/response messages carried in REQUEST and RESPONSE frames.
//!
//! Payloads are bincode-encoded envelopes. Every request names the node
//! service it targets by its variant; `Request::service_id` gives the fixed
//! numeric identifier from `protocol::service`.

use crate::checksum::{Digest, DigestAlgorithm};
use crate::protocol::service;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One existence query: does `path` hold a file of `size` bytes with this fast digest?
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsQuery {
    pub path: String,
    pub size: u64,
    pub digest: Digest,
}

/// One inline small-file payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub path: String,
    pub data: Vec<u8>,
}

/// Small files sent together in one request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Batch {
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn push(&mut self, path: String, data: Vec<u8>) {
        self.items.push(BatchItem { path, data });
    }

    pub fn payload_bytes(&self) -> usize {
        self.items.iter().map(|i| i.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileCall {
    Exists { path: String, size: u64, digest: Digest },
    ExistsMany(Vec<ExistsQuery>),
    Open { path: String, size: u64 },
    WriteAt { path: String, offset: u64, data: Vec<u8> },
    Close { path: String },
    DeleteFile { path: String },
    DeleteMatching { pattern: String },
    CreateDirectory { path: String },
    DeleteDirectory { path: String, recursive: bool },
    Digest { path: String, algorithm: DigestAlgorithm },
    ExecuteBatch(Batch),
    Unzip { archive: String, destination: String, overwrite: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub path: String,
    pub args: Vec<String>,
    /// `None` waits indefinitely
    pub timeout: Option<Duration>,
    pub capture_output_on_failure: bool,
    pub show_window: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessCall {
    Run(RunSpec),
    Shell { command: String, show_window: bool },
    KillAll { names: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceCall {
    Start { name: String },
    Stop { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryCall {
    Read { key: String, value_name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    File(FileCall),
    Process(ProcessCall),
    Service(ServiceCall),
    Registry(RegistryCall),
}

impl Request {
    pub fn service_id(&self) -> u8 {
        match self {
            Request::File(_) => service::FILE,
            Request::Process(_) => service::PROCESS,
            Request::Service(_) => service::SERVICE_CONTROL,
            Request::Registry(_) => service::REGISTRY,
        }
    }

    /// Short description for logs; never includes payload bytes
    pub fn describe(&self) -> String {
        match self {
            Request::File(FileCall::Exists { path, .. }) => format!("exists {path}"),
            Request::File(FileCall::ExistsMany(q)) => format!("exists x{}", q.len()),
            Request::File(FileCall::Open { path, size }) => format!("open {path} ({size} bytes)"),
            Request::File(FileCall::WriteAt { path, offset, data }) => {
                format!("write {path} @{offset} +{}", data.len())
            }
            Request::File(FileCall::Close { path }) => format!("close {path}"),
            Request::File(FileCall::DeleteFile { path }) => format!("delete {path}"),
            Request::File(FileCall::DeleteMatching { pattern }) => format!("delete {pattern}"),
            Request::File(FileCall::CreateDirectory { path }) => format!("mkdir {path}"),
            Request::File(FileCall::DeleteDirectory { path, .. }) => format!("rmdir {path}"),
            Request::File(FileCall::Digest { path, .. }) => format!("digest {path}"),
            Request::File(FileCall::ExecuteBatch(b)) => format!("batch x{}", b.len()),
            Request::File(FileCall::Unzip { archive, .. }) => format!("unzip {archive}"),
            Request::Process(ProcessCall::Run(spec)) => format!("run {}", spec.path),
            Request::Process(ProcessCall::Shell { command, .. }) => format!("shell {command}"),
            Request::Process(ProcessCall::KillAll { names }) => format!("kill {}", names.join(",")),
            Request::Service(ServiceCall::Start { name }) => format!("service start {name}"),
            Request::Service(ServiceCall::Stop { name }) => format!("service stop {name}"),
            Request::Registry(RegistryCall::Read { key, value_name }) => {
                format!("registry {key}\\{value_name}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryValue {
    String(String),
    Dword(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Unit,
    Bool(bool),
    Bools(Vec<bool>),
    Count(u32),
    Digest(Digest),
    Output(ProcessOutput),
    ExitCode(i32),
    Registry(Option<RegistryValue>),
}

impl Response {
    fn mismatch(&self, expected: &str) -> anyhow::Error {
        anyhow::Error::new(crate::error::DeployError::Protocol(format!(
            "expected {expected} response, got {self:?}"
        )))
    }

    pub fn into_unit(self) -> Result<()> {
        match self {
            Response::Unit => Ok(()),
            other => Err(other.mismatch("unit")),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            Response::Bool(b) => Ok(b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn into_bools(self) -> Result<Vec<bool>> {
        match self {
            Response::Bools(b) => Ok(b),
            other => Err(other.mismatch("bool list")),
        }
    }

    pub fn into_count(self) -> Result<u32> {
        match self {
            Response::Count(n) => Ok(n),
            other => Err(other.mismatch("count")),
        }
    }

    pub fn into_digest(self) -> Result<Digest> {
        match self {
            Response::Digest(d) => Ok(d),
            other => Err(other.mismatch("digest")),
        }
    }

    pub fn into_output(self) -> Result<ProcessOutput> {
        match self {
            Response::Output(o) => Ok(o),
            other => Err(other.mismatch("process output")),
        }
    }

    pub fn into_exit_code(self) -> Result<i32> {
        match self {
            Response::ExitCode(c) => Ok(c),
            other => Err(other.mismatch("exit code")),
        }
    }

    pub fn into_registry(self) -> Result<Option<RegistryValue>> {
        match self {
            Response::Registry(v) => Ok(v),
            other => Err(other.mismatch("registry value")),
        }
    }
}

/// Classification of a callee-side failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    Io,
    NotFound,
    Timeout,
    InvalidArgument,
    ServiceNotFound,
    Integrity,
    Unsupported,
    Other,
}

/// A failure raised by a node service, as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub result: std::result::Result<Response, Fault>,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).context("encode message")
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    bincode::deserialize(bytes).context("decode message")
}
