//! Deployment plans: a TOML list of steps run against each target node.
//!
//! ```toml
//! [args]
//! version = "1.4.0"
//!
//! [[step]]
//! action = "copy"
//! source = "build/app-${version}.exe"
//! destination = "%PROGRAMDATA%/app/app.exe"
//!
//! [[step]]
//! action = "start_service"
//! name = "app"
//! ```
//!
//! `${name}` is replaced in every step string before the plan runs. Values
//! come from the `[args]` table, overridden by `--arg name=value`.

use crate::node::Node;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot read plan {path}: {source}")]
    Access {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{origin}: {message}")]
    Compile { origin: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Copy {
        source: PathBuf,
        destination: String,
    },
    CopyDirectory {
        source: PathBuf,
        destination: String,
    },
    Install {
        installer: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        timeout_secs: Option<u64>,
    },
    Execute {
        path: String,
        #[serde(default)]
        args: Vec<String>,
        timeout_secs: Option<u64>,
    },
    Shell {
        command: String,
        #[serde(default)]
        ignore_exit_code: bool,
    },
    StartService {
        name: String,
    },
    StopService {
        name: String,
    },
    KillProcesses {
        names: Vec<String>,
    },
    DeleteFile {
        path: String,
    },
    DeleteFiles {
        pattern: String,
    },
    CreateDirectory {
        path: String,
    },
    DeleteDirectory {
        path: String,
    },
    Unzip {
        archive: String,
        destination: String,
        #[serde(default)]
        overwrite: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<Step>,
    /// Relative local sources are taken from here
    pub base_dir: PathBuf,
}

/// Replace every `${name}` in `text`
pub fn substitute(text: &str, args: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated reference in \"{text}\""))?;
        let name = after[..end].trim();
        let value = args
            .get(name)
            .ok_or_else(|| format!("unknown argument ${{{name}}}"))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn substitute_value(value: &mut toml::Value, args: &BTreeMap<String, String>) -> Result<(), String> {
    match value {
        toml::Value::String(s) => *s = substitute(s, args)?,
        toml::Value::Array(items) => {
            for item in items {
                substitute_value(item, args)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute_value(item, args)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Parse `name=value` pairs from the command line
pub fn parse_args(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("argument '{pair}' is not name=value"))?;
        if name.trim().is_empty() {
            anyhow::bail!("argument '{pair}' has an empty name");
        }
        out.insert(name.trim().to_string(), value.to_string());
    }
    Ok(out)
}

impl Plan {
    pub fn load(path: &Path, overrides: &BTreeMap<String, String>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Access {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::parse(&text, overrides, &path.display().to_string(), base_dir)?)
    }

    pub fn parse(
        text: &str,
        overrides: &BTreeMap<String, String>,
        origin: &str,
        base_dir: PathBuf,
    ) -> Result<Self, PlanError> {
        let compile = |message: String| PlanError::Compile {
            origin: origin.to_string(),
            message,
        };
        let mut doc: toml::Table = text.parse().map_err(|e: toml::de::Error| compile(e.to_string()))?;

        let mut args = BTreeMap::new();
        if let Some(table) = doc.remove("args") {
            let table = table
                .as_table()
                .ok_or_else(|| compile("[args] must be a table".into()))?;
            for (name, value) in table {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                args.insert(name.clone(), value);
            }
        }
        args.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut steps = doc.remove("step").unwrap_or(toml::Value::Array(Vec::new()));
        if let Some(key) = doc.keys().next() {
            return Err(compile(format!("unexpected top-level key '{key}'")));
        }
        let toml::Value::Array(items) = &mut steps else {
            return Err(compile("'step' must be an array of tables".into()));
        };
        let mut parsed = Vec::with_capacity(items.len());
        for (i, item) in items.iter_mut().enumerate() {
            substitute_value(item, &args).map_err(|m| compile(format!("step {}: {m}", i + 1)))?;
            let step: Step = item
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| compile(format!("step {}: {e}", i + 1)))?;
            parsed.push(step);
        }
        if parsed.is_empty() {
            return Err(compile("plan has no steps".into()));
        }
        Ok(Self {
            steps: parsed,
            base_dir,
        })
    }

    fn local(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    /// Run every step on `node` in order, stopping at the first failure
    pub async fn run_on(&self, node: &dyn Node, default_timeout: Option<Duration>) -> Result<()> {
        let timeout = |secs: &Option<u64>| secs.map(Duration::from_secs).or(default_timeout);
        for (i, step) in self.steps.iter().enumerate() {
            let result = match step {
                Step::Copy {
                    source,
                    destination,
                } => node.copy_file(&self.local(source), destination).await.map(drop),
                Step::CopyDirectory {
                    source,
                    destination,
                } => node
                    .copy_directory(&self.local(source), destination)
                    .await
                    .map(drop),
                Step::Install {
                    installer,
                    args,
                    timeout_secs,
                } => {
                    node.install(&self.local(installer), args, timeout(timeout_secs))
                        .await
                }
                Step::Execute {
                    path,
                    args,
                    timeout_secs,
                } => node.execute(path, args, timeout(timeout_secs)).await,
                Step::Shell {
                    command,
                    ignore_exit_code: true,
                } => node.shell(command).await.map(drop),
                Step::Shell { command, .. } => node.shell_checked(command).await,
                Step::StartService { name } => node.start_service(name).await,
                Step::StopService { name } => node.stop_service(name).await,
                Step::KillProcesses { names } => node.kill_processes(names).await.map(drop),
                Step::DeleteFile { path } => node.delete_file(path).await,
                Step::DeleteFiles { pattern } => node.delete_files(pattern).await.map(drop),
                Step::CreateDirectory { path } => node.create_directory(path).await,
                Step::DeleteDirectory { path } => node.delete_directory(path).await,
                Step::Unzip {
                    archive,
                    destination,
                    overwrite,
                } => node.unzip(archive, destination, *overwrite).await.map(drop),
            };
            result.with_context(|| format!("step {} failed on {}", i + 1, node.name()))?;
        }
        Ok(())
    }
}

/// Per-node result of a plan run
pub struct NodeRun {
    pub node: String,
    pub result: Result<()>,
}

/// Run `plan` on every node at once; one node failing never stops the others
pub async fn run_plan(
    plan: &Plan,
    nodes: Vec<Arc<dyn Node>>,
    default_timeout: Option<Duration>,
) -> Vec<NodeRun> {
    let runs = nodes.iter().map(|node| async move {
        NodeRun {
            node: node.name().to_string(),
            result: plan.run_on(node.as_ref(), default_timeout).await,
        }
    });
    futures::future::join_all(runs).await
}
