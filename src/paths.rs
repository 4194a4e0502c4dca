//! Node-side path resolution: `%TOKEN%` placeholders and optional root
//! confinement, applied before any file or process operation.

use crate::config::PathTokens;
use crate::error::DeployError;
use crate::protocol_core::normalize_under_root;
use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathResolver {
    tokens: HashMap<String, PathBuf>,
    root: Option<PathBuf>,
}

impl PathResolver {
    pub fn new(paths: &PathTokens, root: Option<PathBuf>) -> Self {
        let mut tokens = HashMap::new();
        let entries = [
            ("temp", &paths.temp),
            ("tmp", &paths.temp),
            ("localappdata", &paths.local_app_data),
            ("appdata", &paths.app_data),
            ("programdata", &paths.program_data),
            ("home", &paths.home),
            ("userprofile", &paths.home),
        ];
        for (name, value) in entries {
            if let Some(v) = value {
                tokens.insert(name.to_string(), v.clone());
            }
        }
        Self { tokens, root }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Substitute every `%NAME%` in `raw`. A token this node does not know is an error.
    pub fn expand(&self, raw: &str) -> Result<String> {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('%') else {
                // A lone '%' is literal
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let name = &after[..end];
            if name.is_empty() {
                out.push('%');
            } else {
                let value = self
                    .tokens
                    .get(&name.to_ascii_lowercase())
                    .ok_or_else(|| DeployError::UnknownPathToken(name.to_string()))?;
                out.push_str(&value.to_string_lossy());
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Expand tokens and apply root confinement
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let expanded = self.expand(raw)?;
        if expanded.trim().is_empty() {
            return Err(DeployError::InvalidPath(raw.to_string()).into());
        }
        let path = PathBuf::from(&expanded);
        match &self.root {
            Some(root) => normalize_under_root(root, &path)
                .map_err(|e| anyhow::Error::new(DeployError::InvalidPath(raw.to_string())).context(e)),
            None => Ok(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use tempfile::TempDir;

    fn resolver(root: Option<PathBuf>) -> PathResolver {
        let tokens = PathTokens {
            temp: Some(PathBuf::from("/var/tmp")),
            app_data: Some(PathBuf::from("/home/svc/.config")),
            ..Default::default()
        };
        PathResolver::new(&tokens, root)
    }

    #[test]
    fn expands_known_tokens_case_insensitively() {
        let r = resolver(None);
        assert_eq!(r.expand("%TEMP%/setup.exe").unwrap(), "/var/tmp/setup.exe");
        assert_eq!(r.expand("%AppData%/x").unwrap(), "/home/svc/.config/x");
        assert_eq!(r.expand("no tokens").unwrap(), "no tokens");
    }

    #[test]
    fn unknown_token_is_a_configuration_error() {
        let err = resolver(None).expand("%WINDIR%/x").unwrap_err();
        match err.downcast_ref::<DeployError>() {
            Some(DeployError::UnknownPathToken(name)) => assert_eq!(name, "WINDIR"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unset_token_is_unknown() {
        // program_data not configured in this resolver
        assert!(resolver(None).expand("%PROGRAMDATA%/x").is_err());
    }

    #[test]
    fn lone_percent_is_literal() {
        let r = resolver(None);
        assert_eq!(r.expand("100%").unwrap(), "100%");
        assert_eq!(r.expand("a%%b").unwrap(), "a%b");
    }

    #[test]
    fn root_confines_resolved_paths() {
        let tmp = TempDir::new().unwrap();
        let r = resolver(Some(tmp.path().to_path_buf()));
        let p = r.resolve("%TEMP%/app.bin").unwrap();
        assert!(p.ends_with("var/tmp/app.bin"));
        assert!(r.resolve("../escape").is_err());
        assert!(r.resolve("").is_err());
    }
}
