use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
// Filesystem enumeration and file-name wildcard matching

/// A regular file found under a source tree
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Path relative to the enumerated root, always '/'-separated
    pub relative: String,
    pub size: u64,
}

/// Wildcard match of a single file name: `*` any run, `?` any one character.
/// Case-insensitive on Windows, where file names are.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let (p, t): (Vec<char>, Vec<char>) = if cfg!(windows) {
        (
            pattern.to_lowercase().chars().collect(),
            text.to_lowercase().chars().collect(),
        )
    } else {
        (pattern.chars().collect(), text.chars().collect())
    };

    let (mut pi, mut ti) = (0usize, 0usize);
    // Position of the last '*' and the text index it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Every regular file under `root`, sorted by relative path. Symlinks are not followed.
pub fn enumerate_files(root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(path);
        let relative = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        entries.push(FileEntry {
            path: path.to_path_buf(),
            relative,
            size,
        });
    }
    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

/// Join a remote directory and a '/'-separated relative path
pub fn join_remote(dir: &str, relative: &str) -> String {
    let dir = dir.trim_end_matches(['/', '\\']);
    if dir.is_empty() {
        relative.to_string()
    } else {
        format!("{dir}/{relative}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn wildcard_basics() {
        assert!(wildcard_match("*", "anything.txt"));
        assert!(wildcard_match("*.log", "server.log"));
        assert!(!wildcard_match("*.log", "server.log.1"));
        assert!(wildcard_match("app-?.dll", "app-1.dll"));
        assert!(!wildcard_match("app-?.dll", "app-10.dll"));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
        assert!(wildcard_match("exact.txt", "exact.txt"));
        assert!(!wildcard_match("exact.txt", "other.txt"));
    }

    #[test]
    fn wildcard_backtracks() {
        assert!(wildcard_match("*ab", "aab"));
        assert!(wildcard_match("*a*a", "banana"));
        assert!(!wildcard_match("*x*", "banana"));
    }

    #[test]
    fn enumerates_nested_files_with_relative_paths() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), b"1").unwrap();
        std::fs::write(tmp.path().join("a/b/deep.bin"), b"12345").unwrap();
        std::fs::create_dir_all(tmp.path().join("empty")).unwrap();

        let files = enumerate_files(tmp.path()).unwrap();
        let rels: Vec<_> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(rels, vec!["a/b/deep.bin", "top.txt"]);
        assert_eq!(files[0].size, 5);
    }

    #[test]
    fn join_remote_handles_trailing_separators() {
        assert_eq!(join_remote("%TEMP%/app/", "x/y.txt"), "%TEMP%/app/x/y.txt");
        assert_eq!(join_remote("C:\\app\\", "y.txt"), "C:\\app/y.txt");
        assert_eq!(join_remote("", "y.txt"), "y.txt");
    }
}
