//! Node-side file service.
//!
//! One `FileService` exists per connection: the open-handle map belongs to
//! the session and `close_all` runs when the session ends, whatever the
//! reason. All methods are blocking and are called from `spawn_blocking`.

use crate::checksum::{digest_of_file, Digest, DigestAlgorithm};
use crate::error::DeployError;
use crate::fs_enum::wildcard_match;
use crate::paths::PathResolver;
use crate::protocol_core::{clear_readonly_recursive, ensure_dir_exists, ensure_parent_exists};
use crate::wire::{Batch, ExistsQuery, FileCall, Response};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Attempts made by `delete_directory` before giving up
pub const DELETE_ATTEMPTS: u32 = 3;

/// Backoff unit between directory delete attempts (multiplied by the attempt number)
pub const DELETE_BACKOFF: Duration = Duration::from_millis(100);

type Handle = Arc<Mutex<File>>;

pub struct FileService {
    resolver: Arc<PathResolver>,
    handles: Mutex<HashMap<PathBuf, Handle>>,
}

fn remove_file_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            // Read-only files refuse deletion on Windows
            clear_readonly_recursive(path);
            fs::remove_file(path).map(|_| true)
        }
        Err(e) => Err(e),
    }
}

impl FileService {
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self {
            resolver,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        self.resolver.resolve(raw)
    }

    /// Dispatch one wire call
    pub fn call(&self, call: FileCall) -> Result<Response> {
        Ok(match call {
            FileCall::Exists { path, size, digest } => {
                Response::Bool(self.exists(&path, size, &digest)?)
            }
            FileCall::ExistsMany(queries) => Response::Bools(self.exists_many(&queries)?),
            FileCall::Open { path, size } => {
                self.open(&path, size)?;
                Response::Unit
            }
            FileCall::WriteAt { path, offset, data } => {
                self.write_at(&path, offset, &data)?;
                Response::Unit
            }
            FileCall::Close { path } => {
                self.close(&path)?;
                Response::Unit
            }
            FileCall::DeleteFile { path } => {
                self.delete_file(&path)?;
                Response::Unit
            }
            FileCall::DeleteMatching { pattern } => {
                Response::Count(self.delete_files_matching(&pattern)?)
            }
            FileCall::CreateDirectory { path } => {
                self.create_directory(&path)?;
                Response::Unit
            }
            FileCall::DeleteDirectory { path, recursive } => {
                self.delete_directory(&path, recursive)?;
                Response::Unit
            }
            FileCall::Digest { path, algorithm } => {
                Response::Digest(self.digest_of_file(&path, algorithm)?)
            }
            FileCall::ExecuteBatch(batch) => {
                self.execute_batch(&batch)?;
                Response::Unit
            }
            FileCall::Unzip {
                archive,
                destination,
                overwrite,
            } => Response::Count(self.unzip(&archive, &destination, overwrite)?),
        })
    }

    pub fn exists(&self, raw: &str, expected_size: u64, expected: &Digest) -> Result<bool> {
        let path = self.resolve(raw)?;
        let md = match fs::metadata(&path) {
            Ok(md) => md,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        };
        if !md.is_file() || md.len() != expected_size {
            return Ok(false);
        }
        let actual = digest_of_file(&path, DigestAlgorithm::Fast)?;
        Ok(&actual == expected)
    }

    pub fn exists_many(&self, queries: &[ExistsQuery]) -> Result<Vec<bool>> {
        queries
            .iter()
            .map(|q| self.exists(&q.path, q.size, &q.digest))
            .collect()
    }

    pub fn open(&self, raw: &str, size: u64) -> Result<()> {
        let path = self.resolve(raw)?;
        remove_file_if_present(&path).with_context(|| format!("remove {}", path.display()))?;
        ensure_parent_exists(&path)
            .with_context(|| format!("create parent of {}", path.display()))?;
        // Parents exist now, so the key is the canonical form later calls resolve to
        let path = self.resolve(raw)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        file.set_len(size)
            .with_context(|| format!("preallocate {}", path.display()))?;
        // Replaces (and thereby closes) any handle already open for this path
        self.handles.lock().insert(path, Arc::new(Mutex::new(file)));
        Ok(())
    }

    pub fn write_at(&self, raw: &str, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.resolve(raw)?;
        let handle = self
            .handles
            .lock()
            .get(&path)
            .cloned()
            .ok_or_else(|| DeployError::HandleNotOpen(path.clone()))?;
        let mut file = handle.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .with_context(|| format!("write {} bytes at {} in {}", data.len(), offset, path.display()))
    }

    pub fn close(&self, raw: &str) -> Result<()> {
        let path = self.resolve(raw)?;
        let handle = self.handles.lock().remove(&path);
        if let Some(handle) = handle {
            let mut file = handle.lock();
            file.flush()
                .and_then(|_| file.sync_all())
                .with_context(|| format!("flush {}", path.display()))?;
        }
        Ok(())
    }

    /// Force-close every open handle; returns how many were open
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.handles.lock().drain().collect();
        let n = drained.len();
        for (_, handle) in drained {
            let _ = handle.lock().flush();
        }
        n
    }

    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn delete_file(&self, raw: &str) -> Result<()> {
        let path = self.resolve(raw)?;
        remove_file_if_present(&path).with_context(|| format!("delete {}", path.display()))?;
        Ok(())
    }

    /// `pattern` is a directory plus a file-name wildcard, e.g. `%TEMP%/app/*.log`
    pub fn delete_files_matching(&self, raw: &str) -> Result<u32> {
        let (dir_raw, name_pattern) = match raw.rfind(['/', '\\']) {
            Some(pos) => (&raw[..pos], &raw[pos + 1..]),
            None => (".", raw),
        };
        let dir = self.resolve(if dir_raw.is_empty() { "/" } else { dir_raw })?;
        let entries = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("list {}", dir.display())),
        };
        let mut removed = 0u32;
        for entry in entries.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_file && wildcard_match(name_pattern, &name) {
                let p = entry.path();
                if remove_file_if_present(&p).with_context(|| format!("delete {}", p.display()))? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn create_directory(&self, raw: &str) -> Result<()> {
        let path = self.resolve(raw)?;
        ensure_dir_exists(&path).with_context(|| format!("create directory {}", path.display()))
    }

    pub fn delete_directory(&self, raw: &str, recursive: bool) -> Result<()> {
        let path = self.resolve(raw)?;
        let mut last_err: Option<io::Error> = None;
        for attempt in 1..=DELETE_ATTEMPTS {
            let result = if recursive {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_dir(&path)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    if e.kind() == io::ErrorKind::PermissionDenied {
                        clear_readonly_recursive(&path);
                    }
                    last_err = Some(e);
                }
            }
            if attempt < DELETE_ATTEMPTS {
                std::thread::sleep(DELETE_BACKOFF * attempt);
            }
        }
        let err = last_err.unwrap_or_else(|| io::Error::other("directory delete failed"));
        Err(err).with_context(|| {
            format!(
                "delete directory {} failed after {} attempts",
                path.display(),
                DELETE_ATTEMPTS
            )
        })
    }

    pub fn digest_of_file(&self, raw: &str, algorithm: DigestAlgorithm) -> Result<Digest> {
        let path = self.resolve(raw)?;
        digest_of_file(&path, algorithm)
    }

    pub fn execute_batch(&self, batch: &Batch) -> Result<()> {
        for item in &batch.items {
            let path = self.resolve(&item.path)?;
            remove_file_if_present(&path).with_context(|| format!("remove {}", path.display()))?;
            ensure_parent_exists(&path)
                .with_context(|| format!("create parent of {}", path.display()))?;
            let mut file =
                File::create(&path).with_context(|| format!("create {}", path.display()))?;
            file.write_all(&item.data)
                .with_context(|| format!("write {}", path.display()))?;
        }
        Ok(())
    }

    /// Extract every entry; returns the number of files written
    pub fn unzip(&self, archive: &str, destination: &str, overwrite: bool) -> Result<u32> {
        let archive_path = self.resolve(archive)?;
        let dest = self.resolve(destination)?;
        let file = File::open(&archive_path)
            .with_context(|| format!("open archive {}", archive_path.display()))?;
        let mut zip = zip::ZipArchive::new(file)
            .with_context(|| format!("read archive {}", archive_path.display()))?;
        ensure_dir_exists(&dest)?;

        let mut written = 0u32;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let rel = entry
                .enclosed_name()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| DeployError::InvalidPath(entry.name().to_string()))?;
            let out = dest.join(rel);
            if entry.is_dir() {
                ensure_dir_exists(&out)?;
                continue;
            }
            if out.exists() {
                if !overwrite {
                    return Err(DeployError::AlreadyExists(out).into());
                }
                remove_file_if_present(&out)?;
            }
            ensure_parent_exists(&out)?;
            let mut f = File::create(&out).with_context(|| format!("create {}", out.display()))?;
            io::copy(&mut entry, &mut f).with_context(|| format!("extract {}", out.display()))?;
            written += 1;
        }
        Ok(written)
    }
}

impl Drop for FileService {
    fn drop(&mut self) {
        self.close_all();
    }
}
