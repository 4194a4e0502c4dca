//! Shared protocol logic for the node server and the distributor client
//!
//! Frame I/O is generic over any async stream so plain TCP and TLS
//! connections share one implementation.

use crate::protocol::{timeouts, MAGIC, MAX_FRAME_SIZE, VERSION};
use anyhow::{anyhow, bail, Result};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

pub const HEADER_LEN: usize = 11;

/// Validate frame payload size using protocol::MAX_FRAME_SIZE directly
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        bail!("invalid magic in frame header");
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
    }
    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    Ok((frame_type, payload_len))
}

/// Read one frame. Waiting for the header is unbounded (callers wrap it
/// in their own idle timeout); the payload must follow promptly.
pub async fn read_frame<S>(stream: &mut S) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    stream.read_exact(&mut hdr).await?;
    let (typ, len) = parse_frame_header(&hdr)?;
    let len = len as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        let ms = timeouts::read_deadline_ms(len);
        match timeout(Duration::from_millis(ms), stream.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => bail!("frame payload read timeout ({} ms)", ms),
        }
    }
    Ok((typ, payload))
}

pub async fn read_frame_timed<S>(stream: &mut S, ms: u64) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    match timeout(Duration::from_millis(ms), read_frame(stream)).await {
        Ok(res) => res,
        Err(_) => bail!("frame IO timeout ({} ms)", ms),
    }
}

pub async fn write_frame<S>(stream: &mut S, t: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    validate_frame_size(payload.len())?;
    let hdr = build_frame_header(t, payload.len() as u32);
    stream.write_all(&hdr).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Confine a path under a root directory.
/// 1. Parent directory components and NUL bytes are rejected
/// 2. Root/prefix components are stripped, so absolute paths land under root
/// 3. On Windows, ':' in a component is rejected (ADS defense)
/// 4. Symlinks resolving outside the root are rejected
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut joined = root.to_path_buf();
    for component in p.components() {
        match component {
            CurDir | Prefix(_) | RootDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                joined.push(s);
            }
            ParentDir => bail!("path contains disallowed component: {:?}", component),
        }
    }

    let canon_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

    // Existing paths: canonicalize to resolve symlinks
    if let Ok(canon) = std::fs::canonicalize(&joined) {
        if !canon.starts_with(&canon_root) {
            bail!("path {:?} escapes root {:?} via symlinks", p, root);
        }
        return Ok(canon);
    }

    // New files: canonicalize the parent, keep the final component
    if let Some(parent) = joined.parent() {
        if let Ok(canon_parent) = std::fs::canonicalize(parent) {
            if !canon_parent.starts_with(&canon_root) {
                bail!("parent of {:?} escapes root {:?} via symlinks", p, root);
            }
            if let Some(file_name) = joined.file_name() {
                return Ok(canon_parent.join(file_name));
            }
        }
    }

    if !joined.starts_with(root) {
        return Err(anyhow!("path {:?} escapes root {:?}", p, root));
    }
    Ok(joined)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir_exists(parent)?;
        }
    }
    Ok(())
}

/// Recursively clear the read-only attribute from a path and all its contents.
/// Best effort: errors on individual entries are skipped.
pub fn clear_readonly_recursive(path: &Path) {
    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if metadata.file_type().is_symlink() {
            return;
        }
        if metadata.permissions().readonly() {
            let mut perms = metadata.permissions();
            perms.set_readonly(false);
            let _ = std::fs::set_permissions(path, perms);
        }
        if metadata.is_dir() {
            if let Ok(entries) = std::fs::read_dir(path) {
                for entry in entries.flatten() {
                    clear_readonly_recursive(&entry.path());
                }
            }
        }
    }
}
