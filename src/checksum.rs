//! Checksum and hashing utilities

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read buffer for whole-file hashing
const HASH_BUF_SIZE: usize = 256 * 1024;

/// Available digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    /// BLAKE3, used to decide whether a transfer can be skipped
    Fast,
    /// SHA-256, used to confirm a finished transfer
    Strong,
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Fast
    }
}

/// A computed digest
#[derive(Clone, Serialize, Deserialize, Eq)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl PartialEq for Digest {
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

enum HasherState {
    Fast(Box<blake3::Hasher>),
    Strong(Sha256),
}

/// Incremental hasher: feed buffers with `append`, then `finish`
pub struct ContentHasher {
    state: HasherState,
}

impl ContentHasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let state = match algorithm {
            DigestAlgorithm::Fast => HasherState::Fast(Box::new(blake3::Hasher::new())),
            DigestAlgorithm::Strong => HasherState::Strong(Sha256::new()),
        };
        Self { state }
    }

    pub fn append(&mut self, buffer: &[u8]) {
        match &mut self.state {
            HasherState::Fast(h) => {
                h.update(buffer);
            }
            HasherState::Strong(h) => h.update(buffer),
        }
    }

    pub fn finish(self) -> Digest {
        match self.state {
            HasherState::Fast(h) => Digest(h.finalize().as_bytes().to_vec()),
            HasherState::Strong(h) => Digest(h.finalize().to_vec()),
        }
    }
}

/// Digest of an in-memory buffer
pub fn digest_of_bytes(data: &[u8], algorithm: DigestAlgorithm) -> Digest {
    let mut hasher = ContentHasher::new(algorithm);
    hasher.append(data);
    hasher.finish()
}

/// Digest of a whole file, streamed in fixed-size reads
pub fn digest_of_file(path: &Path, algorithm: DigestAlgorithm) -> Result<Digest> {
    let mut file =
        File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut hasher = ContentHasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.append(&buffer[..n]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn fast_digest_is_deterministic_and_discriminating() {
        let a = digest_of_bytes(b"Hello, World!", DigestAlgorithm::Fast);
        let b = digest_of_bytes(b"Hello, World!", DigestAlgorithm::Fast);
        let c = digest_of_bytes(b"Hello, World?", DigestAlgorithm::Fast);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        for algo in [DigestAlgorithm::Fast, DigestAlgorithm::Strong] {
            let mut hasher = ContentHasher::new(algo);
            for piece in data.chunks(7_919) {
                hasher.append(piece);
            }
            assert_eq!(hasher.finish(), digest_of_bytes(&data, algo));
        }
    }

    #[test]
    fn strong_digest_is_sha256() {
        let d = digest_of_bytes(b"abc", DigestAlgorithm::Strong);
        assert_eq!(
            d.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn unequal_lengths_are_unequal() {
        let short = Digest::from_bytes(vec![1, 2, 3]);
        let long = Digest::from_bytes(vec![1, 2, 3, 0]);
        assert_ne!(short, long);
    }

    #[test]
    fn file_digest_matches_bytes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        let data = vec![42u8; HASH_BUF_SIZE * 2 + 17];
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();
        let from_file = digest_of_file(&path, DigestAlgorithm::Strong).unwrap();
        assert_eq!(from_file, digest_of_bytes(&data, DigestAlgorithm::Strong));
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(digest_of_file(&tmp.path().join("missing"), DigestAlgorithm::Fast).is_err());
    }
}
