//! Distributor-side transfer strategy.
//!
//! Each file is described once (size + fast digest) before any network
//! call. Files up to half the chunk budget travel inline in batches; larger
//! ones go through an open / write-at / close session and are verified with
//! a strong digest afterwards.

use crate::checksum::{digest_of_file, ContentHasher, Digest, DigestAlgorithm};
use crate::error::DeployError;
use crate::fs_enum::{enumerate_files, join_remote};
use crate::logger::Logger;
use crate::services::Dispatch;
use crate::task_queue::BoundedTaskQueue;
use crate::wire::{Batch, ExistsQuery, FileCall, ProcessCall, ProcessOutput, Request, RunSpec};
use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Arguments passed to an installer when none are given
pub const DEFAULT_INSTALL_ARGS: &[&str] = &["/S"];

/// One file to transfer
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub source: PathBuf,
    pub destination: String,
    pub size: u64,
    pub fast: Digest,
}

impl FileDescriptor {
    pub fn compute(source: &Path, destination: &str) -> Result<Self> {
        let size = std::fs::metadata(source)
            .with_context(|| format!("stat {}", source.display()))?
            .len();
        Ok(Self {
            source: source.to_path_buf(),
            destination: destination.to_string(),
            size,
            fast: digest_of_file(source, DigestAlgorithm::Fast)?,
        })
    }
}

/// Describe every pair in parallel
pub fn describe_all(pairs: &[(PathBuf, String)]) -> Result<Vec<FileDescriptor>> {
    pairs
        .par_iter()
        .map(|(src, dst)| FileDescriptor::compute(src, dst))
        .collect()
}

/// What a copy actually moved
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyStats {
    /// Files sent as chunk sessions
    pub files_sent: u64,
    /// Files sent inline in batches
    pub files_batched: u64,
    /// Files already present with matching content
    pub files_skipped: u64,
    pub bytes_sent: u64,
    pub batches: u64,
}

impl CopyStats {
    pub fn merge(&mut self, other: &CopyStats) {
        self.files_sent += other.files_sent;
        self.files_batched += other.files_batched;
        self.files_skipped += other.files_skipped;
        self.bytes_sent += other.bytes_sent;
        self.batches += other.batches;
    }

    pub fn files_transferred(&self) -> u64 {
        self.files_sent + self.files_batched
    }
}

pub struct SyncClient {
    dispatch: Arc<dyn Dispatch>,
    chunk_size: usize,
    max_in_flight: usize,
    logger: Arc<dyn Logger>,
}

/// Fill `buf` unless the file ends first; returns the bytes read
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl SyncClient {
    pub fn new(
        dispatch: Arc<dyn Dispatch>,
        chunk_size: usize,
        max_in_flight: usize,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            dispatch,
            chunk_size: chunk_size.max(2),
            max_in_flight: max_in_flight.max(1),
            logger,
        }
    }

    pub fn is_small(&self, size: u64) -> bool {
        size <= (self.chunk_size / 2) as u64
    }

    pub async fn copy_file(&self, source: &Path, destination: &str) -> Result<CopyStats> {
        self.copy_files(vec![(source.to_path_buf(), destination.to_string())])
            .await
    }

    /// Large files first, one chunk session each, then small files in batches
    pub async fn copy_files(&self, pairs: Vec<(PathBuf, String)>) -> Result<CopyStats> {
        let descriptors = tokio::task::spawn_blocking(move || describe_all(&pairs))
            .await
            .context("describe source files")??;
        let (small, large): (Vec<_>, Vec<_>) =
            descriptors.into_iter().partition(|d| self.is_small(d.size));

        let mut stats = CopyStats::default();
        for desc in &large {
            stats.merge(&self.send_large(desc).await?);
        }
        stats.merge(&self.send_small(&small).await?);
        Ok(stats)
    }

    /// Mirror every file under `source` into `destination`; nothing is deleted
    pub async fn copy_directory(&self, source: &Path, destination: &str) -> Result<CopyStats> {
        let root = source.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || enumerate_files(&root))
            .await
            .context("enumerate source tree")??;
        let pairs = entries
            .into_iter()
            .map(|e| {
                let dst = join_remote(destination, &e.relative);
                (e.path, dst)
            })
            .collect();
        self.copy_files(pairs).await
    }

    /// Copy an installer into the node temp folder and run it there
    pub async fn install(
        &self,
        source: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ProcessOutput> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", source.display()))?;
        let remote = format!("%TEMP%/{name}");
        self.copy_file(source, &remote).await?;
        let args = if args.is_empty() {
            DEFAULT_INSTALL_ARGS.iter().map(|a| a.to_string()).collect()
        } else {
            args.to_vec()
        };
        self.dispatch
            .call(Request::Process(ProcessCall::Run(RunSpec {
                path: remote,
                args,
                timeout,
                capture_output_on_failure: true,
                show_window: false,
            })))
            .await?
            .into_output()
    }

    async fn send_large(&self, desc: &FileDescriptor) -> Result<CopyStats> {
        let mut stats = CopyStats::default();
        let present = self
            .dispatch
            .call(Request::File(FileCall::Exists {
                path: desc.destination.clone(),
                size: desc.size,
                digest: desc.fast.clone(),
            }))
            .await?
            .into_bool()?;
        if present {
            self.logger.skipped(self.dispatch.peer(), &desc.destination);
            stats.files_skipped = 1;
            return Ok(stats);
        }

        self.dispatch
            .call(Request::File(FileCall::Open {
                path: desc.destination.clone(),
                size: desc.size,
            }))
            .await?
            .into_unit()?;

        let queue = BoundedTaskQueue::new(self.max_in_flight);
        let mut hasher = ContentHasher::new(DigestAlgorithm::Strong);
        let streamed = self.stream_chunks(desc, &queue, &mut hasher).await;
        let writes = queue.wait_all().await;
        let closed = self
            .dispatch
            .call(Request::File(FileCall::Close {
                path: desc.destination.clone(),
            }))
            .await
            .and_then(|r| r.into_unit());
        let sent = streamed?;
        writes?;
        closed?;
        if sent != desc.size {
            bail!(
                "{} changed size during transfer ({} bytes expected, {} read)",
                desc.source.display(),
                desc.size,
                sent
            );
        }

        let remote = self
            .dispatch
            .call(Request::File(FileCall::Digest {
                path: desc.destination.clone(),
                algorithm: DigestAlgorithm::Strong,
            }))
            .await?
            .into_digest()?;
        let local = hasher.finish();
        if local != remote {
            return Err(DeployError::IntegrityMismatch {
                path: desc.destination.clone(),
                local: local.to_hex(),
                remote: remote.to_hex(),
            }
            .into());
        }

        self.logger
            .transfer_done(self.dispatch.peer(), &desc.destination, sent);
        stats.files_sent = 1;
        stats.bytes_sent = sent;
        Ok(stats)
    }

    /// Read the source in chunk-sized slices, queueing one write per slice
    async fn stream_chunks(
        &self,
        desc: &FileDescriptor,
        queue: &BoundedTaskQueue,
        hasher: &mut ContentHasher,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::open(&desc.source)
            .await
            .with_context(|| format!("open {}", desc.source.display()))?;
        let mut offset = 0u64;
        loop {
            let mut buf = vec![0u8; self.chunk_size];
            let n = read_full(&mut file, &mut buf)
                .await
                .with_context(|| format!("read {}", desc.source.display()))?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            hasher.append(&buf);
            let dispatch = self.dispatch.clone();
            let path = desc.destination.clone();
            let at = offset;
            queue
                .add(async move {
                    dispatch
                        .call(Request::File(FileCall::WriteAt {
                            path,
                            offset: at,
                            data: buf,
                        }))
                        .await?
                        .into_unit()
                })
                .await;
            offset += n as u64;
        }
        Ok(offset)
    }

    async fn send_small(&self, descs: &[FileDescriptor]) -> Result<CopyStats> {
        let mut stats = CopyStats::default();
        if descs.is_empty() {
            return Ok(stats);
        }
        let queries = descs
            .iter()
            .map(|d| ExistsQuery {
                path: d.destination.clone(),
                size: d.size,
                digest: d.fast.clone(),
            })
            .collect();
        let present = self
            .dispatch
            .call(Request::File(FileCall::ExistsMany(queries)))
            .await?
            .into_bools()?;
        if present.len() != descs.len() {
            return Err(DeployError::Protocol(format!(
                "{} existence answers for {} files",
                present.len(),
                descs.len()
            ))
            .into());
        }

        let queue = BoundedTaskQueue::new(self.max_in_flight);
        let mut batch = Batch::default();
        let mut sent = Vec::new();
        for (desc, present) in descs.iter().zip(present) {
            if present {
                self.logger.skipped(self.dispatch.peer(), &desc.destination);
                stats.files_skipped += 1;
                continue;
            }
            let data = tokio::fs::read(&desc.source)
                .await
                .with_context(|| format!("read {}", desc.source.display()))?;
            stats.files_batched += 1;
            stats.bytes_sent += data.len() as u64;
            batch.push(desc.destination.clone(), data);
            sent.push(desc);
            if batch.payload_bytes() >= self.chunk_size {
                self.flush(&queue, std::mem::take(&mut batch), &mut stats).await;
            }
        }
        if !batch.is_empty() {
            self.flush(&queue, batch, &mut stats).await;
        }
        queue.wait_all().await?;

        for desc in sent {
            self.logger
                .transfer_done(self.dispatch.peer(), &desc.destination, desc.size);
        }
        Ok(stats)
    }

    async fn flush(&self, queue: &BoundedTaskQueue, batch: Batch, stats: &mut CopyStats) {
        stats.batches += 1;
        let dispatch = self.dispatch.clone();
        queue
            .add(async move {
                dispatch
                    .call(Request::File(FileCall::ExecuteBatch(batch)))
                    .await?
                    .into_unit()
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::logger::NoopLogger;
    use crate::services::{LocalDispatch, SharedServices};
    use crate::wire::Response;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Counts requests by kind and can corrupt chunk payloads
    struct Recording {
        inner: LocalDispatch,
        log: Mutex<Vec<String>>,
        corrupt_writes: bool,
    }

    #[async_trait]
    impl Dispatch for Recording {
        async fn call(&self, request: Request) -> Result<Response> {
            let kind = match &request {
                Request::File(FileCall::WriteAt { .. }) => "write",
                Request::File(FileCall::ExecuteBatch(_)) => "batch",
                Request::File(FileCall::Exists { .. }) => "exists",
                Request::File(FileCall::ExistsMany(_)) => "exists_many",
                Request::File(FileCall::Open { .. }) => "open",
                _ => "other",
            };
            self.log.lock().push(kind.to_string());
            let request = match request {
                Request::File(FileCall::WriteAt { path, offset, mut data }) if self.corrupt_writes => {
                    data[0] ^= 0xff;
                    Request::File(FileCall::WriteAt { path, offset, data })
                }
                other => other,
            };
            self.inner.call(request).await
        }

        fn peer(&self) -> &str {
            "test-node"
        }
    }

    impl Recording {
        fn count(&self, kind: &str) -> usize {
            self.log.lock().iter().filter(|k| *k == kind).count()
        }
    }

    struct Fixture {
        src: TempDir,
        node: TempDir,
        dispatch: Arc<Recording>,
    }

    fn fixture(corrupt_writes: bool) -> Fixture {
        let src = TempDir::new().unwrap();
        let node = TempDir::new().unwrap();
        let cfg = NodeConfig {
            root: Some(node.path().to_path_buf()),
            ..Default::default()
        };
        let shared = Arc::new(SharedServices::from_config(&cfg, Arc::new(NoopLogger)));
        let dispatch = Arc::new(Recording {
            inner: LocalDispatch::new(shared),
            log: Mutex::new(Vec::new()),
            corrupt_writes,
        });
        Fixture { src, node, dispatch }
    }

    fn client(f: &Fixture, chunk: usize) -> SyncClient {
        SyncClient::new(f.dispatch.clone(), chunk, 4, Arc::new(NoopLogger))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn boundary_sizes_copy_byte_exact() {
        let f = fixture(false);
        let chunk = 64;
        let sync = client(&f, chunk);
        for len in [0, 1, chunk, chunk + 1, 3 * chunk] {
            let name = format!("f{len}.bin");
            let data = pattern(len);
            std::fs::write(f.src.path().join(&name), &data).unwrap();
            sync.copy_file(&f.src.path().join(&name), &format!("dst/{name}"))
                .await
                .unwrap();
            let copied = std::fs::read(f.node.path().join("dst").join(&name)).unwrap();
            assert_eq!(copied, data, "size {len}");
        }
        // 0 and 1 byte are small, the rest are chunked
        assert_eq!(f.dispatch.count("batch"), 2);
        assert_eq!(f.dispatch.count("open"), 3);
        assert_eq!(f.dispatch.count("write"), 1 + 2 + 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_copy_sends_no_content() {
        let f = fixture(false);
        let sync = client(&f, 64);
        std::fs::write(f.src.path().join("big.bin"), pattern(200)).unwrap();
        std::fs::write(f.src.path().join("small.txt"), b"tiny").unwrap();
        let pairs = vec![
            (f.src.path().join("big.bin"), "app/big.bin".to_string()),
            (f.src.path().join("small.txt"), "app/small.txt".to_string()),
        ];
        let first = sync.copy_files(pairs.clone()).await.unwrap();
        assert_eq!(first.files_transferred(), 2);

        let writes = f.dispatch.count("write");
        let batches = f.dispatch.count("batch");
        let second = sync.copy_files(pairs).await.unwrap();
        assert_eq!(second.files_skipped, 2);
        assert_eq!(second.bytes_sent, 0);
        assert_eq!(f.dispatch.count("write"), writes);
        assert_eq!(f.dispatch.count("batch"), batches);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn small_files_flush_at_the_budget() {
        let f = fixture(false);
        let sync = client(&f, 64);
        let mut pairs = Vec::new();
        for i in 0..10 {
            let p = f.src.path().join(format!("s{i}.txt"));
            std::fs::write(&p, pattern(20)).unwrap();
            pairs.push((p, format!("small/s{i}.txt")));
        }
        let stats = sync.copy_files(pairs).await.unwrap();
        assert_eq!(stats.files_batched, 10);
        // 20-byte files reach the 64-byte budget every fourth file
        assert_eq!(stats.batches, 3);
        assert_eq!(f.dispatch.count("exists_many"), 1);
        for i in 0..10 {
            assert!(f.node.path().join(format!("small/s{i}.txt")).is_file());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupted_transfer_is_an_integrity_failure() {
        let f = fixture(true);
        let sync = client(&f, 64);
        std::fs::write(f.src.path().join("big.bin"), pattern(150)).unwrap();
        let err = sync
            .copy_file(&f.src.path().join("big.bin"), "big.bin")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::IntegrityMismatch { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn directory_copy_keeps_relative_layout() {
        let f = fixture(false);
        let sync = client(&f, 64);
        std::fs::create_dir_all(f.src.path().join("tree/a/b")).unwrap();
        std::fs::write(f.src.path().join("tree/top.cfg"), b"x=1").unwrap();
        std::fs::write(f.src.path().join("tree/a/b/data.bin"), pattern(100)).unwrap();
        std::fs::create_dir_all(f.node.path().join("site")).unwrap();
        std::fs::write(f.node.path().join("site/keep.txt"), b"stay").unwrap();

        let stats = sync
            .copy_directory(&f.src.path().join("tree"), "site/")
            .await
            .unwrap();
        assert_eq!(stats.files_transferred(), 2);
        assert_eq!(
            std::fs::read(f.node.path().join("site/a/b/data.bin")).unwrap(),
            pattern(100)
        );
        assert!(f.node.path().join("site/top.cfg").is_file());
        assert!(f.node.path().join("site/keep.txt").is_file());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_source_fails_before_any_request() {
        let f = fixture(false);
        let sync = client(&f, 64);
        assert!(sync
            .copy_file(&f.src.path().join("absent.bin"), "x.bin")
            .await
            .is_err());
        assert!(f.dispatch.log.lock().is_empty());
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl Logger for Events {
        fn transfer_done(&self, _node: &str, dst: &str, _bytes: u64) {
            self.0.lock().push(format!("done {dst}"));
        }
        fn skipped(&self, _node: &str, dst: &str) {
            self.0.lock().push(format!("skip {dst}"));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn skipped_small_files_are_not_logged_as_transferred() {
        let f = fixture(false);
        let events = Arc::new(Events::default());
        let sync = SyncClient::new(f.dispatch.clone(), 64, 4, events.clone());
        std::fs::write(f.src.path().join("a.txt"), b"one").unwrap();
        std::fs::write(f.src.path().join("b.txt"), b"two").unwrap();
        sync.copy_file(&f.src.path().join("a.txt"), "app/a.txt")
            .await
            .unwrap();
        events.0.lock().clear();

        let pairs = vec![
            (f.src.path().join("a.txt"), "app/a.txt".to_string()),
            (f.src.path().join("b.txt"), "app/b.txt".to_string()),
        ];
        sync.copy_files(pairs).await.unwrap();
        assert_eq!(
            *events.0.lock(),
            vec!["skip app/a.txt".to_string(), "done app/b.txt".to_string()]
        );
    }
}
