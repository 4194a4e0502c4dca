use anyhow::Result;
use fleetsync::auth::ClientAuthenticator;
use fleetsync::checksum::{digest_of_file, DigestAlgorithm};
use fleetsync::config::{DeployConfig, NodeConfig};
use fleetsync::error::{is_timeout, DeployError};
use fleetsync::logger::{Logger, NoopLogger};
use fleetsync::net_async::client::{ConnectOptions, Connection};
use fleetsync::net_async::server::NodeServer;
use fleetsync::node::Node;
use fleetsync::orchestrator::Orchestrator;
use fleetsync::plan::{run_plan, Plan};
use fleetsync::sync_client::SyncClient;
use fleetsync::tracker::AggregatingTracker;
use fleetsync::wire::{FileCall, ProcessCall, Request, RunSpec};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CHUNK: usize = 64;

#[derive(Default)]
struct Events {
    disconnects: Mutex<Vec<usize>>,
}

impl Logger for Events {
    fn disconnected(&self, _peer: &SocketAddr, handles_closed: usize) {
        self.disconnects.lock().unwrap().push(handles_closed);
    }
}

struct TestNode {
    addr: String,
    root: TempDir,
    events: Arc<Events>,
    client_dir: TempDir,
}

impl TestNode {
    async fn start(allowed: &[&str]) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let cfg = NodeConfig {
            root: Some(root.path().to_path_buf()),
            allowed_identities: allowed.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let events = Arc::new(Events::default());
        let server = Arc::new(NodeServer::new(&cfg, None, events.clone()));
        let listener = server.bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        Ok(Self {
            addr,
            root,
            events,
            client_dir: tempfile::tempdir()?,
        })
    }

    fn options(&self, identity: &str) -> ConnectOptions {
        ConnectOptions {
            auth: ClientAuthenticator::new(identity),
            heartbeat: Duration::from_secs(1),
            tls: false,
            known_hosts: self.client_dir.path().join("known_hosts"),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        Connection::connect(&self.addr, "test-node", &self.options("tester")).await
    }
}

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let data: Vec<u8> = (0..size).map(|i| (i * 7 + 3) as u8).collect();
    f.write_all(&data)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn copies_boundary_sizes_byte_exact() -> Result<()> {
    let node = TestNode::start(&["tester"]).await?;
    let conn = Arc::new(node.connect().await?);
    let client = SyncClient::new(conn.clone(), CHUNK, 4, Arc::new(NoopLogger));
    let src = tempfile::tempdir()?;

    let mut pairs = Vec::new();
    for size in [0usize, 1, CHUNK, CHUNK + 1] {
        let name = format!("f{size}.bin");
        write_file(&src.path().join(&name), size)?;
        pairs.push((src.path().join(&name), format!("out/{name}")));
    }
    let stats = client.copy_files(pairs.clone()).await?;
    assert_eq!(stats.files_transferred(), 4);

    for (source, dest) in &pairs {
        let copied = node.root.path().join(dest);
        assert_eq!(std::fs::read(source)?, std::fs::read(&copied)?, "{dest}");
        assert_eq!(
            digest_of_file(source, DigestAlgorithm::Strong)?,
            digest_of_file(&copied, DigestAlgorithm::Strong)?
        );
    }

    // Unchanged content is not sent again
    let again = client.copy_files(pairs).await?;
    assert_eq!(again.files_skipped, 4);
    assert_eq!(again.bytes_sent, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_identity_is_rejected() -> Result<()> {
    let node = TestNode::start(&["someone-else"]).await?;
    let err = match node.connect().await {
        Ok(_) => panic!("connection should be rejected"),
        Err(e) => e,
    };
    assert!(matches!(
        err.downcast_ref::<DeployError>(),
        Some(DeployError::AuthenticationRejected(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn open_handles_are_closed_on_disconnect() -> Result<()> {
    let node = TestNode::start(&["tester"]).await?;
    let conn = node.connect().await?;
    conn.call(Request::File(FileCall::Open {
        path: "partial.bin".into(),
        size: 128,
    }))
    .await?
    .into_unit()?;
    conn.close();
    drop(conn);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(n) = node.events.disconnects.lock().unwrap().first() {
            assert_eq!(*n, 1);
            break;
        }
        assert!(Instant::now() < deadline, "server never saw the disconnect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_timeout_is_classified() -> Result<()> {
    let node = TestNode::start(&["tester"]).await?;
    let conn = node.connect().await?;
    let started = Instant::now();
    let err = conn
        .call(Request::Process(ProcessCall::Run(RunSpec {
            path: "sleep".into(),
            args: vec!["5".into()],
            timeout: Some(Duration::from_millis(300)),
            capture_output_on_failure: false,
            show_window: false,
        })))
        .await
        .unwrap_err();
    assert!(is_timeout(&err), "{err:#}");
    assert!(started.elapsed() < Duration::from_secs(3));
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kills_running_processes_and_ignores_absent_names() -> Result<()> {
    let node = TestNode::start(&["tester"]).await?;
    let bin_dir = tempfile::tempdir()?;
    // Short enough to survive the kernel's 15 character comm limit
    let name = format!("fsnap{}", std::process::id() % 100_000);
    let exe = bin_dir.path().join(&name);
    std::fs::copy("/bin/sleep", &exe)?;
    let mut child = std::process::Command::new(&exe).arg("30").spawn()?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    if child.try_wait()?.is_some() {
        // Multi-call sleep binaries refuse to run under another name
        return Ok(());
    }

    let conn = node.connect().await?;
    let killed = conn
        .call(Request::Process(ProcessCall::KillAll {
            names: vec![name.clone(), "fleetsync-absent-process".into()],
        }))
        .await?
        .into_count()?;
    assert_eq!(killed, 1);
    let status = child.wait()?;
    assert!(!status.success());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plan_runs_through_the_orchestrator() -> Result<()> {
    let node = TestNode::start(&["tester"]).await?;
    let src = tempfile::tempdir()?;
    write_file(&src.path().join("app.bin"), 300)?;
    std::fs::write(
        src.path().join("plan.toml"),
        r#"
            [[step]]
            action = "create_directory"
            path = "${dir}"

            [[step]]
            action = "copy"
            source = "app.bin"
            destination = "${dir}/app.bin"

            [[step]]
            action = "delete_files"
            pattern = "${dir}/*.tmp"
        "#,
    )?;
    let mut args = BTreeMap::new();
    args.insert("dir".to_string(), "app".to_string());
    let plan = Plan::load(&src.path().join("plan.toml"), &args)?;

    let tracker = Arc::new(AggregatingTracker::new());
    let cfg = DeployConfig {
        chunk_size: CHUNK,
        mdns: false,
        ..Default::default()
    };
    let resolver = Arc::new(fleetsync::discovery::StaticResolver::new(
        &BTreeMap::new(),
        cfg.port,
    ));
    let orchestrator = Orchestrator::new(cfg, tracker.clone(), resolver, Arc::new(NoopLogger))?
        .with_connect_options(node.options("tester"));
    let remote = orchestrator.connect(&node.addr).await?;
    assert!(remote.is_connected());

    let runs = run_plan(&plan, vec![remote as Arc<dyn Node>], None).await;
    assert!(runs[0].result.is_ok(), "{:?}", runs[0].result);
    assert_eq!(
        std::fs::read(node.root.path().join("app/app.bin"))?,
        std::fs::read(src.path().join("app.bin"))?
    );
    tracker.throw_on_any_failure()?;
    // connect + three steps
    assert_eq!(tracker.records().len(), 4);

    orchestrator.dispose();
    assert!(orchestrator.nodes().is_empty());
    Ok(())
}
