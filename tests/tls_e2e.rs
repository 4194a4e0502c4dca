use anyhow::Result;
use fleetsync::auth::ClientAuthenticator;
use fleetsync::config::NodeConfig;
use fleetsync::logger::NoopLogger;
use fleetsync::net_async::client::{ConnectOptions, Connection};
use fleetsync::net_async::server::NodeServer;
use fleetsync::sync_client::SyncClient;
use fleetsync::tls;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_copy_pins_the_node_certificate() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let srv_conf = tempfile::tempdir()?;
    let cli_tmp = tempfile::tempdir()?;

    let tls_config = tls::load_or_generate_server_config(
        Some(srv_conf.path().join("cert.pem")),
        Some(srv_conf.path().join("key.pem")),
    )?;
    let cfg = NodeConfig {
        root: Some(srv_root.path().to_path_buf()),
        allowed_identities: vec!["tester".into()],
        ..Default::default()
    };
    let server = Arc::new(NodeServer::new(&cfg, Some(tls_config), Arc::new(NoopLogger)));
    let listener = server.bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let known_hosts = cli_tmp.path().join("known_hosts");
    let opts = ConnectOptions {
        auth: ClientAuthenticator::new("tester"),
        heartbeat: Duration::from_secs(1),
        tls: true,
        known_hosts: known_hosts.clone(),
    };

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let src = cli_tmp.path().join("big.bin");
    std::fs::write(&src, &payload)?;

    let conn = Arc::new(Connection::connect(&addr, "tls-node", &opts).await?);
    let client = SyncClient::new(conn.clone(), 64 * 1024, 4, Arc::new(NoopLogger));
    client.copy_file(&src, "dest/big.bin").await?;
    assert_eq!(std::fs::read(srv_root.path().join("dest/big.bin"))?, payload);
    conn.close();

    // First use recorded the fingerprint; the same certificate is accepted again
    let pinned = std::fs::read_to_string(&known_hosts)?;
    assert!(pinned.contains("127.0.0.1"), "{pinned}");
    let again = Connection::connect(&addr, "tls-node", &opts).await?;
    assert!(again.is_alive());
    Ok(())
}
