//! Tokio transport: the `fleetd` session server and the distributor-side
//! `Connection`. Both run over plain TCP or rustls, selected at setup.

use anyhow::{anyhow, bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::DeployError;
use crate::protocol::frame;
use crate::protocol_core::{read_frame, read_frame_timed, write_frame};

fn is_eof(err: &anyhow::Error) -> bool {
    err.chain().any(|c| {
        c.downcast_ref::<std::io::Error>()
            .map(|e| {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                )
            })
            .unwrap_or(false)
    })
}

/// Split `host:port` (or `[v6]:port`)
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("address {addr} has no port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {addr}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("address {addr} has no host");
    }
    Ok((host.to_string(), port))
}

pub mod server {
    use super::*;
    use crate::auth::ServerAuthenticator;
    use crate::config::NodeConfig;
    use crate::error::to_fault;
    use crate::logger::Logger;
    use crate::services::{NodeServices, SharedServices};
    use crate::wire::{decode, encode, RequestEnvelope, ResponseEnvelope};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};
    use tokio_rustls::TlsAcceptor;

    pub struct NodeServer {
        shared: Arc<SharedServices>,
        auth: Arc<ServerAuthenticator>,
        tls: Option<TlsAcceptor>,
        idle: Duration,
        logger: Arc<dyn Logger>,
    }

    impl NodeServer {
        pub fn new(
            cfg: &NodeConfig,
            tls: Option<Arc<rustls::ServerConfig>>,
            logger: Arc<dyn Logger>,
        ) -> Self {
            if cfg.allowed_identities.is_empty() {
                eprintln!("warning: no allowed identities configured; every connection will be rejected");
            }
            Self {
                shared: Arc::new(SharedServices::from_config(cfg, logger.clone())),
                auth: Arc::new(ServerAuthenticator::new(&cfg.allowed_identities)),
                tls: tls.map(TlsAcceptor::from),
                idle: cfg.idle_timeout(),
                logger,
            }
        }

        pub async fn bind(&self, bind: &str) -> Result<TcpListener> {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("bind {}", bind))?;
            let addr = listener.local_addr()?;
            self.logger.listening(&addr, self.tls.is_some());
            Ok(listener)
        }

        /// Accept connections until the listener fails
        pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
            loop {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.clone().handle_connection(stream, peer).await {
                        this.logger.error("session", &format!("{peer}: {e:#}"));
                        eprintln!("session {} ended: {:#}", peer, e);
                    }
                });
            }
        }

        async fn handle_connection(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr) -> Result<()> {
            match &self.tls {
                Some(acceptor) => {
                    let stream = timeout(
                        Duration::from_millis(crate::protocol::timeouts::HANDSHAKE_MS),
                        acceptor.accept(tcp),
                    )
                    .await
                    .map_err(|_| anyhow!("tls handshake timeout"))?
                    .context("tls accept")?;
                    self.session(stream, peer).await
                }
                None => self.session(tcp, peer).await,
            }
        }

        async fn handshake<S>(&self, stream: &mut S, peer: &SocketAddr) -> Result<bool>
        where
            S: AsyncRead + AsyncWrite + Unpin,
        {
            let nonce = self.auth.create_challenge();
            write_frame(stream, frame::CHALLENGE, nonce.as_bytes()).await?;
            let (typ, payload) =
                read_frame_timed(stream, crate::protocol::timeouts::HANDSHAKE_MS).await?;
            if typ != frame::AUTH {
                bail!("expected AUTH frame, got type {}", typ);
            }
            let token = String::from_utf8_lossy(&payload).into_owned();
            let auth = self.auth.clone();
            let ok = tokio::task::spawn_blocking(move || auth.authenticate(&nonce, &token))
                .await
                .context("authentication task")?;
            if !ok {
                self.logger.auth_rejected(peer);
                let _ = write_frame(stream, frame::AUTH_REJECT, &[]).await;
                let _ = stream.shutdown().await;
                return Ok(false);
            }
            write_frame(stream, frame::AUTH_OK, &[]).await?;
            Ok(true)
        }

        async fn session<S>(self: Arc<Self>, mut stream: S, peer: SocketAddr) -> Result<()>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            if !self.handshake(&mut stream, &peer).await? {
                eprintln!("rejected {}: identity not allowed", peer);
                return Ok(());
            }
            self.logger.connected(&peer);

            let services = Arc::new(NodeServices::new(self.shared.clone()));
            let (mut rd, wr) = tokio::io::split(stream);
            let (tx, mut rx) = mpsc::unbounded_channel::<(u8, Vec<u8>)>();
            tokio::spawn(async move {
                let mut wr = wr;
                while let Some((t, payload)) = rx.recv().await {
                    if write_frame(&mut wr, t, &payload).await.is_err() {
                        break;
                    }
                }
                let _ = wr.shutdown().await;
            });

            let result = loop {
                let (typ, payload) = match timeout(self.idle, read_frame(&mut rd)).await {
                    Ok(Ok(f)) => f,
                    Ok(Err(e)) if is_eof(&e) => break Ok(()),
                    Ok(Err(e)) => break Err(e),
                    Err(_) => break Err(anyhow!("peer silent for {:?}", self.idle)),
                };
                match typ {
                    frame::PING => {
                        let _ = tx.send((frame::PONG, Vec::new()));
                    }
                    frame::REQUEST => {
                        let env: RequestEnvelope = match decode(&payload) {
                            Ok(env) => env,
                            Err(e) => break Err(e),
                        };
                        self.logger.request(
                            &peer,
                            &format!("svc={} {}", env.request.service_id(), env.request.describe()),
                        );
                        let tx = tx.clone();
                        let services = services.clone();
                        tokio::spawn(async move {
                            let result = services.handle(env.request).await.map_err(|e| to_fault(&e));
                            match encode(&ResponseEnvelope { id: env.id, result }) {
                                Ok(bytes) => {
                                    let _ = tx.send((frame::RESPONSE, bytes));
                                }
                                Err(e) => eprintln!("encode response {}: {:#}", env.id, e),
                            }
                        });
                    }
                    other => break Err(anyhow!("unexpected frame type {}", other)),
                }
            };

            drop(tx);
            let closed = services.close_all();
            self.logger.disconnected(&peer, closed);
            result
        }
    }
}

pub mod client {
    use super::*;
    use crate::auth::ClientAuthenticator;
    use crate::protocol::timeouts;
    use crate::services::Dispatch;
    use crate::wire::{decode, encode, Request, RequestEnvelope, Response, ResponseEnvelope};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;
    use tokio::time::{timeout, Duration};
    use tokio_rustls::TlsConnector;

    type Reply = oneshot::Sender<Result<Response>>;

    #[derive(Debug, Clone)]
    pub struct ConnectOptions {
        pub auth: ClientAuthenticator,
        pub heartbeat: Duration,
        pub tls: bool,
        pub known_hosts: PathBuf,
    }

    #[derive(Default)]
    struct CallState {
        pending: HashMap<u64, Reply>,
        dead: Option<String>,
    }

    fn lost(node: &str, reason: &str) -> anyhow::Error {
        anyhow::Error::new(DeployError::ConnectionLost {
            node: node.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Marks the connection dead and fails every outstanding call
    fn fail_all(state: &Mutex<CallState>, node: &str, reason: &str) {
        let drained: Vec<Reply> = {
            let mut st = state.lock();
            if st.dead.is_none() {
                st.dead = Some(reason.to_string());
            }
            st.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(lost(node, reason)));
        }
    }

    /// One authenticated session with a node
    pub struct Connection {
        node: String,
        next_id: AtomicU64,
        tx: mpsc::UnboundedSender<(u8, Vec<u8>)>,
        state: Arc<Mutex<CallState>>,
        tasks: Mutex<Vec<JoinHandle<()>>>,
    }

    impl Connection {
        /// Connect to `addr` (`host:port`); `node` names the peer in errors
        pub async fn connect(addr: &str, node: &str, opts: &ConnectOptions) -> Result<Connection> {
            let tcp = timeout(
                Duration::from_millis(timeouts::CONNECT_MS),
                TcpStream::connect(addr),
            )
            .await
            .map_err(|_| anyhow!("connect to {} timed out", addr))?
            .with_context(|| format!("connect to {}", addr))?;
            let _ = tcp.set_nodelay(true);

            if opts.tls {
                let (host, port) = split_host_port(addr)?;
                let cfg = crate::tls::build_client_config_tofu(&host, port, &opts.known_hosts);
                let stream = TlsConnector::from(cfg)
                    .connect(crate::tls::server_name_for(&host)?, tcp)
                    .await
                    .with_context(|| format!("tls handshake with {}", addr))?;
                Self::establish(stream, node, opts).await
            } else {
                Self::establish(tcp, node, opts).await
            }
        }

        /// Authenticate over an already-open stream and start the session tasks
        pub async fn establish<S>(mut stream: S, node: &str, opts: &ConnectOptions) -> Result<Connection>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let (typ, nonce) = read_frame_timed(&mut stream, timeouts::HANDSHAKE_MS)
                .await
                .context("await challenge")?;
            if typ != frame::CHALLENGE {
                return Err(DeployError::Protocol(format!("expected CHALLENGE, got frame type {typ}")).into());
            }
            let nonce = String::from_utf8(nonce)
                .map_err(|_| DeployError::Protocol("challenge is not text".into()))?;
            let auth = opts.auth.clone();
            let token = tokio::task::spawn_blocking(move || auth.create_response(&nonce))
                .await
                .context("derive auth token")?;
            write_frame(&mut stream, frame::AUTH, token.as_bytes()).await?;
            let (typ, _) = read_frame_timed(&mut stream, timeouts::HANDSHAKE_MS)
                .await
                .context("await authentication result")?;
            match typ {
                frame::AUTH_OK => {}
                frame::AUTH_REJECT => {
                    return Err(DeployError::AuthenticationRejected(node.to_string()).into())
                }
                other => {
                    return Err(DeployError::Protocol(format!(
                        "expected AUTH_OK, got frame type {other}"
                    ))
                    .into())
                }
            }
            Ok(Self::start(stream, node, opts.heartbeat))
        }

        fn start<S>(stream: S, node: &str, heartbeat: Duration) -> Connection
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            let (mut rd, mut wr) = tokio::io::split(stream);
            let (tx, mut rx) = mpsc::unbounded_channel::<(u8, Vec<u8>)>();
            let state = Arc::new(Mutex::new(CallState::default()));
            let dead_after = heartbeat * timeouts::DEAD_AFTER_BEATS;

            let writer = {
                let state = state.clone();
                let node = node.to_string();
                tokio::spawn(async move {
                    while let Some((t, payload)) = rx.recv().await {
                        if let Err(e) = write_frame(&mut wr, t, &payload).await {
                            fail_all(&state, &node, &format!("write failed: {e:#}"));
                            break;
                        }
                    }
                })
            };

            let reader = {
                let state = state.clone();
                let node = node.to_string();
                tokio::spawn(async move {
                    let reason = loop {
                        match timeout(dead_after, read_frame(&mut rd)).await {
                            Ok(Ok((frame::RESPONSE, payload))) => {
                                let env: ResponseEnvelope = match decode(&payload) {
                                    Ok(env) => env,
                                    Err(e) => break format!("{e:#}"),
                                };
                                let reply = state.lock().pending.remove(&env.id);
                                if let Some(reply) = reply {
                                    let result =
                                        env.result.map_err(|f| anyhow::Error::new(DeployError::Remote(f)));
                                    let _ = reply.send(result);
                                }
                            }
                            Ok(Ok((frame::PONG, _))) => {}
                            Ok(Ok((other, _))) => break format!("unexpected frame type {other}"),
                            Ok(Err(e)) if is_eof(&e) => break "closed by peer".to_string(),
                            Ok(Err(e)) => break format!("{e:#}"),
                            Err(_) => break format!("no heartbeat for {dead_after:?}"),
                        }
                    };
                    fail_all(&state, &node, &reason);
                })
            };

            let beats = {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(heartbeat);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if tx.send((frame::PING, Vec::new())).is_err() {
                            break;
                        }
                    }
                })
            };

            Connection {
                node: node.to_string(),
                next_id: AtomicU64::new(1),
                tx,
                state,
                tasks: Mutex::new(vec![writer, reader, beats]),
            }
        }

        pub fn node(&self) -> &str {
            &self.node
        }

        pub fn is_alive(&self) -> bool {
            self.state.lock().dead.is_none()
        }

        /// Issue one request and await its response. Calls from several
        /// tasks are pipelined over the one connection.
        pub async fn call(&self, request: Request) -> Result<Response> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let bytes = encode(&RequestEnvelope { id, request })?;
            let (reply, rx) = oneshot::channel();
            {
                let mut st = self.state.lock();
                if let Some(reason) = &st.dead {
                    return Err(lost(&self.node, reason));
                }
                st.pending.insert(id, reply);
            }
            if self.tx.send((frame::REQUEST, bytes)).is_err() {
                self.state.lock().pending.remove(&id);
                return Err(lost(&self.node, "writer stopped"));
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(lost(&self.node, "connection closed")),
            }
        }

        /// Stop the session tasks; the socket closes once they are gone
        pub fn close(&self) {
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            fail_all(&self.state, &self.node, "connection closed");
        }
    }

    impl Drop for Connection {
        fn drop(&mut self) {
            self.close();
        }
    }

    #[async_trait]
    impl Dispatch for Connection {
        async fn call(&self, request: Request) -> Result<Response> {
            Connection::call(self, request).await
        }

        fn peer(&self) -> &str {
            &self.node
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert_eq!(split_host_port("web01:9032").unwrap(), ("web01".to_string(), 9032));
        assert_eq!(split_host_port("[::1]:9032").unwrap(), ("::1".to_string(), 9032));
        assert!(split_host_port("web01").is_err());
        assert!(split_host_port(":9032").is_err());
        assert!(split_host_port("web01:notaport").is_err());
    }
}
