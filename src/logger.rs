use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

/// Event sink for the node server and the sync client. Every method is a
/// no-op by default so implementations pick the events they care about.
pub trait Logger: Send + Sync {
    fn listening(&self, _addr: &SocketAddr, _tls: bool) {}
    fn connected(&self, _peer: &SocketAddr) {}
    fn disconnected(&self, _peer: &SocketAddr, _handles_closed: usize) {}
    fn auth_rejected(&self, _peer: &SocketAddr) {}
    fn request(&self, _peer: &SocketAddr, _what: &str) {}
    fn transfer_done(&self, _node: &str, _dst: &str, _bytes: u64) {}
    fn skipped(&self, _node: &str, _dst: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn listening(&self, addr: &SocketAddr, tls: bool) {
        self.line(&format!("LISTEN addr={addr} tls={tls}"));
    }
    fn connected(&self, peer: &SocketAddr) {
        self.line(&format!("CONNECT peer={peer}"));
    }
    fn disconnected(&self, peer: &SocketAddr, handles_closed: usize) {
        self.line(&format!("DISCONNECT peer={peer} handles_closed={handles_closed}"));
    }
    fn auth_rejected(&self, peer: &SocketAddr) {
        self.line(&format!("AUTH_REJECT peer={peer}"));
    }
    fn request(&self, peer: &SocketAddr, what: &str) {
        self.line(&format!("REQUEST peer={peer} {what}"));
    }
    fn transfer_done(&self, node: &str, dst: &str, bytes: u64) {
        self.line(&format!("COPY node={node} dst={dst} bytes={bytes}"));
    }
    fn skipped(&self, node: &str, dst: &str) {
        self.line(&format!("SKIP node={node} dst={dst}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
}

/// Text log when a path is configured, otherwise nothing
pub fn open_logger(path: Option<&Path>) -> Result<std::sync::Arc<dyn Logger>> {
    Ok(match path {
        Some(p) => std::sync::Arc::new(TextLogger::new(p)?),
        None => std::sync::Arc::new(NoopLogger),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn text_logger_appends_timestamped_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs/fleetd.log");
        let logger = TextLogger::new(&path).unwrap();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        logger.connected(&peer);
        logger.transfer_done("web01", "%TEMP%/a.bin", 42);
        drop(logger);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("CONNECT peer=127.0.0.1:4000"));
        assert!(lines[1].ends_with("COPY node=web01 dst=%TEMP%/a.bin bytes=42"));
    }
}
