use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::config::config_dir;

fn default_server_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("fleetd-cert.pem"), dir.join("fleetd-key.pem"))
}

/// rustls server config for `fleetd --tls`. Without explicit paths a
/// self-signed certificate is generated once and persisted in the config
/// directory so distributors can pin it.
pub fn load_or_generate_server_config(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<Arc<rustls::ServerConfig>> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => default_server_cert_paths(),
        _ => return Err(anyhow!("--tls-cert requires --tls-key")),
    };

    if !cert_path.exists() || !key_path.exists() {
        let dir = cert_path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).ok();
        let mut names = vec!["fleetd.local".to_string()];
        if let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
            names.push(host);
        }
        let cert = rcgen::generate_simple_self_signed(names).context("generate self-signed cert")?;
        fs::write(&cert_path, cert.serialize_pem().context("serialize cert")?)
            .context("write cert pem")?;
        fs::write(&key_path, cert.serialize_private_key_pem()).context("write key pem")?;
    }

    let mut rd = BufReader::new(fs::File::open(&cert_path).context("open cert")?);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()
        .context("read cert")?;
    let mut rd = BufReader::new(fs::File::open(&key_path).context("open key")?);
    let key = rustls_pemfile::private_key(&mut rd)
        .context("read key")?
        .ok_or_else(|| anyhow!("no private key in {}", key_path.display()))?;

    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(Arc::new(cfg))
}

pub fn known_hosts_path() -> PathBuf {
    config_dir().join("known_hosts")
}

/// `host:port=sha256-fingerprint` pins, one per line
struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    fn load(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Ok(f) = fs::File::open(&self.path) {
            for line in BufReader::new(f).lines().map_while(|l| l.ok()) {
                if line.starts_with('#') {
                    continue;
                }
                if let Some((k, v)) = line.split_once('=') {
                    map.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }
        map
    }

    fn save(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(p) = self.path.parent() {
            fs::create_dir_all(p).context("create known_hosts parent dir")?;
        }
        let temp_path = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&temp_path).context("create temp known_hosts")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = f.metadata()?.permissions();
                perms.set_mode(0o600);
                f.set_permissions(perms)?;
            }
            writeln!(f, "# fleetsync known_hosts")?;
            for (k, v) in map {
                writeln!(f, "{k}={v}")?;
            }
            f.sync_all()?;
        }
        fs::rename(&temp_path, &self.path).context("replace known_hosts")?;
        Ok(())
    }
}

fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Trust on first use: the first certificate seen for a host:port is pinned,
/// any later change is refused
#[derive(Debug)]
struct TofuVerifier {
    hostport: String,
    known_path: PathBuf,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = fingerprint(end_entity);
        let store = KnownHosts {
            path: self.known_path.clone(),
        };
        let mut map = store.load();
        match map.get(&self.hostport) {
            Some(saved) if saved == &fp => Ok(ServerCertVerified::assertion()),
            Some(_) => Err(rustls::Error::General(format!(
                "certificate of {} changed; remove its line from {} to trust the new one",
                self.hostport,
                self.known_path.display()
            ))),
            None => {
                map.insert(self.hostport.clone(), fp);
                if let Err(e) = store.save(&map) {
                    eprintln!("warning: could not record certificate of {}: {e:#}", self.hostport);
                }
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

pub fn build_client_config_tofu(host: &str, port: u16, known_hosts: &Path) -> Arc<rustls::ClientConfig> {
    let verifier = TofuVerifier {
        hostport: format!("{host}:{port}"),
        known_path: known_hosts.to_path_buf(),
    };
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth(),
    )
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .or_else(|_| ServerName::try_from("localhost".to_string()))
        .map_err(|e| anyhow!("invalid server name {host}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn known_hosts_round_trip_skips_comments() {
        let tmp = TempDir::new().unwrap();
        let store = KnownHosts {
            path: tmp.path().join("sub/known_hosts"),
        };
        let mut map = BTreeMap::new();
        map.insert("web01:9032".to_string(), "abcd".to_string());
        store.save(&map).unwrap();
        assert_eq!(store.load(), map);
    }

    #[test]
    fn generated_certificate_is_reused() {
        let tmp = TempDir::new().unwrap();
        let cert = tmp.path().join("c.pem");
        let key = tmp.path().join("k.pem");
        load_or_generate_server_config(Some(cert.clone()), Some(key.clone())).unwrap();
        let first = fs::read(&cert).unwrap();
        load_or_generate_server_config(Some(cert.clone()), Some(key)).unwrap();
        assert_eq!(fs::read(&cert).unwrap(), first);
    }

    #[test]
    fn cert_without_key_is_rejected() {
        assert!(load_or_generate_server_config(Some(PathBuf::from("c.pem")), None).is_err());
    }

    #[test]
    fn server_names() {
        assert!(matches!(server_name_for("10.1.2.3").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("web01.lan").unwrap(), ServerName::DnsName(_)));
    }
}
