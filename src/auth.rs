//! Challenge-response identity check between distributor and node.
//!
//! The node sends a random nonce; the distributor answers with a PBKDF2
//! token derived from its identity and the nonce; the node recomputes the
//! token for each identity it allows. Anyone who knows an allowed identity
//! can answer, so this is an allowlist, not a secret.

use anyhow::{Context, Result};
use pbkdf2::pbkdf2_hmac;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;

/// Length of the generated nonce
pub const NONCE_LEN: usize = 32;

/// PBKDF2 iteration count
pub const ITERATIONS: u32 = 10_000;

/// Derived token length in bytes
pub const TOKEN_LEN: usize = 32;

fn canonical_identity(identity: &str) -> String {
    identity.trim().to_ascii_lowercase()
}

fn derive_token(identity: &str, nonce: &str) -> String {
    let mut out = [0u8; TOKEN_LEN];
    pbkdf2_hmac::<Sha256>(
        canonical_identity(identity).as_bytes(),
        nonce.as_bytes(),
        ITERATIONS,
        &mut out,
    );
    hex::encode(out)
}

/// Node side: issues challenges and checks answers against allowed identities
#[derive(Debug, Clone, Default)]
pub struct ServerAuthenticator {
    allowed: Vec<String>,
}

impl ServerAuthenticator {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|s| canonical_identity(s.as_ref()))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn create_challenge(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect()
    }

    pub fn authenticate(&self, nonce: &str, token: &str) -> bool {
        let token = token.trim().to_ascii_lowercase();
        self.allowed
            .iter()
            .any(|identity| derive_token(identity, nonce) == token)
    }
}

/// Distributor side: answers challenges with its own identity
#[derive(Debug, Clone)]
pub struct ClientAuthenticator {
    identity: String,
}

impl ClientAuthenticator {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    /// Identity defaults to this machine's host name
    pub fn from_hostname() -> Result<Self> {
        let name = hostname::get().context("read machine host name")?;
        Ok(Self::new(name.to_string_lossy().into_owned()))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn create_response(&self, nonce: &str) -> String {
        derive_token(&self.identity, nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_fresh_and_printable() {
        let server = ServerAuthenticator::new(["build01"]);
        let a = server.create_challenge();
        let b = server.create_challenge();
        assert_eq!(a.len(), NONCE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn response_is_deterministic() {
        let client = ClientAuthenticator::new("build01");
        assert_eq!(client.create_response("abc"), client.create_response("abc"));
        assert_ne!(client.create_response("abc"), client.create_response("abd"));
    }

    #[test]
    fn exact_identity_is_accepted() {
        let server = ServerAuthenticator::new(["web01", "build01"]);
        let client = ClientAuthenticator::new("build01");
        let nonce = server.create_challenge();
        assert!(server.authenticate(&nonce, &client.create_response(&nonce)));
    }

    #[test]
    fn identity_match_ignores_case() {
        let server = ServerAuthenticator::new(["BUILD01"]);
        let client = ClientAuthenticator::new("build01");
        let nonce = server.create_challenge();
        assert!(server.authenticate(&nonce, &client.create_response(&nonce)));
    }

    #[test]
    fn unknown_identity_is_rejected() {
        let server = ServerAuthenticator::new(["web01"]);
        let client = ClientAuthenticator::new("laptop");
        let nonce = server.create_challenge();
        assert!(!server.authenticate(&nonce, &client.create_response(&nonce)));
    }

    #[test]
    fn empty_allowlist_rejects_everyone() {
        let server = ServerAuthenticator::new(Vec::<String>::new());
        let client = ClientAuthenticator::new("anyone");
        let nonce = server.create_challenge();
        assert!(!server.authenticate(&nonce, &client.create_response(&nonce)));
    }

    #[test]
    fn response_for_other_nonce_is_rejected() {
        let server = ServerAuthenticator::new(["web01"]);
        let client = ClientAuthenticator::new("web01");
        let nonce = server.create_challenge();
        let stale = client.create_response("some-other-nonce");
        assert!(!server.authenticate(&nonce, &stale));
    }
}
