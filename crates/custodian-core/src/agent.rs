//! Agent identity: RSA PSS-SHA256 signing and verification of evidence
//! content (SHA-256 digest, then MGF1-SHA256 PSS padding with max-length
//! salt, signed over the prehashed digest).

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::pss::{Signature as PssSignature, SigningKey, VerifyingKey};
use rsa::signature::SignatureEncoding;
use rsa::signature::hazmat::{PrehashVerifier, RandomizedPrehashSigner};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::Config;

/// All agent-scoped evidence lives under this top-level directory.
pub const AGENTS_DIR: &str = "agents";

/// Evidence path carrying the map of agent name -> PEM public key used for
/// verification when an agent's own locker doesn't carry its public key.
pub const PUBLIC_KEYS_EVIDENCE_PATH: &str = "raw/auditree/agent_public_keys.json";

/// A named signing identity. Either half of the keypair may be absent:
/// an agent with only a public key can verify but not sign; one with
/// neither can do neither and evidence is handled unsigned.
#[derive(Clone)]
pub struct Agent {
    pub name: String,
    private_key: Option<RsaPrivateKey>,
    public_key: Option<RsaPublicKey>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), private_key: None, public_key: None }
    }

    /// Build an agent from configuration: `agent_name`, `agent_private_key`
    /// (PEM file path), `agent_public_key` (PEM file path, optional — if
    /// absent and a private key is present, the public key is derived).
    pub fn from_config(cfg: &Config) -> Result<Option<Self>> {
        let Some(name) = cfg.agent_name() else {
            return Ok(None);
        };
        let mut agent = Agent::new(name);

        if let Some(path) = cfg.agent_private_key_path() {
            let pem = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read agent private key {path}"))?;
            let key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .with_context(|| format!("failed to parse agent private key {path}"))?;
            agent.public_key = Some(key.to_public_key());
            agent.private_key = Some(key);
        }

        if agent.public_key.is_none() {
            if let Some(path) = cfg.agent_public_key_path() {
                let pem = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read agent public key {path}"))?;
                agent.public_key = Some(
                    RsaPublicKey::from_public_key_pem(&pem)
                        .with_context(|| format!("failed to parse agent public key {path}"))?,
                );
            }
        }

        Ok(Some(agent))
    }

    /// `agents/<name>/<path>`, unless `path` is already agent-prefixed.
    pub fn get_path(&self, path: &str) -> String {
        let first_segment = path.split('/').next().unwrap_or("");
        if first_segment == AGENTS_DIR {
            path.to_string()
        } else {
            format!("{AGENTS_DIR}/{}/{path}", self.name)
        }
    }

    pub fn signable(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn verifiable(&self) -> bool {
        self.public_key.is_some()
    }

    /// Populate the public key from a fetched `agent_public_keys.json`
    /// document, best-effort: any missing or malformed entry leaves the
    /// agent unverifiable rather than erroring the caller.
    pub fn load_public_key_from_json(&mut self, keys_json: &[u8]) {
        let Ok(parsed) = serde_json::from_slice::<Value>(keys_json) else {
            self.public_key = None;
            return;
        };
        let Some(pem) = parsed.get(&self.name).and_then(Value::as_str) else {
            self.public_key = None;
            return;
        };
        self.public_key = RsaPublicKey::from_public_key_pem(pem).ok();
    }

    /// SHA-256 hex digest of `data`, and a base64 RSA-PSS-SHA256 signature
    /// over that digest (the message hash is `SHA-256(data)`, signed
    /// prehashed rather than hashed a second time). Only valid when
    /// [`Agent::signable`] is true.
    pub fn hash_and_sign(&self, data: &[u8]) -> Result<(String, String)> {
        let private_key =
            self.private_key.as_ref().context("agent has no private key loaded; cannot sign")?;
        let digest = Sha256::digest(data);

        let signing_key = SigningKey::<Sha256>::new(private_key.clone());
        let mut rng = rand::thread_rng();
        let signature = signing_key
            .sign_prehash_with_rng(&mut rng, &digest)
            .context("signing evidence digest failed")?;

        Ok((hex::encode(digest), BASE64.encode(signature.to_bytes())))
    }

    /// Verify `signature_b64` (base64) against the SHA-256 digest of `data`.
    /// Returns `false` (never errors) when unverifiable or malformed, matching
    /// the "best-effort verification" posture of evidence signature checks.
    pub fn verify(&self, data: &[u8], signature_b64: &str) -> bool {
        let Some(public_key) = &self.public_key else { return false };
        let Ok(sig_bytes) = BASE64.decode(signature_b64) else { return false };
        let Ok(signature) = PssSignature::try_from(sig_bytes.as_slice()) else { return false };

        let digest = Sha256::digest(data);
        let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
        verifying_key.verify_prehash(&digest, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    use super::*;

    fn keypair_pem() -> (String, String) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = private.to_public_key();
        let private_pem = private.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
        let public_pem = rsa::pkcs8::EncodePublicKey::to_public_key_pem(&public, LineEnding::LF).unwrap();
        (private_pem, public_pem)
    }

    #[test]
    fn get_path_prefixes_with_agent_name() {
        let agent = Agent::new("auditree.local");
        assert_eq!(agent.get_path("raw/x/y.json"), "agents/auditree.local/raw/x/y.json");
    }

    #[test]
    fn get_path_leaves_already_prefixed_paths_alone() {
        let agent = Agent::new("auditree.local");
        assert_eq!(agent.get_path("agents/other/raw/x/y.json"), "agents/other/raw/x/y.json");
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let (private_pem, public_pem) = keypair_pem();
        let mut agent = Agent::new("auditree.local");
        agent.private_key = Some(RsaPrivateKey::from_pkcs8_pem(&private_pem).unwrap());
        agent.public_key = Some(RsaPublicKey::from_public_key_pem(&public_pem).unwrap());

        assert!(agent.signable());
        let (digest, signature) = agent.hash_and_sign(b"hello evidence").unwrap();
        assert_eq!(digest.len(), 64);
        assert!(agent.verify(b"hello evidence", &signature));
        assert!(!agent.verify(b"tampered evidence", &signature));
    }

    #[test]
    fn unsignable_agent_rejects_hash_and_sign() {
        let agent = Agent::new("no-keys");
        assert!(!agent.signable());
        assert!(agent.hash_and_sign(b"data").is_err());
    }

    #[test]
    fn unverifiable_agent_verify_returns_false_not_error() {
        let agent = Agent::new("no-keys");
        assert!(!agent.verify(b"data", "not-a-real-signature"));
    }

    #[test]
    fn load_public_key_from_json_is_best_effort() {
        let mut agent = Agent::new("auditree.local");
        agent.load_public_key_from_json(br#"{"someone.else": "not a key"}"#);
        assert!(!agent.verifiable());
    }
}
