//! Key material for wgmesh
//!
//! Two kinds of keys live here: the server's Ed25519 signing key, which signs every
//! message pushed to hosts, and the Curve25519 WireGuard keys handed to ext-clients.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{
    Signature, Signer as DalekSigner, SigningKey, Verifier as DalekVerifier, VerifyingKey,
};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use subtle::ConstantTimeEq;
use tokio::fs;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

/// Ed25519 key pair used to sign broker messages
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Load key pair from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read(path).await?;
        let bytes: [u8; 32] = data
            .try_into()
            .map_err(|_| Error::Crypto("Invalid key length".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Save key pair to file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.signing_key.to_bytes()).await?;
        Ok(())
    }

    /// Load the key at `path`, generating and persisting one on first start
    pub async fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if fs::try_exists(path).await? {
            return Self::load(path).await;
        }
        let kp = Self::generate();
        kp.save(path).await?;
        info!("Generated new signing key at {:?}", path);
        Ok(kp)
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Trait for types that can sign data
pub trait Signer {
    fn sign(&self, data: &[u8]) -> Vec<u8>;
}

impl Signer for KeyPair {
    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

/// Trait for types that can verify signatures
pub trait Verifier {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()>;
}

impl Verifier for VerifyingKey {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::Crypto("Invalid signature length".to_string()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        DalekVerifier::verify(self, data, &sig)?;
        Ok(())
    }
}

impl Verifier for KeyPair {
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        Verifier::verify(&self.verifying_key(), data, signature)
    }
}

/// Create a verifying key from its hex encoding
pub fn verifying_key_from_hex(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| Error::Crypto(format!("Invalid public key hex: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("Invalid public key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::Crypto(e.to_string()))
}

/// Wire form of every message published to the broker.
///
/// `body` is the exact JSON text that was signed, so receivers verify before parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedEnvelope {
    pub body: String,
    pub signature: String,
    pub signer: String,
}

impl SignedEnvelope {
    pub fn seal<T: Serialize>(payload: &T, signer: &KeyPair) -> Result<Self> {
        let body = serde_json::to_string(payload)?;
        let signature = STANDARD.encode(signer.sign(body.as_bytes()));
        Ok(Self {
            body,
            signature,
            signer: signer.public_key_hex(),
        })
    }

    /// Verify against a pinned server key and decode the body
    pub fn open<T: serde::de::DeserializeOwned>(&self, server_key: &VerifyingKey) -> Result<T> {
        let signature = STANDARD
            .decode(&self.signature)
            .map_err(|e| Error::Crypto(format!("Invalid signature encoding: {}", e)))?;
        Verifier::verify(server_key, self.body.as_bytes(), &signature)?;
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// WireGuard key pair, base64 encoded as wg(8) expects
#[derive(Debug, Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generate a WireGuard keypair using x25519
pub fn generate_wireguard_keypair() -> WgKeyPair {
    let mut private_key_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut private_key_bytes);

    // Curve25519 clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Derive the WireGuard public key for a base64 private key
pub fn wireguard_public_key(private_key: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .map_err(|e| Error::validation(format!("invalid private key: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::validation("private key must be 32 bytes"))?;
    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

/// Whether `key` decodes to a 32-byte Curve25519 key
pub fn is_valid_wireguard_key(key: &str) -> bool {
    matches!(STANDARD.decode(key.trim()), Ok(bytes) if bytes.len() == 32)
}

/// Random alphanumeric string, safe in URLs and topic names
pub fn random_string(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Compare two secrets without leaking the mismatch position
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// SHA-256 hex digest, used for diffing published payloads and fingerprinting tokens
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
