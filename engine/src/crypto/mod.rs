//! Cryptographic operations module
//!
//! This module provides the DRM pipeline for provider binaries:
//! - ECDSA P-256 / SHA-256 verification of publisher signatures
//! - AES-256-GCM decryption of provider binaries under the master key
//! - Session-key re-encryption for onward transfer of a decrypted binary
//!
//! # Envelope format
//!
//! Every AES-GCM ciphertext produced or accepted here is laid out as
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//!
//! # Security
//!
//! The master key is touched once per import: the binary is decrypted and,
//! when it has to travel further, immediately re-wrapped under a fresh
//! session key. Key buffers are zeroized on drop.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::Signature;
pub use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use sdk::errors::EngineError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// AES-256 key length in bytes
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce length in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag length in bytes
const TAG_SIZE: usize = 16;

/// Raw `r || s` signature length for P-256
pub const SIGNATURE_SIZE: usize = 64;

/// Environment variable that overrides the configured master key file
pub const MASTER_KEY_ENV: &str = "PROVISIO_MASTER_KEY";

/// Result of sealing a decrypted provider for onward transfer
pub struct SealedTransfer {
    /// Ephemeral key the receiver needs to open `payload`
    pub session_key: Zeroizing<Vec<u8>>,
    /// Provider binary encrypted under `session_key`
    pub payload: Vec<u8>,
}

/// DRM engine
///
/// Holds the 256-bit master key and the publisher's P-256 verifying key.
///
/// # Examples
///
/// ```no_run
/// use provisio_engine::crypto::{generate_signing_key, DrmEngine, VerifyingKey};
///
/// let signing_key = generate_signing_key();
/// let drm = DrmEngine::new(&[7u8; 32], Some(VerifyingKey::from(&signing_key))).unwrap();
///
/// let encrypted = drm.encrypt_with_master_key(b"provider").unwrap();
/// let plain = drm.decrypt_with_master_key(&encrypted).unwrap();
/// assert_eq!(plain.as_slice(), b"provider");
/// ```
pub struct DrmEngine {
    master_key: Zeroizing<[u8; KEY_SIZE]>,
    publisher_key: VerifyingKey,
}

impl DrmEngine {
    /// Create a DRM engine from raw key material
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidKeySize` if the master key is not exactly
    /// 32 bytes, and `EngineError::KeyMaterial` if the publisher key is absent.
    pub fn new(master_key: &[u8], publisher_key: Option<VerifyingKey>) -> Result<Self, EngineError> {
        let master_key = key_array(master_key)?;

        let publisher_key = publisher_key.ok_or_else(|| {
            EngineError::KeyMaterial("publisher public key is required".to_string())
        })?;

        tracing::info!("DRM engine initialized with publisher key");

        Ok(Self {
            master_key,
            publisher_key,
        })
    }

    /// Create a DRM engine from key files
    ///
    /// The master key file holds the key as hex text. When the
    /// `PROVISIO_MASTER_KEY` environment variable is set it is used instead.
    /// The publisher key file holds an SPKI PEM public key.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::KeyMaterial` if either file cannot be read or
    /// decoded, and `EngineError::InvalidKeySize` for a wrong-sized master key.
    pub fn from_key_files(
        master_key_file: &Path,
        publisher_key_file: &Path,
    ) -> Result<Self, EngineError> {
        let master_hex = match std::env::var(MASTER_KEY_ENV) {
            Ok(value) => Zeroizing::new(value),
            Err(_) => Zeroizing::new(fs::read_to_string(master_key_file).map_err(|e| {
                EngineError::KeyMaterial(format!("Failed to read master key file: {}", e))
            })?),
        };
        let master_key = Zeroizing::new(
            hex::decode(master_hex.trim())
                .map_err(|e| EngineError::KeyMaterial(format!("Master key is not hex: {}", e)))?,
        );

        let pem = fs::read_to_string(publisher_key_file).map_err(|e| {
            EngineError::KeyMaterial(format!("Failed to read publisher key file: {}", e))
        })?;
        let publisher_key = verifying_key_from_pem(&pem)?;

        Self::new(&master_key, Some(publisher_key))
    }

    /// The publisher key this engine verifies against
    pub fn publisher_key(&self) -> &VerifyingKey {
        &self.publisher_key
    }

    /// Verify a publisher signature over `data`
    ///
    /// The signature is 64 raw `r || s` bytes, or the base64 text of those
    /// bytes. The SHA-256 digest of `data` is checked against it.
    ///
    /// # Returns
    ///
    /// `Ok(false)` for a well-formed signature that does not match (wrong
    /// key, tampered data).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidSignatureEncoding` if the signature is
    /// not valid base64, does not decode to 64 bytes, or is not a valid
    /// P-256 scalar pair.
    pub fn verify_package_signature(
        &self,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, EngineError> {
        tracing::debug!("Verifying package signature");

        let signature = parse_signature(signature)?;
        let digest = Sha256::digest(data);

        match self.publisher_key.verify_prehash(&digest, &signature) {
            Ok(()) => {
                tracing::info!("Package signature verified successfully");
                Ok(true)
            }
            Err(e) => {
                tracing::error!("Package signature verification failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Decrypt a provider binary with the master key
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DecryptionFailed` if the ciphertext was made
    /// under another key, is truncated, or fails authentication.
    pub fn decrypt_with_master_key(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, EngineError> {
        open(&self.master_key[..], ciphertext)
    }

    /// Encrypt a provider binary with the master key
    ///
    /// Used by packaging tooling; the runtime import path only decrypts.
    pub fn encrypt_with_master_key(&self, plaintext: &[u8]) -> Result<Vec<u8>, EngineError> {
        seal(&self.master_key[..], plaintext)
    }

    /// Decrypt with the master key and re-wrap under a fresh session key
    ///
    /// The plaintext never leaves this function.
    pub fn seal_for_transfer(&self, ciphertext: &[u8]) -> Result<SealedTransfer, EngineError> {
        let plaintext = self.decrypt_with_master_key(ciphertext)?;
        let session_key = generate_session_key();
        let payload = reencrypt_with_session_key(&plaintext, &session_key)?;

        tracing::debug!("Provider re-encrypted under session key");

        Ok(SealedTransfer {
            session_key,
            payload,
        })
    }
}

/// Generate a random 256-bit session key
pub fn generate_session_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt plaintext under a session key
///
/// # Errors
///
/// Returns `EngineError::InvalidKeySize` unless the key is exactly 32 bytes.
pub fn reencrypt_with_session_key(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, EngineError> {
    check_key_size(key)?;
    seal(key, plaintext)
}

/// Decrypt a session-key ciphertext
///
/// # Errors
///
/// Returns `EngineError::InvalidKeySize` unless the key is exactly 32 bytes,
/// and `EngineError::DecryptionFailed` if authentication fails.
pub fn decrypt_with_session_key(
    ciphertext: &[u8],
    key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, EngineError> {
    check_key_size(key)?;
    open(key, ciphertext)
}

/// Generate a new publisher signing key
pub fn generate_signing_key() -> SigningKey {
    SigningKey::random(&mut OsRng)
}

/// Sign `data` the way publishers sign packages
///
/// Returns the base64 text of the raw `r || s` signature.
pub fn sign_package_data(data: &[u8], key: &SigningKey) -> Result<String, EngineError> {
    let digest = Sha256::digest(data);
    let signature: Signature = key
        .sign_prehash(&digest)
        .map_err(|e| EngineError::KeyMaterial(format!("Signing failed: {}", e)))?;

    Ok(BASE64.encode(signature.to_bytes()))
}

/// Generate a random master key as hex text
pub fn generate_master_key_hex() -> Zeroizing<String> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut key[..]);
    Zeroizing::new(hex::encode(&key[..]))
}

/// Decode an SPKI PEM public key
pub fn verifying_key_from_pem(pem: &str) -> Result<VerifyingKey, EngineError> {
    let public = PublicKey::from_public_key_pem(pem)
        .map_err(|e| EngineError::KeyMaterial(format!("Invalid publisher key: {}", e)))?;
    Ok(VerifyingKey::from(public))
}

/// Encode a verifying key as SPKI PEM
pub fn verifying_key_to_pem(key: &VerifyingKey) -> Result<String, EngineError> {
    PublicKey::from(key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| EngineError::KeyMaterial(format!("Failed to encode public key: {}", e)))
}

/// Decode a SEC1 ("EC PRIVATE KEY") PEM signing key
pub fn signing_key_from_pem(pem: &str) -> Result<SigningKey, EngineError> {
    let secret = SecretKey::from_sec1_pem(pem)
        .map_err(|e| EngineError::KeyMaterial(format!("Invalid signing key: {}", e)))?;
    Ok(SigningKey::from(secret))
}

/// Encode a signing key as SEC1 PEM
pub fn signing_key_to_pem(key: &SigningKey) -> Result<Zeroizing<String>, EngineError> {
    SecretKey::from(key)
        .to_sec1_pem(LineEnding::LF)
        .map_err(|e| EngineError::KeyMaterial(format!("Failed to encode signing key: {}", e)))
}

/// Hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of a file, read in chunks
pub fn compute_file_hash(path: &Path) -> Result<String, EngineError> {
    use std::io::Read;

    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Parse a signature given as raw bytes or base64 text
fn parse_signature(signature: &[u8]) -> Result<Signature, EngineError> {
    let raw = if signature.len() == SIGNATURE_SIZE {
        signature.to_vec()
    } else {
        let text = std::str::from_utf8(signature)
            .map_err(|_| EngineError::InvalidSignatureEncoding("not base64 text".to_string()))?;
        BASE64
            .decode(text.trim())
            .map_err(|e| EngineError::InvalidSignatureEncoding(format!("bad base64: {}", e)))?
    };

    if raw.len() != SIGNATURE_SIZE {
        return Err(EngineError::InvalidSignatureEncoding(format!(
            "expected {} bytes, got {}",
            SIGNATURE_SIZE,
            raw.len()
        )));
    }

    Signature::from_slice(&raw)
        .map_err(|e| EngineError::InvalidSignatureEncoding(format!("invalid scalars: {}", e)))
}

fn check_key_size(key: &[u8]) -> Result<(), EngineError> {
    if key.len() != KEY_SIZE {
        return Err(EngineError::InvalidKeySize {
            expected: KEY_SIZE,
            actual: key.len(),
        });
    }
    Ok(())
}

fn key_array(key: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, EngineError> {
    check_key_size(key)?;
    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    out.copy_from_slice(key);
    Ok(out)
}

fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EngineError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EngineError::InvalidKeySize {
        expected: KEY_SIZE,
        actual: key.len(),
    })?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EngineError::KeyMaterial("Encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, EngineError> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(EngineError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EngineError::InvalidKeySize {
        expected: KEY_SIZE,
        actual: key.len(),
    })?;

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| EngineError::DecryptionFailed)
}
