//! # Object Addressing & Encryption
//!
//! Two concerns live here because they are entangled: how an object's id is
//! derived from its payload, and how payloads are sealed for the remote
//! repository.
//!
//! ## Addressing
//!
//! Without encryption an object id is the SHA-256 of its plaintext payload.
//! With encryption it is HMAC-SHA-256 keyed by the repository *public* key —
//! a stable, non-secret value — so ids stay deterministic across sessions
//! while remaining unlinkable to anyone who does not hold that value.
//!
//! ## Encryption
//!
//! Objects are sealed to an X25519 public key (libsodium-style sealed boxes),
//! so the backup path needs no secrets at all. The private key is itself
//! wrapped with AES-256-GCM under an Argon2id password-derived key:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┐
//! │  Nonce (12B)  │  Ciphertext + Auth Tag (16B suffix)  │
//! └──────────────┴──────────────────────────────────────┘
//! ```
//!
//! The wrap parameters (salt, Argon2 costs, wrapped key, public key) are
//! stored locally *and* uploaded to the repository as a well-known recovery
//! object, so a lost cache can be recovered with only the password.

use crate::error::{CryptoError, Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Length of an object id in bytes (SHA-256 / HMAC-SHA-256 output).
pub const OBJECT_ID_LEN: usize = 32;

/// Fixed nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Argon2id parameters used when generating new keys. Memory cost is in KiB.
const ARGON2_M_COST: u32 = 64 * 1024;
const ARGON2_T_COST: u32 = 3;
const ARGON2_P_COST: u32 = 1;

/// The binary address of a content-addressed object.
///
/// Derived equality (`==`) is ordinary equality for use in sets and maps;
/// integrity checks must go through [`ObjectId::ct_eq`], which compares in
/// constant time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    pub fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated hex form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Constant-time equality, for integrity checks on downloaded payloads.
    pub fn ct_eq(&self, other: &ObjectId) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl TryFrom<&[u8]> for ObjectId {
    type Error = CryptoError;

    fn try_from(bytes: &[u8]) -> std::result::Result<Self, CryptoError> {
        let arr: [u8; OBJECT_ID_LEN] =
            bytes.try_into().map_err(|_| CryptoError::BadIdLength {
                expected: OBJECT_ID_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

// ─── Encrypter ──────────────────────────────────────────────────────────────

/// Seals outbound payloads and derives object ids.
///
/// The backup path only ever needs this — decryption requires the private
/// key, which callers obtain separately via [`KeyConfig::unlock`].
pub enum Encrypter {
    /// No encryption; ids are plain SHA-256.
    Null,
    /// Sealed-box encryption to the repository public key; ids are keyed MACs.
    SealedBox { public_key: crypto_box::PublicKey },
}

impl Encrypter {
    /// Derives the object id for a plaintext payload.
    pub fn object_id(&self, payload: &[u8]) -> ObjectId {
        match self {
            Encrypter::Null => ObjectId(Sha256::digest(payload).into()),
            Encrypter::SealedBox { public_key } => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(public_key.as_bytes())
                    .expect("HMAC accepts keys of any length");
                mac.update(payload);
                ObjectId(mac.finalize().into_bytes().into())
            }
        }
    }

    /// Encrypts a (possibly compressed) payload for upload.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encrypter::Null => Ok(plaintext.to_vec()),
            Encrypter::SealedBox { public_key } => {
                public_key
                    .seal(&mut OsRng, plaintext)
                    .map_err(|_| CryptoError::Encrypt.into())
            }
        }
    }

    /// Decrypts downloaded bytes. Requires the private key when sealed-box
    /// encryption is in effect.
    pub fn decrypt(&self, data: &[u8], key: Option<&crypto_box::SecretKey>) -> Result<Vec<u8>> {
        match self {
            Encrypter::Null => Ok(data.to_vec()),
            Encrypter::SealedBox { .. } => {
                let key = key.ok_or(Error::KeyRequired)?;
                key.unseal(data).map_err(|_| CryptoError::Decrypt.into())
            }
        }
    }

    /// True if [`Encrypter::decrypt`] needs a key.
    pub fn key_required(&self) -> bool {
        matches!(self, Encrypter::SealedBox { .. })
    }
}

// ─── Key management ─────────────────────────────────────────────────────────

/// Public encryption parameters plus the password-wrapped private key.
///
/// Everything in here is safe to store in plaintext: recovering the private
/// key requires the password. This struct is persisted in the local settings
/// table and uploaded to the repository as the recovery object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// X25519 public key, hex.
    pub public_key: String,
    /// Argon2id salt, hex.
    pub salt: String,
    /// Argon2id memory cost in KiB.
    pub m_cost: u32,
    /// Argon2id iteration count.
    pub t_cost: u32,
    /// Argon2id parallelism.
    pub p_cost: u32,
    /// AES-256-GCM wrapped private key (nonce ‖ ciphertext), hex.
    pub wrapped_key: String,
}

impl KeyConfig {
    /// Generates a fresh key pair, wrapping the private key under the given
    /// password.
    pub fn generate(password: &str) -> Result<Self> {
        Self::generate_with_params(password, ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST)
    }

    /// As [`KeyConfig::generate`] with explicit Argon2id costs. Tests use
    /// minimal costs to stay fast.
    pub fn generate_with_params(
        password: &str,
        m_cost: u32,
        t_cost: u32,
        p_cost: u32,
    ) -> Result<Self> {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);

        let symmetric = derive_symmetric(password, &salt, m_cost, t_cost, p_cost)?;
        let secret = crypto_box::SecretKey::generate(&mut OsRng);

        let cipher =
            Aes256Gcm::new_from_slice(&symmetric).map_err(|_| CryptoError::Encrypt)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, secret.to_bytes().as_slice())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);

        Ok(Self {
            public_key: hex::encode(secret.public_key().as_bytes()),
            salt: hex::encode(salt),
            m_cost,
            t_cost,
            p_cost,
            wrapped_key: hex::encode(wrapped),
        })
    }

    /// Builds the write-side encrypter from the public parameters.
    pub fn encrypter(&self) -> Result<Encrypter> {
        Ok(Encrypter::SealedBox {
            public_key: crypto_box::PublicKey::from(self.public_key_bytes()?),
        })
    }

    /// Recovers the private key by re-deriving the symmetric key from the
    /// password and unwrapping.
    pub fn unlock(&self, password: &str) -> Result<crypto_box::SecretKey> {
        let salt = hex::decode(&self.salt)
            .map_err(|e| CryptoError::InvalidKey(format!("bad salt: {e}")))?;
        let symmetric =
            derive_symmetric(password, &salt, self.m_cost, self.t_cost, self.p_cost)?;

        let wrapped = hex::decode(&self.wrapped_key)
            .map_err(|e| CryptoError::InvalidKey(format!("bad wrapped key: {e}")))?;
        if wrapped.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt.into());
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_LEN);

        let cipher =
            Aes256Gcm::new_from_slice(&symmetric).map_err(|_| CryptoError::Decrypt)?;
        let key_bytes = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)?;

        let arr: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("unwrapped key has wrong length".into()))?;
        Ok(crypto_box::SecretKey::from(arr))
    }

    fn public_key_bytes(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("bad public key: {e}")))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key has wrong length".into()).into())
    }
}

fn derive_symmetric(
    password: &str,
    salt: &[u8],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
) -> Result<[u8; 32]> {
    let params = argon2::Params::new(m_cost, t_cost, p_cost, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut out = [0u8; 32];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(out)
}
