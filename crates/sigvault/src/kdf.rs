//! password hashing and key separation
//!
//! - argon2id turns (password, salt) into a 32-byte auth hash
//! - hkdf-sha256 expands the auth hash into one subkey per context label
//!
//! the work factor is memory KiB x passes and may never drop below
//! [`MIN_WORK_FACTOR`]. every entry point checks it.

use core::fmt;
use core::str::FromStr;

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// floor for memory_kib * passes
pub const MIN_WORK_FACTOR: u32 = 100_000;

pub const SALT_LEN: usize = 16;
pub const AUTH_HASH_LEN: usize = 32;
pub const SUBKEY_LEN: usize = 32;

const DEFAULT_PASSES: u32 = 3;
const SUBKEY_INFO_PREFIX: &[u8] = b"sigvault:subkey:v1:";
const AUTH_COMMITMENT_TAG: &[u8] = b"sigvault:auth-commitment:v1";

/// argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub passes: u32,
    pub lanes: u32,
}

impl KdfParams {
    /// spread a work factor over 3 passes on one lane
    pub fn from_work_factor(work_factor: u32) -> Result<Self> {
        let params = Self {
            memory_kib: work_factor.div_ceil(DEFAULT_PASSES),
            passes: DEFAULT_PASSES,
            lanes: 1,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn work_factor(&self) -> u64 {
        self.memory_kib as u64 * self.passes as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_factor() < MIN_WORK_FACTOR as u64 {
            return Err(Error::InvalidInput(format!(
                "kdf work factor {} below floor {}",
                self.work_factor(),
                MIN_WORK_FACTOR
            )));
        }
        if self.lanes == 0 || self.passes == 0 {
            return Err(Error::InvalidInput("kdf lanes and passes must be positive".into()));
        }
        if self.memory_kib < 8 * self.lanes {
            return Err(Error::InvalidInput("kdf memory below 8 KiB per lane".into()));
        }
        Ok(())
    }

    fn argon2(&self) -> Result<Argon2<'static>> {
        self.validate()?;
        let params = Params::new(self.memory_kib, self.passes, self.lanes, Some(AUTH_HASH_LEN))
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        // roughly 2^17
        Self {
            memory_kib: 43_691,
            passes: DEFAULT_PASSES,
            lanes: 1,
        }
    }
}

/// purpose a subkey is derived for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextLabel {
    #[default]
    Encryption,
    SigningKeyWrap,
    BackupExport,
}

impl ContextLabel {
    pub const ALL: [ContextLabel; 3] = [
        ContextLabel::Encryption,
        ContextLabel::SigningKeyWrap,
        ContextLabel::BackupExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextLabel::Encryption => "encryption",
            ContextLabel::SigningKeyWrap => "signing-key-wrap",
            ContextLabel::BackupExport => "backup-export",
        }
    }
}

impl fmt::Display for ContextLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ContextLabel::ALL
            .into_iter()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown context label: {}", s)))
    }
}

/// output of password hashing. never persisted directly
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthHash([u8; AUTH_HASH_LEN]);

impl AuthHash {
    pub fn from_bytes(bytes: [u8; AUTH_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_HASH_LEN] {
        &self.0
    }

    /// one-way tag safe to store next to the salt
    pub fn commitment(&self) -> Result<[u8; 32]> {
        mac(&self.0, &[AUTH_COMMITMENT_TAG])
    }

    /// constant-time check against a stored commitment
    pub fn matches_commitment(&self, stored: &[u8; 32]) -> Result<bool> {
        let ours = self.commitment()?;
        Ok(bool::from(ours.ct_eq(stored)))
    }
}

impl PartialEq for AuthHash {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for AuthHash {}

impl fmt::Debug for AuthHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthHash([REDACTED])")
    }
}

/// 32-byte symmetric key for the envelope cipher
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Subkey([u8; SUBKEY_LEN]);

impl Subkey {
    pub fn from_bytes(bytes: [u8; SUBKEY_LEN]) -> Self {
        Self(bytes)
    }

    /// fresh key from the os rng, for domain-local wrapping
    pub fn random() -> Self {
        let mut bytes = [0u8; SUBKEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SUBKEY_LEN] {
        &self.0
    }
}

impl PartialEq for Subkey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for Subkey {}

impl fmt::Debug for Subkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subkey([REDACTED])")
    }
}

/// random per-account salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

fn check_salt(salt: &[u8]) -> Result<()> {
    if salt.len() != SALT_LEN {
        return Err(Error::InvalidInput(format!(
            "salt must be {} bytes, got {}",
            SALT_LEN,
            salt.len()
        )));
    }
    Ok(())
}

/// stretch a password into an auth hash
pub fn hash_password(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<AuthHash> {
    if password.is_empty() {
        return Err(Error::InvalidInput("empty password".into()));
    }
    check_salt(salt)?;
    let argon2 = params.argon2()?;

    let mut out = [0u8; AUTH_HASH_LEN];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| Error::InvalidInput(e.to_string()))?;
    let hash = AuthHash(out);
    out.zeroize();
    Ok(hash)
}

/// recompute and compare in constant time
pub fn verify_password(
    auth_hash: &AuthHash,
    salt: &[u8],
    attempt: &[u8],
    params: &KdfParams,
) -> Result<bool> {
    let candidate = hash_password(attempt, salt, params)?;
    Ok(candidate == *auth_hash)
}

/// hkdf-sha256 with the label mixed into info
pub fn derive_subkey(auth_hash: &AuthHash, salt: &[u8], label: ContextLabel) -> Result<Subkey> {
    check_salt(salt)?;
    let hk = Hkdf::<Sha256>::new(Some(salt), auth_hash.as_bytes());

    let mut info = Vec::with_capacity(SUBKEY_INFO_PREFIX.len() + label.as_str().len());
    info.extend_from_slice(SUBKEY_INFO_PREFIX);
    info.extend_from_slice(label.as_str().as_bytes());

    let mut okm = [0u8; SUBKEY_LEN];
    hk.expand(&info, &mut okm)
        .map_err(|e| Error::InvalidInput(e.to_string()))?;
    let key = Subkey(okm);
    okm.zeroize();
    Ok(key)
}

/// hmac-sha256 over the concatenation of `data`
pub(crate) fn mac(key: &[u8], data: &[&[u8]]) -> Result<[u8; 32]> {
    let mut h = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::InvalidInput(e.to_string()))?;
    for d in data {
        h.update(d);
    }
    Ok(h.finalize().into_bytes().into())
}
