//! password vault
//!
//! non-custodial secret storage: the server keeps a record it cannot open.
//!
//! ```text
//! password ──argon2id(salt)──> auth hash ──hmac──> commitment   (stored)
//!                                  │
//!                                  └──hkdf(label)──> subkey ──> envelope (stored)
//! ```
//!
//! the auth hash itself is never stored. a wrong password, a corrupted
//! record and an unknown account all fail with the same error after the
//! same amount of hashing.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::{Config, VaultConfig};
use crate::envelope::{self, Envelope};
use crate::frost::SecretKey;
use crate::kdf::{
    derive_subkey, generate_salt, hash_password, AuthHash, ContextLabel, KdfParams, SALT_LEN,
};
use crate::{Error, Result};

const RECORD_VERSION: u8 = 1;
const AAD_TAG: &[u8] = b"sigvault:vault:v1";
/// a backup may cost at most this multiple of the vault's own work factor
const MAX_BACKUP_COST: u64 = 4;
const DECOY_SALT: [u8; SALT_LEN] = [0u8; SALT_LEN];

/// byte key-value storage for vault records. contents are opaque
pub trait VaultStore: Send + Sync {
    fn put(&self, account: &str, record: &[u8]) -> Result<()>;

    fn get(&self, account: &str) -> Result<Option<Vec<u8>>>;

    /// true if something was removed
    fn delete(&self, account: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryVaultStore {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VaultStore for MemoryVaultStore {
    fn put(&self, account: &str, record: &[u8]) -> Result<()> {
        self.records
            .write()
            .map_err(|e| Error::Storage(e.to_string()))?
            .insert(account.to_owned(), record.to_vec());
        Ok(())
    }

    fn get(&self, account: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records
            .read()
            .map_err(|e| Error::Storage(e.to_string()))?
            .get(account)
            .cloned())
    }

    fn delete(&self, account: &str) -> Result<bool> {
        Ok(self
            .records
            .write()
            .map_err(|e| Error::Storage(e.to_string()))?
            .remove(account)
            .is_some())
    }
}

impl<S: VaultStore + ?Sized> VaultStore for std::sync::Arc<S> {
    fn put(&self, account: &str, record: &[u8]) -> Result<()> {
        (**self).put(account, record)
    }

    fn get(&self, account: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(account)
    }

    fn delete(&self, account: &str) -> Result<bool> {
        (**self).delete(account)
    }
}

/// what gets persisted per account
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultRecord {
    version: u8,
    #[serde(with = "crate::hex_serde")]
    salt: [u8; SALT_LEN],
    kdf: KdfParams,
    #[serde(with = "crate::hex_serde")]
    auth_commitment: [u8; 32],
    envelope: Envelope,
}

/// self-contained export, opened with the password alone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupBlob {
    pub version: u8,
    #[serde(with = "crate::hex_serde")]
    pub salt: [u8; SALT_LEN],
    pub kdf: KdfParams,
    pub envelope: Envelope,
}

fn aad(account: Option<&str>, label: ContextLabel) -> Vec<u8> {
    let account = account.unwrap_or("");
    let mut aad = Vec::with_capacity(AAD_TAG.len() + account.len() + 24);
    aad.extend_from_slice(AAD_TAG);
    aad.extend_from_slice(&(account.len() as u32).to_le_bytes());
    aad.extend_from_slice(account.as_bytes());
    aad.extend_from_slice(label.as_str().as_bytes());
    aad
}

/// fixed window of password hashes per account
#[derive(Debug)]
struct AttemptLimiter {
    max: u32,
    window: Duration,
    attempts: Mutex<HashMap<String, (u32, Instant)>>,
}

impl AttemptLimiter {
    fn new(config: &VaultConfig) -> Self {
        Self {
            max: config.max_hash_attempts,
            window: Duration::from_secs(config.attempt_window_secs),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, account: &str) -> Result<()> {
        let mut attempts = self.attempts.lock().map_err(|e| Error::Storage(e.to_string()))?;
        let now = Instant::now();
        attempts.retain(|_, (_, start)| now.duration_since(*start) < self.window);
        let entry = attempts.entry(account.to_owned()).or_insert((0, now));
        if now.duration_since(entry.1) >= self.window {
            *entry = (0, now);
        }
        if entry.0 >= self.max {
            let retry = self.window.saturating_sub(now.duration_since(entry.1));
            return Err(Error::RateLimited {
                retry_after_secs: retry.as_secs().max(1),
            });
        }
        entry.0 += 1;
        Ok(())
    }

    fn forget(&self, account: &str) -> Result<()> {
        self.attempts
            .lock()
            .map_err(|e| Error::Storage(e.to_string()))?
            .remove(account);
        Ok(())
    }
}

pub struct PasswordVault<S: VaultStore> {
    store: S,
    params: KdfParams,
    limiter: AttemptLimiter,
}

impl<S: VaultStore> PasswordVault<S> {
    pub fn new(store: S, config: &Config) -> Result<Self> {
        config.validate()?;
        Self::with_params(store, config.kdf_params()?, &config.vault)
    }

    pub fn with_params(store: S, params: KdfParams, limits: &VaultConfig) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            store,
            params,
            limiter: AttemptLimiter::new(limits),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn check_account(account: &str) -> Result<()> {
        if account.is_empty() {
            return Err(Error::InvalidInput("empty account id".into()));
        }
        Ok(())
    }

    fn load(&self, account: &str) -> Result<Option<VaultRecord>> {
        let Some(raw) = self.store.get(account)? else {
            return Ok(None);
        };
        let record: VaultRecord =
            serde_json::from_slice(&raw).map_err(|_| Error::DecryptionFailure)?;
        if record.version != RECORD_VERSION {
            return Err(Error::DecryptionFailure);
        }
        Ok(Some(record))
    }

    /// hash, compare against the stored commitment. callers rate limit first
    fn authenticate(
        &self,
        account: &str,
        password: &[u8],
        record: &VaultRecord,
    ) -> Result<AuthHash> {
        let auth_hash = hash_password(password, &record.salt, &record.kdf)?;
        if !auth_hash.matches_commitment(&record.auth_commitment)? {
            warn!(account, "vault authentication failed");
            return Err(Error::AuthenticationFailure);
        }
        Ok(auth_hash)
    }

    fn seal_record(&self, account: &str, password: &[u8], secret: &[u8]) -> Result<VaultRecord> {
        let salt = generate_salt();
        let auth_hash = hash_password(password, &salt, &self.params)?;
        let subkey = derive_subkey(&auth_hash, &salt, ContextLabel::SigningKeyWrap)?;
        let envelope = envelope::seal(
            secret,
            &subkey,
            Some(aad(Some(account), ContextLabel::SigningKeyWrap).as_slice()),
        )?;
        Ok(VaultRecord {
            version: RECORD_VERSION,
            salt,
            kdf: self.params,
            auth_commitment: auth_hash.commitment()?,
            envelope,
        })
    }

    fn persist(&self, account: &str, record: &VaultRecord) -> Result<()> {
        let raw = serde_json::to_vec(record).map_err(|e| Error::Storage(e.to_string()))?;
        self.store.put(account, &raw)
    }

    fn unseal(
        &self,
        account: &str,
        record: &VaultRecord,
        auth_hash: &AuthHash,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let subkey = derive_subkey(auth_hash, &record.salt, ContextLabel::SigningKeyWrap)?;
        envelope::open(
            &record.envelope,
            &subkey,
            Some(aad(Some(account), ContextLabel::SigningKeyWrap).as_slice()),
        )
    }

    pub fn exists(&self, account: &str) -> Result<bool> {
        Ok(self.store.get(account)?.is_some())
    }

    /// seal `secret` for a new account
    pub fn create(&self, account: &str, password: &[u8], secret: &[u8]) -> Result<()> {
        Self::check_account(account)?;
        if secret.is_empty() {
            return Err(Error::InvalidInput("empty secret".into()));
        }
        if self.exists(account)? {
            return Err(Error::InvalidInput("account already has a vault".into()));
        }
        self.limiter.check(account)?;
        let record = self.seal_record(account, password, secret)?;
        self.persist(account, &record)?;
        info!(account, work_factor = self.params.work_factor(), "vault created");
        Ok(())
    }

    pub fn open(&self, account: &str, password: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        Self::check_account(account)?;
        if password.is_empty() {
            return Err(Error::InvalidInput("empty password".into()));
        }
        self.limiter.check(account)?;
        let Some(record) = self.load(account)? else {
            // same work as a real record
            hash_password(password, &DECOY_SALT, &self.params)?;
            debug!(account, "no vault record");
            return Err(Error::AuthenticationFailure);
        };
        let auth_hash = self.authenticate(account, password, &record)?;
        let secret = self.unseal(account, &record, &auth_hash)?;
        debug!(account, "vault opened");
        Ok(secret)
    }

    /// open and interpret the secret as a single signing key
    pub fn open_signing_key(&self, account: &str, password: &[u8]) -> Result<SecretKey> {
        let secret = self.open(account, password)?;
        SecretKey::from_bytes(&secret).map_err(|_| Error::DecryptionFailure)
    }

    /// re-seal under a fresh salt and the new password
    pub fn change_password(&self, account: &str, old: &[u8], new: &[u8]) -> Result<()> {
        if new.is_empty() {
            return Err(Error::InvalidInput("empty password".into()));
        }
        let secret = self.open(account, old)?;
        let record = self.seal_record(account, new, &secret)?;
        self.persist(account, &record)?;
        info!(account, "vault password changed");
        Ok(())
    }

    /// portable copy under the backup-export subkey
    pub fn export_backup(&self, account: &str, password: &[u8]) -> Result<BackupBlob> {
        let secret = self.open(account, password)?;
        let salt = generate_salt();
        let auth_hash = hash_password(password, &salt, &self.params)?;
        let subkey = derive_subkey(&auth_hash, &salt, ContextLabel::BackupExport)?;
        let envelope = envelope::seal(
            &secret,
            &subkey,
            Some(aad(None, ContextLabel::BackupExport).as_slice()),
        )?;
        info!(account, "backup exported");
        Ok(BackupBlob {
            version: RECORD_VERSION,
            salt,
            kdf: self.params,
            envelope,
        })
    }

    /// open a backup; no account or stored state involved. attempts are
    /// limited per blob and its kdf cost is capped against this vault's
    pub fn import_backup(&self, blob: &BackupBlob, password: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if blob.version != RECORD_VERSION {
            return Err(Error::DecryptionFailure);
        }
        let ceiling = self.params.work_factor() * MAX_BACKUP_COST;
        if blob.kdf.work_factor() > ceiling
            || blob.kdf.memory_kib as u64 > self.params.memory_kib as u64 * MAX_BACKUP_COST
        {
            warn!(work_factor = blob.kdf.work_factor(), ceiling, "backup kdf cost refused");
            return Err(Error::InvalidInput("backup kdf cost above ceiling".into()));
        }
        self.limiter.check(&format!("backup:{}", hex::encode(blob.salt)))?;
        let auth_hash = hash_password(password, &blob.salt, &blob.kdf)?;
        let subkey = derive_subkey(&auth_hash, &blob.salt, ContextLabel::BackupExport)?;
        envelope::open(
            &blob.envelope,
            &subkey,
            Some(aad(None, ContextLabel::BackupExport).as_slice()),
        )
    }

    pub fn delete(&self, account: &str) -> Result<bool> {
        Self::check_account(account)?;
        let removed = self.store.delete(account)?;
        self.limiter.forget(account)?;
        if removed {
            info!(account, "vault deleted");
        }
        Ok(removed)
    }
}

impl<S: VaultStore> core::fmt::Debug for PasswordVault<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PasswordVault")
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::MIN_WORK_FACTOR;
    use crate::error::VAULT_FAILURE_MESSAGE;

    fn vault() -> PasswordVault<MemoryVaultStore> {
        let params = KdfParams::from_work_factor(MIN_WORK_FACTOR).unwrap();
        PasswordVault::with_params(MemoryVaultStore::new(), params, &VaultConfig::default()).unwrap()
    }

    #[test]
    fn test_create_open() {
        let v = vault();
        v.create("alice", b"hunter22", b"top secret").unwrap();
        assert_eq!(&v.open("alice", b"hunter22").unwrap()[..], b"top secret");
    }

    #[test]
    fn test_wrong_password_and_corruption_look_alike() {
        let v = vault();
        v.create("alice", b"hunter22", b"top secret").unwrap();
        let wrong = v.open("alice", b"hunter23").unwrap_err();

        let raw = v.store().get("alice").unwrap().unwrap();
        let mut record: VaultRecord = serde_json::from_slice(&raw).unwrap();
        let mut bytes = record.envelope.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        record.envelope = Envelope::from_bytes(&bytes).unwrap();
        v.store()
            .put("alice", &serde_json::to_vec(&record).unwrap())
            .unwrap();
        let corrupt = v.open("alice", b"hunter22").unwrap_err();

        assert_eq!(wrong.to_string(), corrupt.to_string());
        assert_eq!(wrong.client_message(), VAULT_FAILURE_MESSAGE);
        assert_eq!(corrupt.client_message(), VAULT_FAILURE_MESSAGE);
    }

    #[test]
    fn test_record_holds_no_auth_hash() {
        let v = vault();
        v.create("alice", b"hunter22", b"top secret").unwrap();
        let raw = v.store().get("alice").unwrap().unwrap();
        let record: VaultRecord = serde_json::from_slice(&raw).unwrap();
        let auth = hash_password(b"hunter22", &record.salt, &record.kdf).unwrap();
        let json = String::from_utf8(raw).unwrap();
        assert!(!json.contains(&hex::encode(auth.as_bytes())));
        assert!(!json.contains("top secret"));
    }

    #[test]
    fn test_envelope_bound_to_account() {
        let v = vault();
        v.create("alice", b"pw-alice", b"alice secret").unwrap();
        // move alice's record under bob's name
        let raw = v.store().get("alice").unwrap().unwrap();
        v.store().put("bob", &raw).unwrap();
        assert!(v.open("bob", b"pw-alice").is_err());
    }

    #[test]
    fn test_change_password() {
        let v = vault();
        v.create("alice", b"old-pass", b"s3cret").unwrap();
        v.change_password("alice", b"old-pass", b"new-pass").unwrap();
        assert!(v.open("alice", b"old-pass").is_err());
        assert_eq!(&v.open("alice", b"new-pass").unwrap()[..], b"s3cret");
    }

    #[test]
    fn test_backup_round_trip() {
        let v = vault();
        v.create("alice", b"pw", b"s3cret").unwrap();
        let blob = v.export_backup("alice", b"pw").unwrap();
        let json = serde_json::to_string(&blob).unwrap();
        let blob: BackupBlob = serde_json::from_str(&json).unwrap();

        let other = vault();
        assert_eq!(&other.import_backup(&blob, b"pw").unwrap()[..], b"s3cret");
        assert!(other.import_backup(&blob, b"nope").is_err());
    }

    #[test]
    fn test_rate_limited_before_hashing() {
        let params = KdfParams::from_work_factor(MIN_WORK_FACTOR).unwrap();
        let limits = VaultConfig {
            max_hash_attempts: 2,
            attempt_window_secs: 60,
        };
        let v = PasswordVault::with_params(MemoryVaultStore::new(), params, &limits).unwrap();
        v.create("alice", b"pw", b"s").unwrap();
        assert!(matches!(
            v.open("alice", b"bad"),
            Err(Error::AuthenticationFailure)
        ));
        assert!(matches!(
            v.open("alice", b"pw"),
            Err(Error::RateLimited { .. })
        ));
        // other accounts are unaffected
        v.create("bob", b"pw", b"s").unwrap();
    }

    #[test]
    fn test_unknown_account_costs_an_attempt() {
        let params = KdfParams::from_work_factor(MIN_WORK_FACTOR).unwrap();
        let limits = VaultConfig {
            max_hash_attempts: 2,
            attempt_window_secs: 60,
        };
        let v = PasswordVault::with_params(MemoryVaultStore::new(), params, &limits).unwrap();
        for _ in 0..2 {
            assert!(matches!(
                v.open("ghost", b"pw"),
                Err(Error::AuthenticationFailure)
            ));
        }
        assert!(matches!(
            v.open("ghost", b"pw"),
            Err(Error::RateLimited { .. })
        ));
    }

    #[test]
    fn test_backup_cost_capped_and_limited() {
        let params = KdfParams::from_work_factor(MIN_WORK_FACTOR).unwrap();
        let limits = VaultConfig {
            max_hash_attempts: 2,
            attempt_window_secs: 60,
        };
        let source = vault();
        source.create("alice", b"pw", b"s3cret").unwrap();
        let blob = source.export_backup("alice", b"pw").unwrap();

        let v = PasswordVault::with_params(MemoryVaultStore::new(), params, &limits).unwrap();
        let mut greedy = blob.clone();
        greedy.kdf.memory_kib = params.memory_kib * 5;
        assert!(matches!(
            v.import_backup(&greedy, b"pw"),
            Err(Error::InvalidInput(_))
        ));

        for _ in 0..2 {
            assert!(matches!(
                v.import_backup(&blob, b"nope"),
                Err(Error::DecryptionFailure)
            ));
        }
        assert!(matches!(
            v.import_backup(&blob, b"pw"),
            Err(Error::RateLimited { .. })
        ));
    }

    #[test]
    fn test_limiter_forgets_expired_and_deleted() {
        let limiter = AttemptLimiter {
            max: 1,
            window: Duration::ZERO,
            attempts: Mutex::new(HashMap::new()),
        };
        limiter.check("a").unwrap();
        limiter.check("b").unwrap();
        assert_eq!(limiter.attempts.lock().unwrap().len(), 1);

        let v = vault();
        v.create("alice", b"pw", b"s").unwrap();
        assert!(v.limiter.attempts.lock().unwrap().contains_key("alice"));
        v.delete("alice").unwrap();
        assert!(v.limiter.attempts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_input_validation() {
        let v = vault();
        assert!(matches!(v.create("", b"pw", b"s"), Err(Error::InvalidInput(_))));
        assert!(matches!(v.create("a", b"pw", b""), Err(Error::InvalidInput(_))));
        assert!(matches!(v.create("a", b"", b"s"), Err(Error::InvalidInput(_))));
        assert!(matches!(v.open("a", b""), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_signing_key_and_delete() {
        let v = vault();
        let key = SecretKey::generate(&mut rand::rngs::OsRng);
        v.create("alice", b"pw", &key.to_bytes()[..]).unwrap();
        let opened = v.open_signing_key("alice", b"pw").unwrap();
        assert_eq!(opened.public_key(), key.public_key());

        let sig = opened.sign(b"msg", &mut rand::rngs::OsRng);
        key.public_key().verify(b"msg", &sig).unwrap();

        assert!(v.delete("alice").unwrap());
        assert!(!v.delete("alice").unwrap());
        assert!(matches!(
            v.open("alice", b"pw"),
            Err(Error::AuthenticationFailure)
        ));
    }
}
