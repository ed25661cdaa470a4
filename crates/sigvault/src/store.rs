//! per-domain share storage
//!
//! shares are persisted wrapped under a random domain-local key that has
//! nothing to do with any user password. callers address a share by an
//! opaque [`ShareId`] and must present the matching [`Capability`], an
//! hmac tag only this domain can mint.
//!
//! a [`ShareLease`] gives one ceremony exclusive use of a share. the raw
//! share is only unwrapped inside [`ShareStore::with_transient`], tracked
//! in the transient map while in use, and zeroized when the last handle to
//! it drops.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use curve25519_dalek::ristretto::RistrettoPoint;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::attest::Attestation;
use crate::ceremony::KeyId;
use crate::envelope::{self, Envelope};
use crate::frost::{decode_scalar, GroupPublicKey, KeyPackage};
use crate::kdf::{mac, Subkey};
use crate::{Error, Result};

const CAPABILITY_TAG: &[u8] = b"sigvault:capability:v1";
const WRAP_TAG: &[u8] = b"sigvault:share-wrap:v1";

opaque_id!(
    /// handle for one stored share
    ShareId
);

/// bearer token for one share, minted by the owning domain
#[derive(Clone, Serialize, Deserialize)]
pub struct Capability(#[serde(with = "crate::hex_serde")] [u8; 32]);

impl Capability {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for Capability {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for Capability {}

impl core::fmt::Debug for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Capability([REDACTED])")
    }
}

/// a share at rest. `encrypted_share` is the only secret part
#[derive(Clone, Debug)]
pub struct KeyShare {
    pub share_id: ShareId,
    pub key_id: KeyId,
    pub participant: u32,
    pub threshold: u32,
    pub encrypted_share: Envelope,
    pub public_key_contribution: RistrettoPoint,
    pub group_key: GroupPublicKey,
    pub attestation: Option<Attestation>,
}

/// what [`ShareStore::wipe`] clears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeTarget {
    Share(ShareId),
    AllTransient,
}

struct Slot {
    share: KeyShare,
    lease: Arc<Mutex<()>>,
}

/// exclusive use of one share for the lifetime of a ceremony
pub struct ShareLease {
    share_id: ShareId,
    _guard: OwnedMutexGuard<()>,
}

impl ShareLease {
    pub fn share_id(&self) -> ShareId {
        self.share_id
    }
}

impl core::fmt::Debug for ShareLease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShareLease").field("share_id", &self.share_id).finish()
    }
}

pub struct ShareStore {
    domain: String,
    wrapping_key: Subkey,
    capability_key: Subkey,
    shares: RwLock<HashMap<ShareId, Slot>>,
    /// unwrapped shares, present only inside `with_transient`
    transient: RwLock<HashMap<ShareId, Arc<KeyPackage>>>,
}

fn wrap_aad(share_id: &ShareId, key_id: &KeyId, participant: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(WRAP_TAG.len() + 36);
    aad.extend_from_slice(WRAP_TAG);
    aad.extend_from_slice(share_id.as_bytes());
    aad.extend_from_slice(key_id.as_bytes());
    aad.extend_from_slice(&participant.to_le_bytes());
    aad
}

impl ShareStore {
    /// fresh store with random domain-local keys
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            wrapping_key: Subkey::random(),
            capability_key: Subkey::random(),
            shares: RwLock::new(HashMap::new()),
            transient: RwLock::new(HashMap::new()),
        }
    }

    fn capability_for(&self, share_id: &ShareId) -> Result<Capability> {
        mac(
            self.capability_key.as_bytes(),
            &[CAPABILITY_TAG, share_id.as_bytes()],
        )
        .map(Capability)
    }

    fn authorize(&self, share_id: &ShareId, capability: &Capability) -> Result<()> {
        let shares = self.shares.read().map_err(|e| Error::Storage(e.to_string()))?;
        if !shares.contains_key(share_id) {
            return Err(Error::NotFound);
        }
        if self.capability_for(share_id)? != *capability {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    /// wrap and persist a share, returning its handle and capability
    pub fn store(
        &self,
        key_id: KeyId,
        package: &KeyPackage,
        attestation: Option<Attestation>,
    ) -> Result<(ShareId, Capability)> {
        let share_id = ShareId::random();
        let aad = wrap_aad(&share_id, &key_id, package.index());
        let encrypted_share = envelope::seal(
            &package.secret_bytes()[..],
            &self.wrapping_key,
            Some(aad.as_slice()),
        )?;

        let share = KeyShare {
            share_id,
            key_id,
            participant: package.index(),
            threshold: package.threshold(),
            encrypted_share,
            public_key_contribution: *package.public_share(),
            group_key: *package.group_key(),
            attestation,
        };
        let mut shares = self.shares.write().map_err(|e| Error::Storage(e.to_string()))?;
        shares.insert(
            share_id,
            Slot {
                share,
                lease: Arc::new(Mutex::new(())),
            },
        );
        debug!(domain = %self.domain, %share_id, %key_id, "share stored");
        Ok((share_id, self.capability_for(&share_id)?))
    }

    /// wrapped share; never the raw scalar
    pub fn retrieve(&self, share_id: &ShareId, capability: &Capability) -> Result<KeyShare> {
        self.authorize(share_id, capability)?;
        let shares = self.shares.read().map_err(|e| Error::Storage(e.to_string()))?;
        shares
            .get(share_id)
            .map(|slot| slot.share.clone())
            .ok_or(Error::NotFound)
    }

    /// take the share for one ceremony. a share already leased is busy
    pub fn lease(&self, share_id: &ShareId, capability: &Capability) -> Result<ShareLease> {
        self.authorize(share_id, capability)?;
        let lock = {
            let shares = self.shares.read().map_err(|e| Error::Storage(e.to_string()))?;
            shares
                .get(share_id)
                .map(|slot| slot.lease.clone())
                .ok_or(Error::NotFound)?
        };
        let guard = lock.try_lock_owned().map_err(|_| Error::ShareBusy)?;
        Ok(ShareLease {
            share_id: *share_id,
            _guard: guard,
        })
    }

    pub fn is_leased(&self, share_id: &ShareId) -> Result<bool> {
        let shares = self.shares.read().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(shares
            .get(share_id)
            .map(|slot| slot.lease.try_lock().is_err())
            .unwrap_or(false))
    }

    fn unwrap_share(&self, share_id: &ShareId) -> Result<KeyPackage> {
        let shares = self.shares.read().map_err(|e| Error::Storage(e.to_string()))?;
        let share = &shares.get(share_id).ok_or(Error::NotFound)?.share;
        let aad = wrap_aad(&share.share_id, &share.key_id, share.participant);
        let raw = envelope::open(&share.encrypted_share, &self.wrapping_key, Some(aad.as_slice()))?;
        let scalar = decode_scalar(&raw).ok_or(Error::DecryptionFailure)?;
        let package = KeyPackage::new(share.participant, share.threshold, scalar, share.group_key)?;
        if *package.public_share() != share.public_key_contribution {
            return Err(Error::DecryptionFailure);
        }
        Ok(package)
    }

    /// unwrap the leased share, hand it to `f`, wipe it
    pub fn with_transient<T>(
        &self,
        lease: &ShareLease,
        f: impl FnOnce(&KeyPackage) -> Result<T>,
    ) -> Result<T> {
        let share_id = lease.share_id;
        let package = Arc::new(self.unwrap_share(&share_id)?);
        self.transient
            .write()
            .map_err(|e| Error::Storage(e.to_string()))?
            .insert(share_id, package.clone());
        // no lock held while `f` runs, other shares stay usable
        let out = f(package.as_ref());
        self.wipe(WipeTarget::Share(share_id))?;
        out
    }

    /// drop unwrapped material. safe to call any number of times
    pub fn wipe(&self, target: WipeTarget) -> Result<usize> {
        let mut transient = self.transient.write().map_err(|e| Error::Storage(e.to_string()))?;
        let wiped = match target {
            WipeTarget::Share(id) => usize::from(transient.remove(&id).is_some()),
            WipeTarget::AllTransient => {
                let n = transient.len();
                transient.clear();
                n
            }
        };
        debug!(domain = %self.domain, ?target, wiped, "wipe");
        Ok(wiped)
    }

    pub fn transient_count(&self) -> Result<usize> {
        let transient = self.transient.read().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(transient.len())
    }

    /// remove the persisted share (rotation, account deletion)
    pub fn destroy(&self, share_id: &ShareId, capability: &Capability) -> Result<()> {
        self.authorize(share_id, capability)?;
        if self.is_leased(share_id)? {
            return Err(Error::ShareBusy);
        }
        self.wipe(WipeTarget::Share(*share_id))?;
        let mut shares = self.shares.write().map_err(|e| Error::Storage(e.to_string()))?;
        shares.remove(share_id);
        debug!(domain = %self.domain, %share_id, "share destroyed");
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let shares = self.shares.read().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(shares.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl core::fmt::Debug for ShareStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShareStore")
            .field("domain", &self.domain)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}
