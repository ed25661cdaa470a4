//! # sigvault
//!
//! non-custodial signing: the server never holds a usable signing key.
//!
//! two independent subsystems, usable alone or together:
//!
//! ## password vault
//!
//! ```text
//!   password + salt
//!         │ argon2id (work factor ≥ 100k)
//!         ▼
//!    ┌──────────┐  hmac   ┌────────────────┐
//!    │ authHash │───────► │ auth commitment│  (stored)
//!    └────┬─────┘         └────────────────┘
//!         │ hkdf-sha256, one label per purpose
//!    ┌────┴───────────┬──────────────┐
//!    ▼                ▼              ▼
//!  encryption   signing-key-wrap  backup-export
//!                     │
//!                     ▼ xchacha20poly1305
//!               ┌───────────┐
//!               │ envelope  │  (stored)
//!               └───────────┘
//! ```
//!
//! ## threshold signing
//!
//! ```text
//!             ┌─────────────┐
//!             │ coordinator │  sees commitments + partials only
//!             └──────┬──────┘
//!        ┌───────────┼───────────┐
//!        ▼           ▼           ▼
//!    ┌───────┐   ┌───────┐   ┌───────┐
//!    │ hsm 1 │   │ hsm 2 │   │ hsm 3 │   (2-of-3 frost)
//!    │ share │   │ share │   │ share │   shares wrapped under
//!    └───────┘   └───────┘   └───────┘   domain-local keys
//! ```
//!
//! a signing ceremony walks
//! `Idle → SharesRetrieved → Round1Committed → Round2Signed → Aggregated → Wiped`
//! and every exit path wipes whatever the domains unwrapped.
//!
//! ## security properties
//!
//! - password and auth hash are never stored, only salt + commitment
//! - subkeys per purpose are independent (hkdf domain separation)
//! - wrong password and corrupted vault fail with the same message
//! - no domain, and not the coordinator, ever sees the full signing key
//! - round 2 only starts once every round-1 commitment is fixed
//! - nonces are single use, a second round-2 request is a protocol violation

/// 16-byte random identifier, hex on the wire
macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 16]);

        impl $name {
            pub fn random() -> Self {
                use rand::RngCore;
                let mut bytes = [0u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                Self(bytes)
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl core::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                let bytes = hex::decode(s)
                    .map_err(|e| crate::Error::InvalidInput(e.to_string()))?;
                let arr: [u8; 16] = bytes.try_into().map_err(|_| {
                    crate::Error::InvalidInput(format!("{} must be 16 bytes", stringify!($name)))
                })?;
                Ok(Self(arr))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> core::result::Result<S::Ok, S::Error> {
                s.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> core::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

mod hex_serde;

pub mod attest;
pub mod audit;
pub mod ceremony;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod frost;
pub mod kdf;
pub mod store;
pub mod vault;

pub use attest::{
    Attestation, AttestationPolicy, AttestationService, DomainIdentity, Ed25519Attestor,
};
pub use audit::{AuditSink, CeremonyOutcome, CeremonyReport, MemoryAudit, TracingAudit};
pub use ceremony::{CeremonyId, CeremonyKind, CeremonyPhase, KeyId};
pub use config::Config;
pub use coordinator::{
    Coordinator, GroupKey, ImportBundle, ShareRecord, SignedMessage, SigningRequest,
};
pub use domain::Domain;
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use frost::{GroupPublicKey, SecretKey, Signature};
pub use kdf::{AuthHash, ContextLabel, KdfParams, Subkey};
pub use store::{Capability, KeyShare, ShareId, ShareStore};
pub use vault::{BackupBlob, MemoryVaultStore, PasswordVault, VaultStore};

#[cfg(feature = "software")]
pub use domain::software::SoftwareDomain;
