//! authenticated envelope encryption
//!
//! xchacha20poly1305 with a fresh 24-byte random nonce per seal. the wire
//! form is `nonce(24) || ciphertext || tag(16)`, so parsing needs no length
//! prefix. every failure on open is the same [`Error::DecryptionFailure`].

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::kdf::Subkey;
use crate::{Error, Result};

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const MIN_ENVELOPE_LEN: usize = NONCE_LEN + TAG_LEN;

/// sealed payload, serialized as hex
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Envelope {
    nonce: [u8; NONCE_LEN],
    /// ciphertext with the tag appended
    sealed: Vec<u8>,
}

impl Envelope {
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn len(&self) -> usize {
        NONCE_LEN + self.sealed.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.sealed);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_ENVELOPE_LEN {
            return Err(Error::DecryptionFailure);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        Ok(Self {
            nonce,
            sealed: bytes[NONCE_LEN..].to_vec(),
        })
    }
}

impl core::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Envelope")
            .field("nonce", &hex::encode(self.nonce))
            .field("len", &self.len())
            .finish()
    }
}

impl From<Envelope> for String {
    fn from(envelope: Envelope) -> String {
        hex::encode(envelope.to_bytes())
    }
}

impl TryFrom<String> for Envelope {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::DecryptionFailure)?;
        Envelope::from_bytes(&bytes)
    }
}

/// encrypt under `key`, binding the optional associated data
pub fn seal(plaintext: &[u8], key: &Subkey, aad: Option<&[u8]>) -> Result<Envelope> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let payload = Payload {
        msg: plaintext,
        aad: aad.unwrap_or_default(),
    };
    let sealed = cipher
        .encrypt(&nonce, payload)
        .map_err(|_| Error::InvalidInput("payload too large to seal".into()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&nonce);
    Ok(Envelope {
        nonce: nonce_bytes,
        sealed,
    })
}

/// verify the tag, then release the plaintext
pub fn open(envelope: &Envelope, key: &Subkey, aad: Option<&[u8]>) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.sealed.len() < TAG_LEN {
        return Err(Error::DecryptionFailure);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let payload = Payload {
        msg: &envelope.sealed,
        aad: aad.unwrap_or_default(),
    };
    cipher
        .decrypt(XNonce::from_slice(&envelope.nonce), payload)
        .map(Zeroizing::new)
        .map_err(|_| Error::DecryptionFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_seal_open() {
        let key = Subkey::random();
        let env = seal(b"raw signing key", &key, None).unwrap();
        assert_eq!(env.len(), MIN_ENVELOPE_LEN + 15);
        let plain = open(&env, &key, None).unwrap();
        assert_eq!(plain.as_slice(), b"raw signing key");
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let env = seal(b"secret", &Subkey::random(), None).unwrap();
        assert!(matches!(
            open(&env, &Subkey::random(), None),
            Err(Error::DecryptionFailure)
        ));
    }

    #[test]
    fn test_aad_is_bound() {
        let key = Subkey::random();
        let env = seal(b"secret", &key, Some(b"alice".as_slice())).unwrap();
        assert!(open(&env, &key, Some(b"alice".as_slice())).is_ok());
        assert!(matches!(
            open(&env, &key, Some(b"bob".as_slice())),
            Err(Error::DecryptionFailure)
        ));
        assert!(matches!(open(&env, &key, None), Err(Error::DecryptionFailure)));
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = Subkey::random();
        let nonces: HashSet<[u8; NONCE_LEN]> = (0..1000)
            .map(|_| *seal(b"m", &key, None).unwrap().nonce())
            .collect();
        assert_eq!(nonces.len(), 1000);
    }

    #[test]
    fn test_short_envelope_rejected() {
        assert!(matches!(
            Envelope::from_bytes(&[0u8; MIN_ENVELOPE_LEN - 1]),
            Err(Error::DecryptionFailure)
        ));
    }

    #[test]
    fn test_serde_hex() {
        let key = Subkey::random();
        let env = seal(b"secret", &key, None).unwrap();
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
        assert!(serde_json::from_str::<Envelope>("\"zz\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(msg in proptest::collection::vec(any::<u8>(), 0..512)) {
            let key = Subkey::random();
            let env = seal(&msg, &key, None).unwrap();
            let plain = open(&env, &key, None).unwrap();
            prop_assert_eq!(plain.as_slice(), msg.as_slice());
        }

        #[test]
        fn prop_any_bit_flip_fails(
            msg in proptest::collection::vec(any::<u8>(), 1..128),
            pos in any::<usize>(),
            bit in 0u8..8,
        ) {
            let key = Subkey::random();
            let mut bytes = seal(&msg, &key, None).unwrap().to_bytes();
            let idx = pos % bytes.len();
            bytes[idx] ^= 1 << bit;
            let tampered = Envelope::from_bytes(&bytes).unwrap();
            prop_assert!(matches!(open(&tampered, &key, None), Err(Error::DecryptionFailure)));
        }
    }
}
