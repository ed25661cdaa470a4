//! sealing scalars to a domain's transport key
//!
//! ephemeral ristretto dh, hkdf-sha256 over (shared || E || P), then the
//! regular envelope cipher. the coordinator relays these blobs without
//! being able to read them.

use core::fmt;

use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{decode_point, decode_scalar};
use crate::envelope::{self, Envelope};
use crate::kdf::Subkey;
use crate::{Error, Result};

const TRANSPORT_INFO: &[u8] = b"sigvault:transport:v1";

/// domain-held transport secret
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TransportSecret(Scalar);

impl TransportSecret {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(Scalar::random(rng))
    }

    pub fn public(&self) -> TransportKey {
        TransportKey(RistrettoPoint::mul_base(&self.0))
    }
}

impl fmt::Debug for TransportSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportSecret([REDACTED])")
    }
}

/// public half, published by each domain
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TransportKey(RistrettoPoint);

impl TransportKey {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_point(bytes)
            .map(Self)
            .ok_or_else(|| Error::InvalidInput("invalid transport key".into()))
    }
}

impl fmt::Debug for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// E || envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedScalar {
    ephemeral: [u8; 32],
    envelope: Envelope,
}

fn transport_key(shared: &RistrettoPoint, ephemeral: &[u8; 32], recipient: &TransportKey) -> Result<Subkey> {
    let mut ikm = Zeroizing::new([0u8; 96]);
    ikm[..32].copy_from_slice(shared.compress().as_bytes());
    ikm[32..64].copy_from_slice(ephemeral);
    ikm[64..].copy_from_slice(&recipient.to_bytes());

    let hk = Hkdf::<Sha256>::new(None, &ikm[..]);
    let mut okm = [0u8; 32];
    hk.expand(TRANSPORT_INFO, &mut okm)
        .map_err(|e| Error::InvalidInput(e.to_string()))?;
    let key = Subkey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// seal `value` so only the holder of `recipient`'s secret can read it
pub fn seal_scalar<R: RngCore + CryptoRng>(
    value: &Scalar,
    recipient: &TransportKey,
    aad: &[u8],
    rng: &mut R,
) -> Result<SealedScalar> {
    let mut e = Scalar::random(rng);
    let ephemeral = RistrettoPoint::mul_base(&e).compress().to_bytes();
    let shared = recipient.0 * e;
    e.zeroize();

    let key = transport_key(&shared, &ephemeral, recipient)?;
    let envelope = envelope::seal(value.as_bytes(), &key, Some(aad))?;
    Ok(SealedScalar {
        ephemeral,
        envelope,
    })
}

pub fn open_scalar(sealed: &SealedScalar, secret: &TransportSecret, aad: &[u8]) -> Result<Scalar> {
    let eph = decode_point(&sealed.ephemeral).ok_or(Error::DecryptionFailure)?;
    let shared = eph * secret.0;
    let key = transport_key(&shared, &sealed.ephemeral, &secret.public())?;
    let plain = envelope::open(&sealed.envelope, &key, Some(aad))?;
    decode_scalar(&plain).ok_or(Error::DecryptionFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_seal_to_recipient() {
        let secret = TransportSecret::generate(&mut OsRng);
        let value = Scalar::random(&mut OsRng);
        let sealed = seal_scalar(&value, &secret.public(), b"c|1|2", &mut OsRng).unwrap();
        assert_eq!(open_scalar(&sealed, &secret, b"c|1|2").unwrap(), value);
    }

    #[test]
    fn test_wrong_recipient_or_context() {
        let alice = TransportSecret::generate(&mut OsRng);
        let eve = TransportSecret::generate(&mut OsRng);
        let value = Scalar::random(&mut OsRng);
        let sealed = seal_scalar(&value, &alice.public(), b"c|1|2", &mut OsRng).unwrap();
        assert!(matches!(
            open_scalar(&sealed, &eve, b"c|1|2"),
            Err(Error::DecryptionFailure)
        ));
        assert!(matches!(
            open_scalar(&sealed, &alice, b"c|1|3"),
            Err(Error::DecryptionFailure)
        ));
    }
}
