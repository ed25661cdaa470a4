//! trusted-dealer split of an existing key
//!
//! the account holder opens a vault-held key locally and splits it with
//! shamir + feldman. the commitment lets anyone check every share without
//! seeing it, so the coordinator can verify an import blind.

use core::fmt;

use curve25519_dalek::scalar::Scalar;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::dkg::{Commitment, Polynomial};
use super::{compute_lagrange_coefficients, SecretKey};
use crate::{Error, Result};

/// f(index) for one participant
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretShare {
    index: u32,
    value: Scalar,
}

impl SecretShare {
    pub fn new(index: u32, value: Scalar) -> Self {
        Self { index, value }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn value(&self) -> &Scalar {
        &self.value
    }
}

impl fmt::Debug for SecretShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretShare")
            .field("index", &self.index)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug)]
pub struct DealerOutput {
    pub commitment: Commitment,
    pub shares: Vec<SecretShare>,
}

/// split `key` into `participants` shares, any `threshold` of which sign
pub fn split<R: RngCore + CryptoRng>(
    key: &SecretKey,
    threshold: u32,
    participants: u32,
    rng: &mut R,
) -> Result<DealerOutput> {
    if threshold == 0 || threshold > participants {
        return Err(Error::InvalidInput(format!(
            "cannot split {}-of-{}",
            threshold, participants
        )));
    }
    let polynomial = Polynomial::with_constant(*key.scalar(), threshold, rng)?;
    let shares = (1..=participants)
        .map(|i| SecretShare::new(i, polynomial.evaluate(i)))
        .collect();
    Ok(DealerOutput {
        commitment: polynomial.commitment(),
        shares,
    })
}

/// interpolate the secret back. only for recovery tooling and tests; a
/// signing ceremony never calls this
pub fn reconstruct(shares: &[SecretShare]) -> Result<SecretKey> {
    let indices: Vec<u32> = shares.iter().map(|s| s.index).collect();
    let lambdas = compute_lagrange_coefficients(&indices)?;
    let mut secret: Scalar = shares
        .iter()
        .zip(lambdas)
        .map(|(s, l)| s.value * l)
        .sum();
    let key = SecretKey::from_bytes(secret.as_bytes());
    secret.zeroize();
    key
}
