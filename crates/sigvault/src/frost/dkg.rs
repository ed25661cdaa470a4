//! pedersen dkg with feldman commitments
//!
//! each participant i:
//! 1. samples f_i(x) = a_i0 + a_i1·x + ... + a_i(t-1)·x^(t-1)
//! 2. publishes C_i = [a_i0·G, ..., a_i(t-1)·G] and a schnorr proof that it
//!    knows a_i0 (stops rogue-key contributions)
//! 3. sends f_i(j) to every other participant j, sealed in transit
//! 4. checks every f_i(j) it received against C_i, then
//!    s_j = Σ_i f_i(j),  Y_j = s_j·G,  Y = Σ_i C_i0
//!
//! nobody ever holds s = Σ a_i0.

use core::fmt;

use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar, traits::Identity};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{hash_to_scalar, GroupPublicKey, KeyPackage};
use crate::{Error, Result};

const TAG_POK: &[u8] = b"sigvault:dkg:pok";

// ============================================================================
// polynomials
// ============================================================================

/// secret coefficients [a_0, ..., a_(t-1)]
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Polynomial(Vec<Scalar>);

impl Polynomial {
    /// random polynomial of degree threshold - 1 with the given constant term
    pub fn with_constant<R: RngCore + CryptoRng>(
        constant: Scalar,
        threshold: u32,
        rng: &mut R,
    ) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::InvalidInput("threshold must be positive".into()));
        }
        let mut coeffs = Vec::with_capacity(threshold as usize);
        coeffs.push(constant);
        for _ in 1..threshold {
            coeffs.push(Scalar::random(rng));
        }
        Ok(Self(coeffs))
    }

    pub fn random<R: RngCore + CryptoRng>(threshold: u32, rng: &mut R) -> Result<Self> {
        let constant = Scalar::random(rng);
        Self::with_constant(constant, threshold, rng)
    }

    /// horner at x = index
    pub fn evaluate(&self, index: u32) -> Scalar {
        let x = Scalar::from(index);
        self.0
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coeff| acc * x + coeff)
    }

    pub fn commitment(&self) -> Commitment {
        Commitment {
            coefficients: self.0.iter().map(RistrettoPoint::mul_base).collect(),
        }
    }

    fn constant(&self) -> &Scalar {
        &self.0[0]
    }
}

impl fmt::Debug for Polynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Polynomial")
            .field("degree", &(self.0.len() - 1))
            .field("coefficients", &"[REDACTED]")
            .finish()
    }
}

/// feldman commitment [a_0·G, ..., a_(t-1)·G]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commitment {
    coefficients: Vec<RistrettoPoint>,
}

impl Commitment {
    pub fn threshold(&self) -> u32 {
        self.coefficients.len() as u32
    }

    /// C_0 = a_0·G
    pub fn constant_term(&self) -> RistrettoPoint {
        self.coefficients
            .first()
            .copied()
            .unwrap_or_else(RistrettoPoint::identity)
    }

    /// f(j)·G = Σ_k C_k·j^k, horner again
    pub fn evaluate_at(&self, index: u32) -> RistrettoPoint {
        let x = Scalar::from(index);
        self.coefficients
            .iter()
            .rev()
            .fold(RistrettoPoint::identity(), |acc, c| acc * x + c)
    }

    pub fn verify_subshare(&self, index: u32, value: &Scalar) -> bool {
        index != 0 && RistrettoPoint::mul_base(value) == self.evaluate_at(index)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.coefficients
            .iter()
            .flat_map(|c| c.compress().to_bytes())
            .collect()
    }
}

// ============================================================================
// protocol
// ============================================================================

/// schnorr proof of knowledge of a_0
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProofOfKnowledge {
    r: RistrettoPoint,
    mu: Scalar,
}

fn pok_challenge(index: u32, context: &[u8], c0: &RistrettoPoint, r: &RistrettoPoint) -> Scalar {
    hash_to_scalar(
        TAG_POK,
        &[
            &index.to_le_bytes(),
            context,
            c0.compress().as_bytes(),
            r.compress().as_bytes(),
        ],
    )
}

/// public round-1 output of one participant
#[derive(Clone, Debug)]
pub struct Round1Package {
    pub index: u32,
    pub commitment: Commitment,
    pub proof: ProofOfKnowledge,
}

impl Round1Package {
    /// checks the proof and the polynomial degree
    pub fn verify(&self, threshold: u32, context: &[u8]) -> Result<()> {
        if self.commitment.threshold() != threshold {
            return Err(Error::ProtocolViolation(format!(
                "participant {} committed to degree {} polynomial",
                self.index,
                self.commitment.threshold().saturating_sub(1)
            )));
        }
        let c0 = self.commitment.constant_term();
        let c = pok_challenge(self.index, context, &c0, &self.proof.r);
        if RistrettoPoint::mul_base(&self.proof.mu) != self.proof.r + c0 * c {
            return Err(Error::ProtocolViolation(format!(
                "bad proof of knowledge from participant {}",
                self.index
            )));
        }
        Ok(())
    }
}

/// secret state held by a participant between rounds
pub struct Round1Secret {
    index: u32,
    threshold: u32,
    polynomial: Polynomial,
}

impl Round1Secret {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// f_i(j), to be sealed for participant j
    pub fn subshare_for(&self, recipient: u32) -> Result<Scalar> {
        if recipient == 0 {
            return Err(Error::InvalidInput("participant index 0".into()));
        }
        Ok(self.polynomial.evaluate(recipient))
    }
}

impl fmt::Debug for Round1Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Round1Secret")
            .field("index", &self.index)
            .field("threshold", &self.threshold)
            .field("polynomial", &"[REDACTED]")
            .finish()
    }
}

/// round 1: sample a polynomial, commit to it, prove the constant term
pub fn part1<R: RngCore + CryptoRng>(
    index: u32,
    threshold: u32,
    context: &[u8],
    rng: &mut R,
) -> Result<(Round1Secret, Round1Package)> {
    if index == 0 {
        return Err(Error::InvalidInput("participant index 0".into()));
    }
    let polynomial = Polynomial::random(threshold, rng)?;
    let commitment = polynomial.commitment();

    let mut k = Scalar::random(rng);
    let r = RistrettoPoint::mul_base(&k);
    let c = pok_challenge(index, context, &commitment.constant_term(), &r);
    let mu = k + polynomial.constant() * c;
    k.zeroize();

    let package = Round1Package {
        index,
        commitment,
        proof: ProofOfKnowledge { r, mu },
    };
    let secret = Round1Secret {
        index,
        threshold,
        polynomial,
    };
    Ok((secret, package))
}

/// Y = Σ C_i0
pub fn group_key(packages: &[Round1Package]) -> GroupPublicKey {
    GroupPublicKey::from_point(packages.iter().map(|p| p.commitment.constant_term()).sum())
}

/// Y_j implied by the commitments
pub fn expected_public_share(packages: &[Round1Package], index: u32) -> RistrettoPoint {
    packages
        .iter()
        .map(|p| p.commitment.evaluate_at(index))
        .sum()
}

/// round 3: verify received sub-shares and sum them into the final share.
/// `received` holds (sender, f_sender(self)) for every other participant
pub fn part3(
    secret: Round1Secret,
    packages: &[Round1Package],
    received: &[(u32, Scalar)],
) -> Result<KeyPackage> {
    let own = secret.polynomial.evaluate(secret.index);
    let mut share = own;

    for package in packages.iter().filter(|p| p.index != secret.index) {
        let value = received
            .iter()
            .find(|(from, _)| *from == package.index)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                Error::ProtocolViolation(format!("missing sub-share from participant {}", package.index))
            })?;
        if !package.commitment.verify_subshare(secret.index, value) {
            return Err(Error::ProtocolViolation(format!(
                "sub-share from participant {} does not match its commitment",
                package.index
            )));
        }
        share += value;
    }
    if received.len() + 1 != packages.len() {
        return Err(Error::ProtocolViolation("unexpected sub-share count".into()));
    }

    KeyPackage::new(secret.index, secret.threshold, share, group_key(packages))
}
