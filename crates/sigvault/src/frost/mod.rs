//! two-round threshold schnorr (frost) over ristretto255 / sha-512
//!
//! # signing
//!
//! ```text
//! round 1   each signer i draws nonces (d_i, e_i), publishes (D_i, E_i)
//! package   coordinator fixes {(i, D_i, E_i)} and the message
//! round 2   ρ_i = H(Y || H(m) || H(commitments) || i)
//!           R   = Σ D_i + ρ_i E_i
//!           c   = H(R || Y || m)
//!           z_i = d_i + ρ_i e_i + λ_i s_i c
//! aggregate z   = Σ z_i,  σ = (R, z),  check z·G == R + c·Y
//! ```
//!
//! binding factors commit every signer to the full commitment list, so a
//! signer that sees the others' commitments first gains nothing.
//!
//! a plain [`SecretKey`] signs with the same challenge and encoding, so
//! vault-held keys and threshold keys verify through one
//! [`GroupPublicKey::verify`].

pub mod dealer;
pub mod dkg;
mod lagrange;
pub mod sealed;

use core::fmt;

use curve25519_dalek::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
    traits::{Identity, IsIdentity},
};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{Error, Result};

pub use lagrange::{compute_lagrange_coefficients, lagrange_coefficient};

const TAG_NONCE: &[u8] = b"sigvault:frost:nonce";
const TAG_RHO: &[u8] = b"sigvault:frost:rho";
const TAG_MSG: &[u8] = b"sigvault:frost:msg";
const TAG_COM: &[u8] = b"sigvault:frost:com";
const TAG_CHALLENGE: &[u8] = b"sigvault:frost:challenge";

pub const SIGNATURE_LEN: usize = 64;

/// H(tag || parts...) reduced wide into a scalar
pub(crate) fn hash_to_scalar(tag: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut h = Sha512::new();
    h.update(tag);
    for p in parts {
        h.update(p);
    }
    let out: [u8; 64] = h.finalize().into();
    Scalar::from_bytes_mod_order_wide(&out)
}

fn hash_bytes(tag: &[u8], data: &[u8]) -> [u8; 64] {
    let mut h = Sha512::new();
    h.update(tag);
    h.update(data);
    h.finalize().into()
}

pub(crate) fn decode_point(bytes: &[u8]) -> Option<RistrettoPoint> {
    CompressedRistretto::from_slice(bytes).ok()?.decompress()
}

pub(crate) fn decode_scalar(bytes: &[u8]) -> Option<Scalar> {
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Option::from(Scalar::from_canonical_bytes(arr))
}

fn challenge(r: &RistrettoPoint, y: &RistrettoPoint, message: &[u8]) -> Scalar {
    hash_to_scalar(
        TAG_CHALLENGE,
        &[r.compress().as_bytes(), y.compress().as_bytes(), message],
    )
}

/// hedged nonce: fresh randomness mixed with the secret it protects
fn hedged_nonce<R: RngCore + CryptoRng>(secret: &Scalar, rng: &mut R) -> Scalar {
    let mut random = Zeroizing::new([0u8; 32]);
    rng.fill_bytes(&mut random[..]);
    hash_to_scalar(TAG_NONCE, &[&random[..], secret.as_bytes()])
}

// ============================================================================
// keys and signatures
// ============================================================================

/// Y = s·G for the whole group (or a single vault key)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GroupPublicKey(RistrettoPoint);

impl GroupPublicKey {
    pub fn from_point(point: RistrettoPoint) -> Self {
        Self(point)
    }

    pub fn point(&self) -> &RistrettoPoint {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_point(bytes)
            .filter(|p| !p.is_identity())
            .map(Self)
            .ok_or_else(|| Error::InvalidInput("invalid group public key".into()))
    }

    /// z·G == R + c·Y
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let c = challenge(&signature.r, &self.0, message);
        let lhs = RistrettoPoint::mul_base(&signature.z);
        let rhs = signature.r + self.0 * c;
        if lhs == rhs {
            Ok(())
        } else {
            Err(Error::ProtocolViolation("signature does not verify".into()))
        }
    }
}

impl fmt::Debug for GroupPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupPublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl Serialize for GroupPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> core::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for GroupPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        GroupPublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// schnorr signature σ = (R, z)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    r: RistrettoPoint,
    z: Scalar,
}

impl Signature {
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        out[..32].copy_from_slice(self.r.compress().as_bytes());
        out[32..].copy_from_slice(self.z.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(Error::InvalidInput("signature must be 64 bytes".into()));
        }
        let r = decode_point(&bytes[..32])
            .ok_or_else(|| Error::InvalidInput("invalid signature point".into()))?;
        let z = decode_scalar(&bytes[32..])
            .ok_or_else(|| Error::InvalidInput("non-canonical signature scalar".into()))?;
        Ok(Self { r, z })
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.to_bytes()))
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> core::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Signature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// single signing key, used when a vault signs without a threshold split
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Scalar);

impl SecretKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(Scalar::random(rng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_scalar(bytes)
            .filter(|s| *s != Scalar::ZERO)
            .map(Self)
            .ok_or_else(|| Error::InvalidInput("invalid secret key encoding".into()))
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes())
    }

    pub fn public_key(&self) -> GroupPublicKey {
        GroupPublicKey(RistrettoPoint::mul_base(&self.0))
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.0
    }

    pub fn sign<R: RngCore + CryptoRng>(&self, message: &[u8], rng: &mut R) -> Signature {
        let mut k = hedged_nonce(&self.0, rng);
        let r = RistrettoPoint::mul_base(&k);
        let c = challenge(&r, &RistrettoPoint::mul_base(&self.0), message);
        let z = k + c * self.0;
        k.zeroize();
        Signature { r, z }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// one participant's unwrapped share. lives only inside its domain
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyPackage {
    index: u32,
    threshold: u32,
    secret_share: Scalar,
    #[zeroize(skip)]
    public_share: RistrettoPoint,
    #[zeroize(skip)]
    group_key: GroupPublicKey,
}

impl KeyPackage {
    pub fn new(
        index: u32,
        threshold: u32,
        secret_share: Scalar,
        group_key: GroupPublicKey,
    ) -> Result<Self> {
        if index == 0 || threshold == 0 {
            return Err(Error::InvalidInput("index and threshold must be positive".into()));
        }
        Ok(Self {
            index,
            threshold,
            secret_share,
            public_share: RistrettoPoint::mul_base(&secret_share),
            group_key,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn public_share(&self) -> &RistrettoPoint {
        &self.public_share
    }

    pub fn group_key(&self) -> &GroupPublicKey {
        &self.group_key
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret_share.to_bytes())
    }

    /// round 1: draw a fresh nonce pair for this ceremony
    pub fn commit<R: RngCore + CryptoRng>(&self, rng: &mut R) -> SigningNonces {
        let hiding = hedged_nonce(&self.secret_share, rng);
        let binding = hedged_nonce(&self.secret_share, rng);
        SigningNonces {
            index: self.index,
            hiding,
            binding,
        }
    }

    /// round 2: consumes the nonces so they cannot sign twice
    pub fn sign(&self, package: &SigningPackage, nonces: SigningNonces) -> Result<SignatureShare> {
        if nonces.index != self.index {
            return Err(Error::ProtocolViolation("nonces belong to another participant".into()));
        }
        let ours = package.commitment(self.index).ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "participant {} missing from signing package",
                self.index
            ))
        })?;
        if *ours != nonces.commitments() {
            return Err(Error::ProtocolViolation(format!(
                "commitment for participant {} was altered",
                self.index
            )));
        }

        let lambda = lagrange_coefficient(self.index, &package.signers())?;
        let rho = package.binding_factor(self.index, &self.group_key);
        let r = package.group_commitment(&self.group_key);
        let c = challenge(&r, self.group_key.point(), package.message());

        let z = nonces.hiding + nonces.binding * rho + lambda * self.secret_share * c;
        Ok(SignatureShare {
            index: self.index,
            z,
        })
    }
}

impl fmt::Debug for KeyPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPackage")
            .field("index", &self.index)
            .field("threshold", &self.threshold)
            .field("secret_share", &"[REDACTED]")
            .field("group_key", &self.group_key)
            .finish()
    }
}

// ============================================================================
// rounds
// ============================================================================

/// secret round-1 nonces (d_i, e_i)
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningNonces {
    index: u32,
    hiding: Scalar,
    binding: Scalar,
}

impl SigningNonces {
    pub fn commitments(&self) -> SigningCommitments {
        SigningCommitments {
            index: self.index,
            hiding: RistrettoPoint::mul_base(&self.hiding),
            binding: RistrettoPoint::mul_base(&self.binding),
        }
    }
}

impl fmt::Debug for SigningNonces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningNonces")
            .field("index", &self.index)
            .field("nonces", &"[REDACTED]")
            .finish()
    }
}

/// public round-1 commitments (D_i, E_i)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigningCommitments {
    pub index: u32,
    pub hiding: RistrettoPoint,
    pub binding: RistrettoPoint,
}

/// message plus the fixed commitment set for one ceremony
#[derive(Clone, Debug)]
pub struct SigningPackage {
    message: Vec<u8>,
    /// sorted by index
    commitments: Vec<SigningCommitments>,
}

impl SigningPackage {
    /// rejects duplicate signers, reused nonces and identity commitments
    pub fn new(message: Vec<u8>, mut commitments: Vec<SigningCommitments>) -> Result<Self> {
        if commitments.is_empty() {
            return Err(Error::InvalidInput("no commitments".into()));
        }
        commitments.sort_by_key(|c| c.index);
        for w in commitments.windows(2) {
            if w[0].index == w[1].index {
                return Err(Error::ProtocolViolation(format!(
                    "duplicate commitment from participant {}",
                    w[0].index
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for c in &commitments {
            if c.index == 0 || c.hiding.is_identity() || c.binding.is_identity() {
                return Err(Error::ProtocolViolation(format!(
                    "malformed commitment from participant {}",
                    c.index
                )));
            }
            for p in [c.hiding, c.binding] {
                if !seen.insert(p.compress().to_bytes()) {
                    return Err(Error::ProtocolViolation(format!(
                        "duplicate nonce from participant {}",
                        c.index
                    )));
                }
            }
        }
        Ok(Self {
            message,
            commitments,
        })
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn signers(&self) -> Vec<u32> {
        self.commitments.iter().map(|c| c.index).collect()
    }

    pub fn commitment(&self, index: u32) -> Option<&SigningCommitments> {
        self.commitments.iter().find(|c| c.index == index)
    }

    pub fn commitments(&self) -> &[SigningCommitments] {
        &self.commitments
    }

    fn encoded_commitments(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.commitments.len() * 68);
        for c in &self.commitments {
            buf.extend_from_slice(&c.index.to_le_bytes());
            buf.extend_from_slice(c.hiding.compress().as_bytes());
            buf.extend_from_slice(c.binding.compress().as_bytes());
        }
        buf
    }

    /// ρ_i
    pub fn binding_factor(&self, index: u32, group_key: &GroupPublicKey) -> Scalar {
        let msg_hash = hash_bytes(TAG_MSG, &self.message);
        let com_hash = hash_bytes(TAG_COM, &self.encoded_commitments());
        hash_to_scalar(
            TAG_RHO,
            &[
                &group_key.to_bytes(),
                &msg_hash,
                &com_hash,
                &index.to_le_bytes(),
            ],
        )
    }

    /// R = Σ D_i + ρ_i E_i
    pub fn group_commitment(&self, group_key: &GroupPublicKey) -> RistrettoPoint {
        self.commitments
            .iter()
            .fold(RistrettoPoint::identity(), |acc, c| {
                acc + c.hiding + c.binding * self.binding_factor(c.index, group_key)
            })
    }
}

/// z_i from one signer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignatureShare {
    pub index: u32,
    pub z: Scalar,
}

/// z_i·G == D_i + ρ_i E_i + c λ_i Y_i
pub fn verify_share(
    share: &SignatureShare,
    public_share: &RistrettoPoint,
    package: &SigningPackage,
    group_key: &GroupPublicKey,
) -> Result<()> {
    let com = package.commitment(share.index).ok_or_else(|| {
        Error::ProtocolViolation(format!("share from non-signer {}", share.index))
    })?;
    let lambda = lagrange_coefficient(share.index, &package.signers())?;
    let rho = package.binding_factor(share.index, group_key);
    let r = package.group_commitment(group_key);
    let c = challenge(&r, group_key.point(), package.message());

    let lhs = RistrettoPoint::mul_base(&share.z);
    let rhs = com.hiding + com.binding * rho + public_share * (c * lambda);
    if lhs == rhs {
        Ok(())
    } else {
        Err(Error::ProtocolViolation(format!(
            "invalid signature share from participant {}",
            share.index
        )))
    }
}

/// combine verified shares. needs exactly the package's signer set, at
/// least `threshold` of them
pub fn aggregate(
    package: &SigningPackage,
    shares: &[SignatureShare],
    public_shares: &[(u32, RistrettoPoint)],
    group_key: &GroupPublicKey,
    threshold: u32,
) -> Result<Signature> {
    let signers = package.signers();
    if signers.len() < threshold as usize {
        return Err(Error::QuorumNotMet {
            have: signers.len(),
            need: threshold as usize,
        });
    }
    let mut got: Vec<u32> = shares.iter().map(|s| s.index).collect();
    got.sort_unstable();
    if got != signers {
        return Err(Error::ProtocolViolation(
            "signature shares do not match signer set".into(),
        ));
    }

    for share in shares {
        let y_i = public_shares
            .iter()
            .find(|(i, _)| *i == share.index)
            .map(|(_, p)| p)
            .ok_or_else(|| {
                Error::ProtocolViolation(format!("no public share for participant {}", share.index))
            })?;
        verify_share(share, y_i, package, group_key)?;
    }

    let signature = Signature {
        r: package.group_commitment(group_key),
        z: shares.iter().map(|s| s.z).sum(),
    };
    group_key.verify(package.message(), &signature)?;
    Ok(signature)
}
