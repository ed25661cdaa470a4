//! lagrange coefficients at x = 0
//!
//! common denominator trick: for signer set Q
//!
//! λ_i = ξ · ρ_i · d̄⁻¹
//!
//! - ξ = Π_{j ∈ Q} j
//! - d_i = i · Π_{j ≠ i} (j - i)
//! - ρ_i = Π_{j ≠ i} d_j
//! - d̄ = Π d_i
//!
//! one inversion for the whole set instead of one per signer.

use curve25519_dalek::scalar::Scalar;

use crate::{Error, Result};

/// coefficients in the order of `indices`
pub fn compute_lagrange_coefficients(indices: &[u32]) -> Result<Vec<Scalar>> {
    let k = indices.len();
    if k == 0 {
        return Err(Error::InvalidInput("empty signer set".into()));
    }
    if indices.contains(&0) {
        return Err(Error::InvalidInput("participant index 0".into()));
    }
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::ProtocolViolation(format!(
            "duplicate participant {}",
            w[0]
        )));
    }

    if k == 1 {
        return Ok(vec![Scalar::ONE]);
    }

    let xs: Vec<Scalar> = indices.iter().map(|&i| Scalar::from(i)).collect();
    let xi: Scalar = xs.iter().product();

    let d: Vec<Scalar> = (0..k)
        .map(|i| {
            (0..k)
                .filter(|&j| j != i)
                .fold(xs[i], |acc, j| acc * (xs[j] - xs[i]))
        })
        .collect();

    // prefix products, then fold suffix products in from the right
    let mut rho = vec![Scalar::ONE; k];
    for i in 1..k {
        rho[i] = rho[i - 1] * d[i - 1];
    }
    let mut suffix = Scalar::ONE;
    for i in (0..k).rev() {
        rho[i] *= suffix;
        suffix *= d[i];
    }

    let delta = xi * suffix.invert();
    Ok(rho.into_iter().map(|r| delta * r).collect())
}

/// coefficient for one member of `indices`
pub fn lagrange_coefficient(index: u32, indices: &[u32]) -> Result<Scalar> {
    let pos = indices
        .iter()
        .position(|&i| i == index)
        .ok_or_else(|| Error::ProtocolViolation(format!("participant {} not in signer set", index)))?;
    Ok(compute_lagrange_coefficients(indices)?[pos])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_points() {
        // λ_1 = 2, λ_2 = -1
        let coeffs = compute_lagrange_coefficients(&[1, 2]).unwrap();
        assert_eq!(coeffs[0], Scalar::from(2u32));
        assert_eq!(coeffs[1], -Scalar::ONE);
    }

    #[test]
    fn test_interpolates_polynomial() {
        // f(x) = 1 + 2x + 3x², f(1)=6, f(3)=34, f(5)=86
        let coeffs = compute_lagrange_coefficients(&[1, 3, 5]).unwrap();
        let f0 = coeffs[0] * Scalar::from(6u32)
            + coeffs[1] * Scalar::from(34u32)
            + coeffs[2] * Scalar::from(86u32);
        assert_eq!(f0, Scalar::ONE);
    }

    #[test]
    fn test_partition_of_unity() {
        for k in 2..=12u32 {
            let indices: Vec<u32> = (1..=k).collect();
            let sum: Scalar = compute_lagrange_coefficients(&indices).unwrap().iter().sum();
            assert_eq!(sum, Scalar::ONE, "k={}", k);
        }
    }

    #[test]
    fn test_rejects_bad_sets() {
        assert!(compute_lagrange_coefficients(&[]).is_err());
        assert!(compute_lagrange_coefficients(&[0, 1]).is_err());
        assert!(matches!(
            compute_lagrange_coefficients(&[2, 1, 2]),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(lagrange_coefficient(4, &[1, 2, 3]).is_err());
    }
}
