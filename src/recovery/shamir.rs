/// t-of-n Shamir secret sharing over GF(2^8).
///
/// Each secret byte gets its own random polynomial of degree t-1. Share
/// `index` is 0-based and is evaluated at x = index + 1, so x is never zero.
/// Every share carries a BLAKE3 checksum over (index, threshold, data);
/// shares that fail it are excluded before the threshold is counted.
use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::field::Gf256;
use crate::crypto::hash::{self, SHARE_CHECKSUM_CONTEXT};
use crate::crypto::sensitive::SensitiveVec;
use crate::error::{Result, VaultError};

pub const MIN_THRESHOLD: u8 = 2;
pub const MAX_SHARES: usize = 255;

const HEADER_LEN: usize = 2;
const CHECKSUM_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    pub index: u8,
    pub threshold: u8,
    pub data: Vec<u8>,
    pub checksum: [u8; 32],
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Share")
            .field("index", &self.index)
            .field("threshold", &self.threshold)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Share {
    fn new(index: u8, threshold: u8, data: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(index, threshold, &data);
        Self {
            index,
            threshold,
            data,
            checksum,
        }
    }

    pub fn compute_checksum(index: u8, threshold: u8, data: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(SHARE_CHECKSUM_CONTEXT);
        hasher.update(&[index, threshold]);
        hasher.update(data);
        hasher.finalize().into()
    }

    pub(crate) fn x(&self) -> Gf256 {
        Gf256(self.index.wrapping_add(1))
    }

    /// `index || threshold || data || checksum`.
    pub fn to_bytes(&self) -> SensitiveVec {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() + CHECKSUM_LEN);
        out.push(self.index);
        out.push(self.threshold);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.checksum);
        SensitiveVec::new(out)
    }

    /// Parses the layout of [`Share::to_bytes`]. The checksum is not verified here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + 1 + CHECKSUM_LEN {
            return Err(VaultError::InconsistentShares(format!(
                "encoded share too short ({} bytes)",
                bytes.len()
            )));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let mut sum = [0u8; 32];
        sum.copy_from_slice(checksum);
        Ok(Self {
            index: body[0],
            threshold: body[1],
            data: body[HEADER_LEN..].to_vec(),
            checksum: sum,
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes().as_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = hex::decode(s.trim())
            .map_err(|e| VaultError::InconsistentShares(format!("invalid share hex: {e}")))?;
        let share = Self::from_bytes(&bytes);
        bytes.zeroize();
        share
    }
}

/// Split `secret` into `shares` shares, any `threshold` of which reconstruct it.
pub fn split(secret: &[u8], shares: usize, threshold: u8) -> Result<Vec<Share>> {
    if threshold < MIN_THRESHOLD || usize::from(threshold) > shares || shares > MAX_SHARES {
        return Err(VaultError::InvalidThreshold { threshold, shares });
    }
    if secret.is_empty() {
        return Err(VaultError::InconsistentShares("secret must not be empty".into()));
    }

    let mut data: Vec<Vec<u8>> = vec![vec![0u8; secret.len()]; shares];
    let mut random = vec![0u8; usize::from(threshold) - 1];
    let mut coeffs = vec![Gf256::ZERO; usize::from(threshold)];

    for (pos, &byte) in secret.iter().enumerate() {
        rand::rngs::OsRng.fill_bytes(&mut random);
        coeffs[0] = Gf256(byte);
        for (c, &r) in coeffs[1..].iter_mut().zip(random.iter()) {
            *c = Gf256(r);
        }
        for (i, share) in data.iter_mut().enumerate() {
            let x = Gf256(i as u8 + 1);
            share[pos] = Gf256::eval_polynomial(&coeffs, x).0;
        }
    }

    random.zeroize();
    for c in coeffs.iter_mut() {
        c.0 = 0;
    }

    Ok(data
        .into_iter()
        .enumerate()
        .map(|(i, d)| Share::new(i as u8, threshold, d))
        .collect())
}

pub fn verify_share(share: &Share) -> Result<()> {
    let expected = Share::compute_checksum(share.index, share.threshold, &share.data);
    if !hash::digest_eq(&expected, &share.checksum) || share.data.is_empty() {
        return Err(VaultError::ShareChecksumInvalid { index: share.index });
    }
    Ok(())
}

/// Checksum-passing shares, first occurrence per index, and the number rejected.
pub fn select_valid(shares: &[Share]) -> (Vec<&Share>, usize) {
    let mut by_index: BTreeMap<u8, &Share> = BTreeMap::new();
    let mut rejected = 0usize;
    for share in shares {
        match verify_share(share) {
            Ok(()) if !by_index.contains_key(&share.index) => {
                by_index.insert(share.index, share);
            }
            Ok(()) => {
                debug!(index = share.index, "Duplicate share ignored");
                rejected += 1;
            }
            Err(_) => {
                debug!(index = share.index, "Share failed checksum");
                rejected += 1;
            }
        }
    }
    (by_index.into_values().collect(), rejected)
}

/// Reconstruct from whatever mix of valid, corrupt and duplicate shares is given.
///
/// The threshold is taken from the valid shares themselves.
pub fn combine(shares: &[Share]) -> Result<SensitiveVec> {
    let (valid, _) = select_valid(shares);
    let required = match valid.first() {
        Some(s) => s.threshold,
        None => {
            return Err(VaultError::InsufficientShares {
                valid: 0,
                required: shares.first().map_or(usize::from(MIN_THRESHOLD), |s| usize::from(s.threshold)),
            })
        }
    };
    interpolate(&valid, required)
}

/// Like [`combine`] but with a threshold fixed by the caller (e.g. a recovery kit).
pub fn combine_with_threshold(shares: &[Share], threshold: u8) -> Result<SensitiveVec> {
    let (valid, _) = select_valid(shares);
    interpolate(&valid, threshold)
}

fn interpolate(valid: &[&Share], threshold: u8) -> Result<SensitiveVec> {
    if threshold < MIN_THRESHOLD {
        return Err(VaultError::InvalidThreshold {
            threshold,
            shares: valid.len(),
        });
    }
    let required = usize::from(threshold);
    if valid.len() < required {
        return Err(VaultError::InsufficientShares {
            valid: valid.len(),
            required,
        });
    }

    let chosen = &valid[..required];
    let len = chosen[0].data.len();
    if let Some(bad) = chosen
        .iter()
        .find(|s| s.threshold != threshold || s.data.len() != len)
    {
        return Err(VaultError::InconsistentShares(format!(
            "share {} has threshold {} and length {}, expected {} and {}",
            bad.index,
            bad.threshold,
            bad.data.len(),
            threshold,
            len
        )));
    }

    let mut secret = vec![0u8; len];
    let mut points = Vec::with_capacity(required);
    for (pos, out) in secret.iter_mut().enumerate() {
        points.clear();
        points.extend(chosen.iter().map(|s| (s.x(), Gf256(s.data[pos]))));
        *out = Gf256::interpolate_at_zero(&points)
            .ok_or_else(|| VaultError::InconsistentShares("duplicate share coordinates".into()))?
            .0;
    }
    Ok(SensitiveVec::new(secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"correct horse battery staple 0123456789";

    #[test]
    fn test_any_three_of_five_reconstruct() {
        let shares = split(SECRET, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);
        for a in 0..5 {
            for b in (a + 1)..5 {
                for c in (b + 1)..5 {
                    let subset = [shares[a].clone(), shares[b].clone(), shares[c].clone()];
                    assert_eq!(combine(&subset).unwrap().as_bytes(), SECRET, "{a},{b},{c}");
                }
            }
        }
    }

    #[test]
    fn test_two_of_five_insufficient() {
        let shares = split(SECRET, 5, 3).unwrap();
        assert!(matches!(
            combine(&shares[..2]),
            Err(VaultError::InsufficientShares { valid: 2, required: 3 })
        ));
    }

    #[test]
    fn test_tampered_share_excluded() {
        let mut shares = split(SECRET, 5, 3).unwrap();
        shares[1].data[0] ^= 0x01;
        assert!(matches!(
            verify_share(&shares[1]),
            Err(VaultError::ShareChecksumInvalid { index: 1 })
        ));

        assert!(matches!(
            combine(&shares[..3]),
            Err(VaultError::InsufficientShares { valid: 2, required: 3 })
        ));
        assert_eq!(combine(&shares).unwrap().as_bytes(), SECRET);
    }

    #[test]
    fn test_duplicates_do_not_count() {
        let shares = split(SECRET, 5, 3).unwrap();
        let dup = [shares[0].clone(), shares[0].clone(), shares[2].clone()];
        let (valid, rejected) = select_valid(&dup);
        assert_eq!(valid.len(), 2);
        assert_eq!(rejected, 1);
        assert!(matches!(combine(&dup), Err(VaultError::InsufficientShares { .. })));
    }

    #[test]
    fn test_parameter_bounds() {
        assert!(matches!(split(SECRET, 5, 1), Err(VaultError::InvalidThreshold { .. })));
        assert!(matches!(split(SECRET, 3, 4), Err(VaultError::InvalidThreshold { .. })));
        assert!(matches!(split(SECRET, 256, 3), Err(VaultError::InvalidThreshold { .. })));
        assert!(split(b"", 3, 2).is_err());

        let shares = split(b"k", 255, 255).unwrap();
        assert_eq!(shares[254].index, 254);
        assert_eq!(combine(&shares).unwrap().as_bytes(), b"k");
    }

    #[test]
    fn test_shares_are_randomized() {
        let a = split(SECRET, 3, 2).unwrap();
        let b = split(SECRET, 3, 2).unwrap();
        assert_ne!(a[0].data, b[0].data);
    }

    #[test]
    fn test_hex_encoding() {
        let shares = split(SECRET, 3, 2).unwrap();
        let hex = shares[2].to_hex();
        let parsed = Share::from_hex(&hex).unwrap();
        assert_eq!(parsed, shares[2]);
        verify_share(&parsed).unwrap();

        assert!(Share::from_hex("zz").is_err());
        assert!(Share::from_hex("0102").is_err());
    }

    #[test]
    fn test_combine_with_threshold_rejects_mismatched_share() {
        let shares = split(SECRET, 4, 2).unwrap();
        assert!(matches!(
            combine_with_threshold(&shares[..2], 3),
            Err(VaultError::InsufficientShares { valid: 2, required: 3 })
        ));
        assert!(matches!(
            combine_with_threshold(&shares[..3], 3),
            Err(VaultError::InconsistentShares(_))
        ));
    }
}
