//! threshold secret sharing using shamir's scheme over GF(256)
//!
//! M-of-N with 1 <= M <= N <= 255, any secret length. each byte of the
//! secret gets its own random polynomial of degree M-1, so fewer than M
//! shares are uniformly distributed and say nothing about the secret.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, mac};
use crate::{Error, Result};

pub const SPLIT_ID_LEN: usize = 16;

/// one share of a split
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    /// identifies the split this share came from
    #[serde(with = "crate::envelope::hex_array")]
    pub split_id: [u8; SPLIT_ID_LEN],
    /// evaluation point (1-indexed, never zero)
    pub index: u8,
    pub threshold: u8,
    pub total: u8,
    #[serde(with = "crate::envelope::hex_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "crate::envelope::hex_array")]
    pub checksum: [u8; 8],
}

impl Share {
    fn new(split_id: [u8; SPLIT_ID_LEN], index: u8, threshold: u8, total: u8, data: Vec<u8>) -> Self {
        let checksum = share_checksum(&split_id, index, threshold, total, &data);
        Self { split_id, index, threshold, total, data, checksum }
    }

    /// verify the share checksum
    pub fn verify(&self) -> Result<()> {
        let expected = share_checksum(&self.split_id, self.index, self.threshold, self.total, &self.data);
        if self.index != 0 && crypto::ct_eq(&expected, &self.checksum) {
            Ok(())
        } else {
            Err(Error::ShareVerificationFailed)
        }
    }

    /// serialize to bytes, used as the plaintext of a sealed guardian share
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Vec::with_capacity(SPLIT_ID_LEN + 3 + 2 + self.data.len() + 8);
        bytes.extend_from_slice(&self.split_id);
        bytes.push(self.index);
        bytes.push(self.threshold);
        bytes.push(self.total);
        bytes.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes.extend_from_slice(&self.checksum);
        Zeroizing::new(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = SPLIT_ID_LEN + 3 + 2;
        if bytes.len() < header + 8 {
            return Err(Error::ShareVerificationFailed);
        }
        let split_id: [u8; SPLIT_ID_LEN] = bytes[..SPLIT_ID_LEN]
            .try_into()
            .map_err(|_| Error::ShareVerificationFailed)?;
        let index = bytes[SPLIT_ID_LEN];
        let threshold = bytes[SPLIT_ID_LEN + 1];
        let total = bytes[SPLIT_ID_LEN + 2];
        let data_len = u16::from_le_bytes([bytes[SPLIT_ID_LEN + 3], bytes[SPLIT_ID_LEN + 4]]) as usize;

        if bytes.len() != header + data_len + 8 {
            return Err(Error::ShareVerificationFailed);
        }

        let data = bytes[header..header + data_len].to_vec();
        let checksum: [u8; 8] = bytes[header + data_len..]
            .try_into()
            .map_err(|_| Error::ShareVerificationFailed)?;

        let share = Self { split_id, index, threshold, total, data, checksum };
        share.verify()?;
        Ok(share)
    }
}

fn share_checksum(split_id: &[u8], index: u8, threshold: u8, total: u8, data: &[u8]) -> [u8; 8] {
    let tag = mac(split_id, &[b"shieldbox:share_checksum:v1", &[index, threshold, total], data]);
    let mut out = [0u8; 8];
    out.copy_from_slice(&tag[..8]);
    out
}

/// GF(256) multiplication using AES polynomial (x^8 + x^4 + x^3 + x + 1)
fn gf256_mul(a: u8, b: u8) -> u8 {
    let mut result = 0u8;
    let mut a = a;
    let mut b = b;

    while b != 0 {
        if b & 1 != 0 {
            result ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    result
}

/// GF(256) multiplicative inverse, a^254
fn gf256_inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    let mut result = a;
    for _ in 0..6 {
        result = gf256_mul(result, result);
        result = gf256_mul(result, a);
    }
    gf256_mul(result, result)
}

fn gf256_div(a: u8, b: u8) -> u8 {
    gf256_mul(a, gf256_inv(b))
}

/// evaluate polynomial at point x (horner)
fn poly_eval(coeffs: &[u8], x: u8) -> u8 {
    coeffs
        .iter()
        .rev()
        .fold(0u8, |acc, &c| gf256_mul(acc, x) ^ c)
}

/// lagrange interpolation at x=0
fn lagrange_interpolate(points: &[(u8, u8)]) -> u8 {
    let mut result = 0u8;

    for (i, &(xi, yi)) in points.iter().enumerate() {
        let mut num = 1u8;
        let mut den = 1u8;

        for (j, &(xj, _)) in points.iter().enumerate() {
            if i != j {
                num = gf256_mul(num, xj); // (0 - xj) = xj in GF(256)
                den = gf256_mul(den, xi ^ xj); // (xi - xj)
            }
        }

        result ^= gf256_mul(yi, gf256_div(num, den));
    }

    result
}

pub(crate) fn check_threshold(total: usize, threshold: usize) -> Result<()> {
    if threshold < 1 || threshold > total || total > u8::MAX as usize {
        return Err(Error::InvalidThreshold { threshold, total });
    }
    Ok(())
}

/// split a secret into `total` shares, any `threshold` of which reconstruct it
pub fn split_secret(secret: &[u8], total: usize, threshold: usize) -> Result<Vec<Share>> {
    check_threshold(total, threshold)?;
    if secret.is_empty() || secret.len() > u16::MAX as usize {
        return Err(Error::InvalidSecretLength);
    }

    let split_id: [u8; SPLIT_ID_LEN] = crypto::random_bytes();
    let mut rng = rand::thread_rng();
    let mut data = vec![vec![0u8; secret.len()]; total];
    let mut coeffs = Zeroizing::new(vec![0u8; threshold]);

    for (byte_index, &secret_byte) in secret.iter().enumerate() {
        coeffs[0] = secret_byte;
        rng.fill_bytes(&mut coeffs[1..]);

        for (share_index, share_data) in data.iter_mut().enumerate() {
            share_data[byte_index] = poly_eval(&coeffs, (share_index + 1) as u8);
        }
    }

    Ok(data
        .into_iter()
        .enumerate()
        .map(|(i, d)| Share::new(split_id, (i + 1) as u8, threshold as u8, total as u8, d))
        .collect())
}

/// reconstruct the secret from at least `threshold` shares of one split
pub fn reconstruct(shares: &[Share]) -> Result<Zeroizing<Vec<u8>>> {
    let first = shares.first().ok_or(Error::InsufficientShares { have: 0, need: 1 })?;

    for share in shares {
        share.verify()?;
        if share.split_id != first.split_id
            || share.threshold != first.threshold
            || share.total != first.total
            || share.data.len() != first.data.len()
            || share.index > share.total
        {
            return Err(Error::InconsistentShares);
        }
    }

    // same index twice is fine if it is the same share, conflicting is not
    let mut distinct: Vec<&Share> = Vec::with_capacity(shares.len());
    for share in shares {
        match distinct.iter().find(|s| s.index == share.index) {
            Some(seen) if seen.data != share.data => return Err(Error::InconsistentShares),
            Some(_) => {}
            None => distinct.push(share),
        }
    }

    let need = first.threshold as usize;
    if distinct.len() < need {
        return Err(Error::InsufficientShares { have: distinct.len(), need });
    }

    let used = &distinct[..need];
    let mut secret = Zeroizing::new(vec![0u8; first.data.len()]);
    let mut points = Zeroizing::new(vec![(0u8, 0u8); need]);

    for i in 0..secret.len() {
        for (point, share) in points.iter_mut().zip(used) {
            *point = (share.index, share.data[i]);
        }
        secret[i] = lagrange_interpolate(&points);
    }

    Ok(secret)
}
