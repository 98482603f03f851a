mod random;

pub use random::*;

use crate::Error;
use aes::cipher::{KeyIvInit, StreamCipher};
use hex_literal::hex;
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use subtle::ConstantTimeEq;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// The 1536-bit MODP group from RFC 3526, section 2.
const MODULUS_BYTES: [u8; 192] = hex!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1"
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD"
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245"
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED"
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D"
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F"
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D"
    "670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF"
);

static MODULUS: LazyLock<BigUint> = LazyLock::new(|| BigUint::from_bytes_be(&MODULUS_BYTES));
static MODULUS_MINUS_TWO: LazyLock<BigUint> =
    LazyLock::new(|| &*MODULUS - BigUint::from(2u32));
static ORDER: LazyLock<BigUint> = LazyLock::new(|| (&*MODULUS - BigUint::one()) >> 1);
static GENERATOR: LazyLock<BigUint> = LazyLock::new(|| BigUint::from(2u32));

/// Order q = (p - 1) / 2 of the subgroup generated by g.
pub(crate) fn order() -> &'static BigUint {
    &ORDER
}

/// Elements must lie in [2, p - 2].
pub(crate) fn is_group_element(n: &BigUint) -> bool {
    *n >= BigUint::from(2u32) && *n <= *MODULUS_MINUS_TWO
}

/// Computes g^e mod p.
pub(crate) fn exp_g(e: &BigUint) -> BigUint {
    GENERATOR.modpow(e, &MODULUS)
}

/// Computes b^e mod p.
pub(crate) fn exp(b: &BigUint, e: &BigUint) -> BigUint {
    b.modpow(e, &MODULUS)
}

/// Computes a * b mod p.
pub(crate) fn mul(a: &BigUint, b: &BigUint) -> BigUint {
    (a * b) % &*MODULUS
}

/// Computes a / b mod p.
pub(crate) fn div(a: &BigUint, b: &BigUint) -> BigUint {
    mul(a, &mod_inverse(b, &MODULUS))
}

/// Inverse of n modulo the prime m, via Fermat's little theorem.
fn mod_inverse(n: &BigUint, m: &BigUint) -> BigUint {
    n.modpow(&(m - BigUint::from(2u32)), m)
}

/// Computes (a - b) mod m for a, b < m.
pub(crate) fn sub_mod(a: &BigUint, b: &BigUint, m: &BigUint) -> BigUint {
    let a = a % m;
    let b = b % m;
    if a >= b { a - b } else { m - (b - a) }
}

/// Drops the digits of a big integer.
pub(crate) fn wipe_big(n: &mut BigUint) {
    n.set_zero();
}

pub(crate) fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub(crate) fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; 20], Error> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], Error> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// AES-128 in counter mode. Encryption and decryption are the same operation.
pub(crate) fn aes_ctr(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)?;
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulus_is_rfc3526_group() {
        assert_eq!(MODULUS.bits(), 1536);
        assert_eq!(&MODULUS.to_bytes_be()[..8], &[0xFF; 8]);
        // 2 generates the subgroup of order q
        assert!(exp_g(order()).is_one());
    }

    #[test]
    fn test_group_element_bounds() {
        assert!(!is_group_element(&BigUint::one()));
        assert!(is_group_element(&BigUint::from(2u32)));
        assert!(is_group_element(&(&*MODULUS - BigUint::from(2u32))));
        assert!(!is_group_element(&(&*MODULUS - BigUint::one())));
        assert!(!is_group_element(&BigUint::zero()));
    }

    #[test]
    fn test_division_inverts_multiplication() {
        let a = exp_g(&BigUint::from(12345u32));
        let b = exp_g(&BigUint::from(6789u32));
        assert_eq!(div(&mul(&a, &b), &b), a);
    }

    #[test]
    fn test_sub_mod_wraps() {
        let m = BigUint::from(11u32);
        assert_eq!(
            sub_mod(&BigUint::from(3u32), &BigUint::from(5u32), &m),
            BigUint::from(9u32)
        );
        assert_eq!(
            sub_mod(&BigUint::from(5u32), &BigUint::from(3u32), &m),
            BigUint::from(2u32)
        );
    }

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(
            hex::encode(sha1(&[b"a", b"bc"])),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_aes_ctr_is_involution() {
        let key = [7u8; 16];
        let iv = [0u8; 16];
        let ciphertext = aes_ctr(&key, &iv, b"attack at dawn").unwrap();
        assert_ne!(ciphertext, b"attack at dawn");
        assert_eq!(aes_ctr(&key, &iv, &ciphertext).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_aes_ctr_rejects_bad_key() {
        assert!(aes_ctr(&[0u8; 5], &[0u8; 16], b"x").is_err());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
