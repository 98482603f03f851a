use crate::Error;
use crate::codec::{Reader, append_data, append_short};
use crate::crypto::{RandomSource, random_bytes, sha1};
use dsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use dsa::{BigUint, Components, Signature, SigningKey, VerifyingKey};
use hex_literal::hex;
use num_traits::One;
use std::fmt;
use zeroize::Zeroize;

/// Key type field of a serialized DSA public key.
const DSA_KEY_TYPE: u16 = 0x0000;

/// Byte length of the built-in subgroup order q.
const DSA_Q_LEN: usize = 20;

const DSA_P: [u8; 128] = hex!(
    "cdb5d281970698ded89fdb8b9b92530b2fc7788ea11390beca581f1d85721396"
    "0f369bed9c501b70bc426a6001cf0f4e97fbb72409a7aed701ddfd99ec97ce0c"
    "17dba5d6c4cbc575e7fc59c8afaccc36911abbf7cec299022b9fa291de09f1a6"
    "ea830fdf1b3aac6aa26ef6532995b2d3a377b9ec31fc19928a7ac62515e5672b"
);
const DSA_Q: [u8; DSA_Q_LEN] = hex!("b2415354a0924723794ef9b83e81fc5b227d6acb");
const DSA_G: [u8; 128] = hex!(
    "36d8bceefc3a3dee3e114cc7bd4d60e122c87c504a851b24383b212ce5b3c0fa"
    "bd6c429fd2ca851b03177d41e50a2afd61b468a7c903114d9859bdf586a3b9d4"
    "a9ca78e6c5e251dd795b7021e5333723ef073d6875a1417255b9d19ce59baa96"
    "94b534225bad97c9d35f579db431af602fcf5f3ea0404b051b0448bbe3062cc4"
);

fn invalid_key() -> Error {
    Error::Malformed("Invalid public key parameters".to_string())
}

/// Appends `n` as an MPI, wiping the temporary byte copy.
fn append_dsa_mpi(out: &mut Vec<u8>, n: &BigUint) {
    let mut bytes = n.to_bytes_be();
    append_data(out, &bytes);
    bytes.zeroize();
}

fn read_dsa_mpi(reader: &mut Reader<'_>) -> Result<BigUint, Error> {
    Ok(BigUint::from_bytes_be(reader.data()?))
}

/// A long-term DSA public key.
#[derive(Clone, Debug)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    /// Serializes the key as the key type followed by the MPIs p, q, g and y.
    pub fn to_bytes(&self) -> Vec<u8> {
        let components = self.key.components();
        let mut out = Vec::new();
        append_short(&mut out, DSA_KEY_TYPE);
        for n in [components.p(), components.q(), components.g(), self.key.y()] {
            append_dsa_mpi(&mut out, n);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let key = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(key)
    }

    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        if reader.short()? != DSA_KEY_TYPE {
            return Err(Error::Malformed("Unsupported public key type".to_string()));
        }
        let p = read_dsa_mpi(reader)?;
        let q = read_dsa_mpi(reader)?;
        let g = read_dsa_mpi(reader)?;
        let y = read_dsa_mpi(reader)?;

        let components = Components::from_components(p, q, g).map_err(|_| invalid_key())?;
        let key = VerifyingKey::from_components(components, y).map_err(|_| invalid_key())?;
        Ok(Self { key })
    }

    /// SHA-1 over the serialized key without its type field.
    pub fn fingerprint(&self) -> [u8; 20] {
        let bytes = self.to_bytes();
        sha1(&[&bytes[2..]])
    }

    /// Byte length of one signature half.
    fn half_len(&self) -> usize {
        self.key.components().q().bits().div_ceil(8)
    }

    /// Verifies a signature laid out as r followed by s.
    ///
    /// `hash` is truncated to the size of q, as DSA prescribes.
    pub(crate) fn verify(&self, hash: &[u8], signature: &[u8]) -> Result<(), Error> {
        let bad = || Error::Authentication("Bad signature".to_string());
        let half = self.half_len();
        if signature.len() != 2 * half {
            return Err(bad());
        }

        let (r, s) = signature.split_at(half);
        let signature =
            Signature::from_components(BigUint::from_bytes_be(r), BigUint::from_bytes_be(s))
                .map_err(|_| bad())?;
        self.key.verify_prehash(hash, &signature).map_err(|_| bad())
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        let (ours, theirs) = (self.key.components(), other.key.components());
        self.key.y() == other.key.y()
            && ours.p() == theirs.p()
            && ours.q() == theirs.q()
            && ours.g() == theirs.g()
    }
}

impl Eq for PublicKey {}

/// A long-term DSA private key, used to sign during the key exchange.
///
/// The secret exponent lives in a [`SigningKey`], which wipes it on drop.
pub struct PrivateKey {
    public: PublicKey,
    key: SigningKey,
}

impl PrivateKey {
    /// Generates a new key from the operating system's random source.
    pub fn generate() -> Result<Self, Error> {
        Self::generate_with(&mut rand::rngs::OsRng)
    }

    /// Generates a new key over the built-in 1024-bit domain parameters.
    pub fn generate_with(rng: &mut dyn RandomSource) -> Result<Self, Error> {
        let components = Components::from_components(
            BigUint::from_bytes_be(&DSA_P),
            BigUint::from_bytes_be(&DSA_Q),
            BigUint::from_bytes_be(&DSA_G),
        )
        .map_err(|err| Error::Crypto(err.to_string()))?;

        let x = random_below(rng, components.q())?;
        let y = components.g().modpow(&x, components.p());
        Self::from_parts(components, y, x)
    }

    fn from_parts(components: Components, y: BigUint, x: BigUint) -> Result<Self, Error> {
        let verifying = VerifyingKey::from_components(components, y).map_err(|_| invalid_key())?;
        let key = SigningKey::from_components(verifying.clone(), x)
            .map_err(|_| Error::Malformed("Invalid private key".to_string()))?;
        Ok(Self {
            public: PublicKey { key: verifying },
            key,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Serializes the public key followed by the MPI x.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.public.to_bytes();
        append_dsa_mpi(&mut out, self.key.x());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let public = PublicKey::read(&mut reader)?;
        let x = read_dsa_mpi(&mut reader)?;
        reader.finish()?;

        let components = public.key.components();
        if components.g().modpow(&x, components.p()) != *public.key.y() {
            return Err(Error::Malformed("Private key does not match public key".to_string()));
        }
        Self::from_parts(components.clone(), public.key.y().clone(), x)
    }

    /// Signs `hash` with a deterministic nonce, returning r followed by s,
    /// each padded to the size of q.
    pub(crate) fn sign(&self, hash: &[u8]) -> Result<Vec<u8>, Error> {
        let signature: Signature = self
            .key
            .sign_prehash(hash)
            .map_err(|err| Error::Crypto(err.to_string()))?;

        let half = self.public.half_len();
        let mut out = vec![0u8; 2 * half];
        let r = signature.r().to_bytes_be();
        let s = signature.s().to_bytes_be();
        out[half - r.len()..half].copy_from_slice(&r);
        out[2 * half - s.len()..].copy_from_slice(&s);
        Ok(out)
    }
}

/// A uniformly distributed value in [1, bound - 1].
fn random_below(rng: &mut dyn RandomSource, bound: &BigUint) -> Result<BigUint, Error> {
    let one = BigUint::one();
    let mut bytes = random_bytes(rng, DSA_Q_LEN + 8)?;
    let n = BigUint::from_bytes_be(&bytes) % (bound - &one) + &one;
    bytes.zeroize();
    Ok(n)
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn create_key(seed: u64) -> PrivateKey {
        let mut rng = StdRng::seed_from_u64(seed);
        PrivateKey::generate_with(&mut rng).unwrap()
    }

    #[test]
    fn test_domain_parameters() {
        let p = BigUint::from_bytes_be(&DSA_P);
        let q = BigUint::from_bytes_be(&DSA_Q);
        let g = BigUint::from_bytes_be(&DSA_G);

        assert_eq!(p.bits(), 1024);
        assert_eq!(q.bits(), 160);
        assert!(((&p - BigUint::one()) % &q).is_zero());
        assert!(g.modpow(&q, &p).is_one());
    }

    #[test]
    fn test_sign_and_verify() {
        let key = create_key(11);
        let hash = [0x5Au8; 32];

        let signature = key.sign(&hash).unwrap();
        assert_eq!(signature.len(), 40);
        assert!(key.public_key().verify(&hash, &signature).is_ok());
        assert_eq!(key.sign(&hash).unwrap(), signature, "nonces are deterministic");

        let mut other = hash;
        other[0] ^= 1;
        assert!(key.public_key().verify(&other, &signature).is_err());

        let mut tampered = signature.clone();
        tampered[39] ^= 1;
        assert!(key.public_key().verify(&hash, &tampered).is_err());
    }

    #[test]
    fn test_verify_with_wrong_key_fails() {
        let alice = create_key(21);
        let bob = create_key(22);

        let signature = alice.sign(b"some message hash").unwrap();
        assert!(bob.public_key().verify(b"some message hash", &signature).is_err());
        assert!(alice.public_key().verify(b"some message hash", &signature[..39]).is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let key = create_key(31);

        let public = PublicKey::from_bytes(&key.public_key().to_bytes()).unwrap();
        assert_eq!(&public, key.public_key());

        let private = PrivateKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(private.public_key(), key.public_key());
        assert_eq!(private.sign(b"hash").unwrap(), key.sign(b"hash").unwrap());
        assert_eq!(
            private.public_key().fingerprint(),
            key.public_key().fingerprint()
        );
    }

    #[test]
    fn test_private_key_must_match() {
        let alice = create_key(41);
        let bob = create_key(42);

        let mut forged = alice.public_key().to_bytes();
        append_dsa_mpi(&mut forged, bob.key.x());
        assert!(PrivateKey::from_bytes(&forged).is_err());
    }

    #[test]
    fn test_fingerprint_skips_key_type() {
        let key = create_key(51);
        let bytes = key.public_key().to_bytes();
        assert_eq!(&bytes[..2], &[0, 0]);
        assert_eq!(key.public_key().fingerprint(), sha1(&[&bytes[2..]]));
    }

    #[test]
    fn test_rejects_unknown_key_type() {
        let key = create_key(61);
        let mut bytes = key.public_key().to_bytes();
        bytes[1] = 1;
        assert!(PublicKey::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rejects_key_outside_subgroup() {
        let key = create_key(71);
        let components = key.public.key.components();

        let mut bytes = Vec::new();
        append_short(&mut bytes, DSA_KEY_TYPE);
        for n in [components.p(), components.q(), components.g()] {
            append_dsa_mpi(&mut bytes, n);
        }
        append_dsa_mpi(&mut bytes, &BigUint::from(2u32));
        assert!(PublicKey::from_bytes(&bytes).is_err());
    }
}
