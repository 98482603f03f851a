use crate::Error;
use crate::crypto::{RandomSource, exp, exp_g, random_mpi, wipe_big};
use num_bigint::BigUint;
use zeroize::Zeroize;

/// Size in bytes of a Diffie-Hellman private exponent.
const DH_PRIVATE_LEN: usize = 40;

/// Ephemeral Diffie-Hellman key pair over the 1536-bit MODP group.
#[derive(Clone)]
pub(crate) struct DhKeyPair {
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    pub(crate) fn generate(rng: &mut dyn RandomSource) -> Result<Self, Error> {
        let private = random_mpi(rng, DH_PRIVATE_LEN)?;
        let public = exp_g(&private);
        Ok(Self { private, public })
    }

    pub(crate) fn public(&self) -> &BigUint {
        &self.public
    }

    /// Computes their_public^private mod p.
    pub(crate) fn shared_secret(&self, their_public: &BigUint) -> BigUint {
        exp(their_public, &self.private)
    }
}

impl Zeroize for DhKeyPair {
    fn zeroize(&mut self) {
        wipe_big(&mut self.private);
        wipe_big(&mut self.public);
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.zeroize();
    }
}
