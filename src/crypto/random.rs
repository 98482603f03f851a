use crate::Error;
use num_bigint::BigUint;
use rand::TryRngCore;
use zeroize::Zeroize;

/// A source of cryptographically secure random bytes.
///
/// Every type implementing [`rand::TryRngCore`] is a `RandomSource`, so both
/// `rand::rngs::OsRng` and seeded generators can drive a conversation.
/// Failures are reported as [`Error::Random`] and never replaced by a weaker
/// source.
pub trait RandomSource {
    /// Fills `dest` entirely with random bytes.
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), Error>;
}

impl<R: TryRngCore> RandomSource for R {
    fn fill(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.try_fill_bytes(dest).map_err(|_| Error::Random)
    }
}

/// Smallest instance tag a client may use.
pub(crate) const MIN_INSTANCE_TAG: u32 = 0x100;

pub(crate) fn random_bytes(rng: &mut dyn RandomSource, len: usize) -> Result<Vec<u8>, Error> {
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes)?;
    Ok(bytes)
}

/// A random integer of `len` bytes, as used for exponents.
pub(crate) fn random_mpi(rng: &mut dyn RandomSource, len: usize) -> Result<BigUint, Error> {
    let mut bytes = random_bytes(rng, len)?;
    let n = BigUint::from_bytes_be(&bytes);
    bytes.zeroize();
    Ok(n)
}

/// A random instance tag, never below [`MIN_INSTANCE_TAG`].
pub(crate) fn random_instance_tag(rng: &mut dyn RandomSource) -> Result<u32, Error> {
    loop {
        let mut bytes = [0u8; 4];
        rng.fill(&mut bytes)?;
        let tag = u32::from_be_bytes(bytes);
        if tag >= MIN_INSTANCE_TAG {
            return Ok(tag);
        }
    }
}

/// Generator for tests that fails once it has handed out `budget` bytes.
#[cfg(test)]
pub(crate) struct LimitedRng {
    inner: rand::rngs::StdRng,
    budget: usize,
}

#[cfg(test)]
impl LimitedRng {
    pub(crate) fn new(seed: u64, budget: usize) -> Self {
        use rand::SeedableRng;
        Self {
            inner: rand::rngs::StdRng::seed_from_u64(seed),
            budget,
        }
    }

    fn take(&mut self, len: usize) -> Result<(), Exhausted> {
        self.budget = self.budget.checked_sub(len).ok_or(Exhausted)?;
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug)]
pub(crate) struct Exhausted;

#[cfg(test)]
impl std::fmt::Display for Exhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "random budget exhausted")
    }
}

#[cfg(test)]
impl std::error::Error for Exhausted {}

#[cfg(test)]
impl TryRngCore for LimitedRng {
    type Error = Exhausted;

    fn try_next_u32(&mut self) -> Result<u32, Self::Error> {
        self.take(4)?;
        Ok(rand::RngCore::next_u32(&mut self.inner))
    }

    fn try_next_u64(&mut self) -> Result<u64, Self::Error> {
        self.take(8)?;
        Ok(rand::RngCore::next_u64(&mut self.inner))
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Self::Error> {
        self.take(dest.len())?;
        rand::RngCore::fill_bytes(&mut self.inner, dest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_random_failure_is_reported() {
        let mut rng = LimitedRng::new(1, 0);
        assert_eq!(random_bytes(&mut rng, 16), Err(Error::Random));
        assert_eq!(random_instance_tag(&mut rng), Err(Error::Random));
    }

    #[test]
    fn test_budget_runs_out() {
        let mut rng = LimitedRng::new(1, 20);
        assert!(random_bytes(&mut rng, 16).is_ok());
        assert_eq!(random_bytes(&mut rng, 16), Err(Error::Random));
        assert!(random_bytes(&mut rng, 4).is_ok());
    }

    #[test]
    fn test_instance_tags_are_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(random_instance_tag(&mut rng).unwrap() >= MIN_INSTANCE_TAG);
        }
    }

    #[test]
    fn test_random_mpi_size() {
        let mut rng = StdRng::seed_from_u64(1);
        let n = random_mpi(&mut rng, 40).unwrap();
        assert!(n.bits() <= 320);
    }
}
