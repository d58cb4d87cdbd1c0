//! Random number generation utilities.

pub use rand_core::{CryptoRng, OsRng, RngCore, SeedableRng};

/// A succinct trait alias for a Cryptographically Secure PRNG.
///
/// Key-generating entry points take `&mut impl Crng` so tests can thread a
/// deterministic generator through [`SecretKey::new`] and
/// [`WorkingKey::generate`] instead of patching global state.
///
/// [`SecretKey::new`]: crate::secret_key::SecretKey::new
/// [`WorkingKey::generate`]: crate::working_key::WorkingKey::generate
pub trait Crng: RngCore + CryptoRng {}

impl<R: RngCore + CryptoRng> Crng for R {}

/// A small, fast, _non-cryptographic_ rng with decent statistical
/// properties, used as a deterministic generator in tests. The
/// implementation is xoshiro128++.
#[derive(Clone, Debug)]
pub struct WeakRng {
    s: [u32; 4],
}

impl WeakRng {
    pub fn new() -> Self {
        Self::from_u64(0xf00d_4bad_cafe_b0ba)
    }

    pub fn from_u64(seed: u64) -> Self {
        Self::seed_from_u64(seed)
    }
}

impl Default for WeakRng {
    fn default() -> Self {
        Self::new()
    }
}

/// Only pretend to be a [`CryptoRng`] in tests.
#[cfg(any(test, feature = "test-utils"))]
impl CryptoRng for WeakRng {}

impl RngCore for WeakRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        let [s0, s1, s2, s3] = self.s;
        let out = s0
            .wrapping_add(s3)
            .rotate_left(7)
            .wrapping_add(s0);

        let t = s1 << 9;
        let mut s = [s0, s1, s2 ^ s0, s3 ^ s1];
        s[1] ^= s[2];
        s[0] ^= s[3];
        s[2] ^= t;
        s[3] = s[3].rotate_left(11);
        self.s = s;

        out
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_u32(self)
    }

    #[inline]
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest)
    }

    #[inline]
    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for WeakRng {
    type Seed = [u8; 16];

    fn from_seed(seed: Self::Seed) -> Self {
        let mut s = [0u32; 4];
        rand_core::le::read_u32_into(&seed, &mut s);
        // xoshiro must not start from the all-zero state
        if s == [0; 4] {
            s = [0xdead_beef, 0xf00b_aa44, 0x1234_5678, 0x9abc_def0];
        }
        Self { s }
    }
}
