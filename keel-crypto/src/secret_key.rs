//! Passphrase-derived secret keys (scrypt + verifier digest).

use std::fmt;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::{
    error::Error,
    rng::Crng,
    working_key::{self, WorkingKey},
};

/// Byte length of the random scrypt salt.
pub const SALT_LEN: usize = 32;

/// Byte length of the SHA-256 verifier digest.
pub const DIGEST_LEN: usize = 32;

/// Exact byte length of marshaled [`Parameters`]:
/// salt || digest || n || r || p, all integers little-endian u64.
pub const PARAMS_LEN: usize = SALT_LEN + DIGEST_LEN + 3 * 8;

/// Scrypt cost settings used when deriving a [`SecretKey`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScryptOptions {
    pub n: u64,
    pub r: u64,
    pub p: u64,
}

impl ScryptOptions {
    /// Production cost settings.
    pub const DEFAULT: Self = Self { n: 262144, r: 8, p: 1 };

    /// Fast profile for tests. Do not use outside of tests; keys derived
    /// with these settings offer no meaningful brute-force resistance.
    pub const FAST: Self = Self { n: 16, r: 8, p: 1 };
}

impl Default for ScryptOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The stored description of a passphrase-derived key: everything needed to
/// re-derive the key from the passphrase and verify the result, but nothing
/// that helps recover the key without the passphrase.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Parameters {
    pub salt: [u8; SALT_LEN],
    pub digest: [u8; DIGEST_LEN],
    pub n: u64,
    pub r: u64,
    pub p: u64,
}

impl Parameters {
    /// Fixed-layout serialization, exactly [`PARAMS_LEN`] bytes.
    pub fn marshal(&self) -> [u8; PARAMS_LEN] {
        let mut buf = [0u8; PARAMS_LEN];
        buf[0..32].copy_from_slice(&self.salt);
        buf[32..64].copy_from_slice(&self.digest);
        buf[64..72].copy_from_slice(&self.n.to_le_bytes());
        buf[72..80].copy_from_slice(&self.r.to_le_bytes());
        buf[80..88].copy_from_slice(&self.p.to_le_bytes());
        buf
    }

    /// Inverse of [`Parameters::marshal`]. Rejects any input that is not
    /// exactly [`PARAMS_LEN`] bytes.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != PARAMS_LEN {
            return Err(Error::Malformed);
        }

        let mut salt = [0u8; SALT_LEN];
        let mut digest = [0u8; DIGEST_LEN];
        salt.copy_from_slice(&buf[0..32]);
        digest.copy_from_slice(&buf[32..64]);

        let le_u64 = |b: &[u8]| u64::from_le_bytes(b.try_into().unwrap());
        Ok(Self {
            salt,
            digest,
            n: le_u64(&buf[64..72]),
            r: le_u64(&buf[72..80]),
            p: le_u64(&buf[80..88]),
        })
    }
}

/// A secret key derived from a user passphrase with scrypt.
///
/// The key has two states:
///
/// - *derived*: the 32 key bytes are present and the key can seal / open.
/// - *cleared*: [`SecretKey::zero`] has scrubbed the key bytes. The stored
///   [`Parameters`] survive, so a later [`SecretKey::derive`] with the
///   correct passphrase restores the key. This is the at-rest state while
///   the wallet is locked.
pub struct SecretKey {
    key: WorkingKey,
    params: Parameters,
}

impl SecretKey {
    /// Derive a fresh secret key from `passphrase`, sampling a new salt and
    /// recording the verifier digest of the derived key.
    pub fn new<R: Crng>(
        rng: &mut R,
        passphrase: &[u8],
        opts: &ScryptOptions,
    ) -> Result<Self, Error> {
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);

        let raw = derive_raw(passphrase, &salt, opts.n, opts.r, opts.p)?;
        let digest: [u8; DIGEST_LEN] = Sha256::digest(&*raw).into();

        let mut key = WorkingKey::zeroed();
        key.copy_from(&raw);

        Ok(Self {
            key,
            params: Parameters { salt, digest, n: opts.n, r: opts.r, p: opts.p },
        })
    }

    /// Reconstruct a cleared secret key from stored parameters. The key is
    /// unusable until [`SecretKey::derive`] succeeds.
    pub fn from_params(params: Parameters) -> Self {
        Self { key: WorkingKey::zeroed(), params }
    }

    /// Unmarshal stored parameters and reconstruct a cleared secret key.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_params(Parameters::unmarshal(buf)?))
    }

    /// Re-derive the key bytes from `passphrase` and verify them against the
    /// stored digest, in constant time. On mismatch the recomputed bytes are
    /// scrubbed and [`Error::InvalidPassword`] is returned; the key stays in
    /// the cleared state.
    pub fn derive(&mut self, passphrase: &[u8]) -> Result<(), Error> {
        let p = &self.params;
        let raw = derive_raw(passphrase, &p.salt, p.n, p.r, p.p)?;

        let digest: [u8; DIGEST_LEN] = Sha256::digest(&*raw).into();
        if !bool::from(digest.ct_eq(&self.params.digest)) {
            // `raw` zeroizes on drop; make sure nothing of the bad derive
            // lingers in the key slot either.
            self.key.zero();
            return Err(Error::InvalidPassword);
        }

        self.key.copy_from(&raw);
        Ok(())
    }

    /// Seal `msg` under the derived key.
    pub fn encrypt<R: Crng>(&self, rng: &mut R, msg: &[u8]) -> Vec<u8> {
        self.key.seal(rng, msg)
    }

    /// Open a blob sealed under the derived key.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        self.key.open(blob)
    }

    /// The stored derivation parameters.
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Marshaled derivation parameters, for persistence.
    pub fn marshal(&self) -> [u8; PARAMS_LEN] {
        self.params.marshal()
    }

    /// Scrub the derived key bytes, keeping the parameters so the key can be
    /// re-derived later. Called on every lock path.
    pub fn zero(&mut self) {
        self.key.zero();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Avoid formatting secrets; the cost settings are all that is worth
        // seeing in logs.
        write!(
            f,
            "SecretKey(n={}, r={}, p={})",
            self.params.n, self.params.r, self.params.p
        )
    }
}

fn derive_raw(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    n: u64,
    r: u64,
    p: u64,
) -> Result<Zeroizing<[u8; working_key::KEY_LEN]>, Error> {
    // The scrypt crate takes log2(N); reject costs it cannot express.
    if !n.is_power_of_two() || n < 2 || r == 0 || p == 0 {
        return Err(Error::Malformed);
    }
    let log_n = n.trailing_zeros() as u8;
    let r = u32::try_from(r).map_err(|_| Error::Malformed)?;
    let p = u32::try_from(p).map_err(|_| Error::Malformed)?;
    let params = scrypt::Params::new(log_n, r, p, working_key::KEY_LEN)
        .map_err(|_| Error::Malformed)?;

    let mut out = Zeroizing::new([0u8; working_key::KEY_LEN]);
    scrypt::scrypt(passphrase, salt.as_slice(), &params, &mut *out)
        .map_err(|_| Error::Malformed)?;
    Ok(out)
}
