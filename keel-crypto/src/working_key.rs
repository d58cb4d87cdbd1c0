//! The 32-byte symmetric working key sealing everything the wallet persists.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use zeroize::{Zeroize, Zeroizing};

use crate::{error::Error, rng::Crng};

/// Byte length of a [`WorkingKey`].
pub const KEY_LEN: usize = 32;

/// Byte length of the nonce prepended to every sealed blob.
pub const NONCE_LEN: usize = 24;

/// Byte length of the AEAD authentication tag.
pub const TAG_LEN: usize = 16;

/// Total ciphertext expansion of [`WorkingKey::seal`]: nonce + tag.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// A 32-byte symmetric key which seals / opens arbitrary byte strings with
/// XChaCha20-Poly1305. Each seal samples a fresh random 24-byte nonce and
/// prepends it to the ciphertext, so the output layout is:
///
/// ```text
/// [nonce (24)] || [ciphertext] || [tag (16)]
/// ```
///
/// The key bytes are overwritten when the value is dropped.
pub struct WorkingKey([u8; KEY_LEN]);

impl WorkingKey {
    /// Sample a fresh random working key.
    pub fn generate<R: Crng>(rng: &mut R) -> Self {
        let mut key = [0u8; KEY_LEN];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    /// Rebuild a working key from bytes previously obtained with
    /// [`WorkingKey::as_bytes`], e.g. after opening a sealed copy read from
    /// the database. Fails with [`Error::Malformed`] on any other length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let key: [u8; KEY_LEN] =
            bytes.try_into().map_err(|_| Error::Malformed)?;
        Ok(Self(key))
    }

    /// The raw key bytes. Callers seal these under another key before they
    /// are allowed anywhere near persistent storage.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Seal `msg` under this key with a freshly sampled nonce.
    pub fn seal<R: Crng>(&self, rng: &mut R, msg: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), msg)
            .expect("XChaCha20-Poly1305 sealing cannot fail");

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        blob
    }

    /// Open a blob produced by [`WorkingKey::seal`]. The plaintext comes
    /// back in a [`Zeroizing`] buffer so transient copies of key material
    /// are scrubbed when the caller is done with them.
    pub fn open(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        if blob.len() < NONCE_LEN {
            return Err(Error::Malformed);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::DecryptFailed)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Overwrite the key bytes. The key is unusable afterwards; this exists
    /// for lock paths that must scrub material before the value is dropped.
    pub fn zero(&mut self) {
        self.0.zeroize();
    }

    pub(crate) fn zeroed() -> Self {
        Self([0u8; KEY_LEN])
    }

    pub(crate) fn copy_from(&mut self, bytes: &[u8; KEY_LEN]) {
        self.0.copy_from_slice(bytes);
    }
}

impl Drop for WorkingKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for WorkingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Avoid formatting secrets.
        f.write_str("WorkingKey(..)")
    }
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, collection::vec, proptest};

    use super::*;
    use crate::rng::WeakRng;

    #[test]
    fn seal_open_roundtrip() {
        proptest!(|(
            seed in any::<u64>(),
            msg in vec(any::<u8>(), 0..=256),
        )| {
            let mut rng = WeakRng::from_u64(seed);
            let key = WorkingKey::generate(&mut rng);

            let blob = key.seal(&mut rng, &msg);
            assert_eq!(blob.len(), msg.len() + SEAL_OVERHEAD);

            let opened = key.open(&blob).unwrap();
            assert_eq!(&msg, &*opened);
        });
    }

    #[test]
    fn open_rejects_short_blob() {
        let key = WorkingKey::from_bytes(&[0x42; KEY_LEN]).unwrap();
        assert!(matches!(key.open(&[0u8; 23]), Err(Error::Malformed)));
    }

    #[test]
    fn open_rejects_tampered_blob() {
        let mut rng = WeakRng::from_u64(7);
        let key = WorkingKey::generate(&mut rng);

        let mut blob = key.seal(&mut rng, b"attack at dawn");
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        assert!(matches!(key.open(&blob), Err(Error::DecryptFailed)));
    }

    #[test]
    fn open_rejects_wrong_key() {
        let mut rng = WeakRng::from_u64(8);
        let key1 = WorkingKey::generate(&mut rng);
        let key2 = WorkingKey::generate(&mut rng);

        let blob = key1.seal(&mut rng, b"attack at dawn");
        assert!(matches!(key2.open(&blob), Err(Error::DecryptFailed)));
    }

    #[test]
    fn fresh_nonce_every_seal() {
        let mut rng = WeakRng::from_u64(9);
        let key = WorkingKey::generate(&mut rng);

        let blob1 = key.seal(&mut rng, b"same message");
        let blob2 = key.seal(&mut rng, b"same message");
        assert_ne!(blob1, blob2);
    }

    #[test]
    fn zero_clears_key_bytes() {
        let mut key = WorkingKey::from_bytes(&[0x42; KEY_LEN]).unwrap();
        key.zero();
        assert_eq!(key.as_bytes(), &[0u8; KEY_LEN]);
    }
}
