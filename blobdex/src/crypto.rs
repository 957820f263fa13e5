//! Hashing, key derivation and object sealing.
//!
//! Object IDs are BLAKE2b digests of plaintext. Stored objects are
//! sealed with ChaCha20-Poly1305 under a random nonce that travels in
//! front of the ciphertext:
//!
//! ```text
//! | nonce (12) | ciphertext (n) | tag (16) |
//! ```
use crate::id::ObjectId;

use blake2b_simd::blake2bp::Params as Blake2;
use ring::aead;
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;
use zeroize::Zeroize;

const CRYPTO_DIGEST_SIZE: usize = 32;
const NONCE_SIZE: usize = aead::NONCE_LEN;
const TAG_SIZE: usize = 16;

type Nonce = [u8; NONCE_SIZE];
type RawKey = Secret<[u8; CRYPTO_DIGEST_SIZE]>;

pub type Digest = [u8; CRYPTO_DIGEST_SIZE];

/// Bytes added to every sealed object.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key error: {source}")]
    KeyError {
        #[from]
        source: argon2::Error,
    },
    #[error("Random source failed: {source}")]
    Random {
        #[from]
        source: getrandom::Error,
    },
    #[error("Sealed object is too short: {size} bytes")]
    Truncated { size: usize },
    #[error("Sealing failed")]
    Seal,
    #[error("Ciphertext failed authentication")]
    Unauthenticated,
}
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Opaque seal/open transform applied around every stored object.
///
/// The index layer never sees ciphertext; implementations are used
/// by [`Sealed`](crate::backends::Sealed).
pub trait CryptoProvider: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Master key of a repository.
pub struct Key {
    master_key: RawKey,
}

#[derive(Clone)]
pub struct SealKey {
    key: RawKey,
}

#[inline]
pub fn secure_hash(content: &[u8]) -> Digest {
    let mut output = Digest::default();

    output.copy_from_slice(
        Blake2::new()
            .hash_length(CRYPTO_DIGEST_SIZE)
            .hash(content)
            .as_bytes(),
    );

    output
}

impl Key {
    pub fn from_credentials(username: impl AsRef<str>, password: impl AsRef<str>) -> Result<Key> {
        derive_argon2(username.as_ref().as_bytes(), password.as_ref().as_bytes())
            .map(|k| Key { master_key: k })
    }

    pub fn from_bytes(raw: [u8; CRYPTO_DIGEST_SIZE]) -> Key {
        Key {
            master_key: Secret::new(raw),
        }
    }

    /// Stable, non-secret identifier of the repository this key opens.
    ///
    /// Used to name the local cache directory.
    pub fn repository_id(&self) -> ObjectId {
        ObjectId::from_digest(*derive_subkey(&self.master_key, b"_bd_repo").expose_secret())
    }

    pub fn seal_key(&self) -> SealKey {
        SealKey::new(derive_subkey(&self.master_key, b"_bd_seal"))
    }
}

impl SealKey {
    pub fn new(key: RawKey) -> SealKey {
        SealKey { key }
    }

    fn aead(&self) -> Result<aead::LessSafeKey> {
        let key = aead::UnboundKey::new(&aead::CHACHA20_POLY1305, self.key.expose_secret())
            .map_err(|_| CryptoError::Seal)?;
        Ok(aead::LessSafeKey::new(key))
    }
}

impl CryptoProvider for SealKey {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Nonce::default();
        getrandom::getrandom(&mut nonce)?;

        let mut sealed = Vec::with_capacity(plaintext.len() + SEAL_OVERHEAD);
        sealed.extend_from_slice(&nonce);

        let mut in_out = plaintext.to_vec();
        self.aead()?
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CryptoError::Seal)?;

        sealed.extend_from_slice(&in_out);
        in_out.zeroize();

        Ok(sealed)
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated {
                size: ciphertext.len(),
            });
        }

        let mut nonce = Nonce::default();
        nonce.copy_from_slice(&ciphertext[..NONCE_SIZE]);

        let mut buffer = ciphertext[NONCE_SIZE..].to_vec();
        let len = self
            .aead()?
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Unauthenticated)?
            .len();

        buffer.truncate(len);
        Ok(buffer)
    }
}

fn derive_argon2(salt_raw: &[u8], password: &[u8]) -> Result<RawKey> {
    let salt = Blake2::new().hash_length(16).hash(salt_raw);

    let mut result = argon2::hash_raw(
        password,
        salt.as_bytes(),
        &argon2::Config {
            hash_length: CRYPTO_DIGEST_SIZE as u32,
            variant: argon2::Variant::Argon2id,
            ..argon2::Config::default()
        },
    )?;

    let mut outbuf = [0; CRYPTO_DIGEST_SIZE];
    outbuf.copy_from_slice(&result);
    result.zeroize();

    Ok(Secret::new(outbuf))
}

fn derive_subkey(key: &RawKey, ctx: &[u8]) -> RawKey {
    let mut outbuf = [0; CRYPTO_DIGEST_SIZE];
    outbuf.copy_from_slice(
        Blake2::new()
            .hash_length(CRYPTO_DIGEST_SIZE)
            .key(ctx)
            .hash(key.expose_secret())
            .as_bytes(),
    );

    Secret::new(outbuf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SealKey {
        Key::from_bytes(*b"abcdef1234567890abcdef1234567890").seal_key()
    }

    #[test]
    fn seal_then_open() {
        let crypto = key();
        let cleartext = b"the quick brown fox jumps over the lazy crab";

        let sealed = crypto.seal(cleartext).unwrap();
        assert_eq!(sealed.len(), cleartext.len() + SEAL_OVERHEAD);
        assert_ne!(&sealed[NONCE_SIZE..NONCE_SIZE + cleartext.len()], &cleartext[..]);

        assert_eq!(crypto.open(&sealed).unwrap(), cleartext);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let crypto = key();
        let mut sealed = crypto.seal(b"index contents").unwrap();
        sealed[NONCE_SIZE + 2] ^= 0xff;

        assert!(matches!(
            crypto.open(&sealed),
            Err(CryptoError::Unauthenticated)
        ));
        assert!(matches!(
            crypto.open(&sealed[..4]),
            Err(CryptoError::Truncated { size: 4 })
        ));
    }

    #[test]
    fn subkeys_are_distinct() {
        let master = Key::from_bytes(*b"abcdef1234567890abcdef1234567890");
        let other = Key::from_bytes(*b"0000001234567890abcdef1234567890");

        assert_ne!(master.repository_id(), other.repository_id());

        let sealed = master.seal_key().seal(b"data").unwrap();
        assert!(other.seal_key().open(&sealed).is_err());
    }

    #[test]
    fn credentials_derive_the_same_key() {
        let a = Key::from_credentials("user", "hunter2").unwrap();
        let b = Key::from_credentials("user", "hunter2").unwrap();

        assert_eq!(a.repository_id(), b.repository_id());
    }
}
