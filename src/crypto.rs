//! Symmetric primitives shared by the handshake and the command channel.
//!
//! Everything runs AES-128-CBC with a zero IV, which is what deployed agents
//! expect. The "integrity" flavour appends a SHA-1 tag over the plaintext
//! before encryption and verifies it after decryption.

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{Rng, RngCore};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;
pub const DIGEST_SIZE: usize = 20;

const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

pub type Key = [u8; KEY_SIZE];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext length {0} is not block aligned")]
    Unaligned(usize),

    #[error("invalid padding")]
    Unpad,

    #[error("integrity tag mismatch")]
    IntegrityMismatch,

    #[error("plaintext too short for integrity tag")]
    TooShort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Pkcs7,
    /// Legacy agents pad on their own, sometimes incorrectly.
    None,
}

/// Attempt order for command frames: standard first, then the legacy mode.
pub const COMMAND_PADDINGS: [Padding; 2] = [Padding::Pkcs7, Padding::None];

pub fn encrypt(plaintext: &[u8], key: &Key, padding: Padding) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128CbcEnc::new(key.into(), &ZERO_IV.into());
    match padding {
        Padding::Pkcs7 => Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        Padding::None => {
            if plaintext.len() % BLOCK_SIZE != 0 {
                return Err(CryptoError::Unaligned(plaintext.len()));
            }
            Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext))
        }
    }
}

pub fn decrypt(ciphertext: &[u8], key: &Key, padding: Padding) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Unaligned(ciphertext.len()));
    }
    let cipher = Aes128CbcDec::new(key.into(), &ZERO_IV.into());
    match padding {
        Padding::Pkcs7 => cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Unpad),
        Padding::None => cipher
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CryptoError::Unpad),
    }
}

/// `plaintext ‖ SHA1(plaintext)` encrypted with PKCS7 padding.
pub fn encrypt_integrity(plaintext: &[u8], key: &Key) -> Vec<u8> {
    let mut buf = Vec::with_capacity(plaintext.len() + DIGEST_SIZE);
    buf.extend_from_slice(plaintext);
    buf.extend_from_slice(&sha1(&[plaintext]));
    let cipher = Aes128CbcEnc::new(key.into(), &ZERO_IV.into());
    cipher.encrypt_padded_vec_mut::<Pkcs7>(&buf)
}

pub fn decrypt_integrity(
    ciphertext: &[u8],
    key: &Key,
    padding: Padding,
) -> Result<Vec<u8>, CryptoError> {
    let mut plain = decrypt(ciphertext, key, padding)?;
    if plain.len() < DIGEST_SIZE {
        return Err(CryptoError::TooShort);
    }
    let tag = plain.split_off(plain.len() - DIGEST_SIZE);
    if !digest_eq(&sha1(&[&plain]), &tag) {
        return Err(CryptoError::IntegrityMismatch);
    }
    Ok(plain)
}

/// Tries each padding mode in order and returns the first verified plaintext.
pub fn decrypt_integrity_with(ciphertext: &[u8], key: &Key, order: &[Padding]) -> Option<Vec<u8>> {
    order
        .iter()
        .find_map(|padding| decrypt_integrity(ciphertext, key, *padding).ok())
}

pub fn sha1(parts: &[&[u8]]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// First 16 bytes of the SHA-1 over the concatenated parts.
pub fn derive_key(parts: &[&[u8]]) -> Key {
    let digest = sha1(parts);
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}

pub fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Drops the trailing random bytes agents append to hide the frame size.
pub fn normalize(data: &[u8]) -> &[u8] {
    &data[..data.len() - data.len() % BLOCK_SIZE]
}

pub fn has_trailing_pad(data: &[u8]) -> bool {
    data.len() % BLOCK_SIZE != 0
}

pub fn random_key() -> Key {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Between 1 and 15 random bytes, so the result never re-aligns a frame.
pub fn random_pad() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(1..BLOCK_SIZE);
    let mut pad = vec![0u8; len];
    rng.fill_bytes(&mut pad);
    pad
}
