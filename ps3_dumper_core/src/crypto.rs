//! AES-128-CBC decryption of a single disc sector (spec §4.2).

use aes::{
    cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit},
    Aes128,
};

use crate::model::SECTOR_SIZE;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// Decrypts one sector's worth of ciphertext with `key` and the per-sector
/// `iv`. Pure: identical inputs always yield identical plaintext, and the
/// call never mutates shared state, so it is safe to run concurrently
/// across keys during key selection (spec §4.2, §5 point 1, §8 invariant 4).
pub fn decrypt_sector(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8; SECTOR_SIZE],
) -> [u8; SECTOR_SIZE] {
    let mut buf = *ciphertext;
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .expect("sector size is always a multiple of the AES block size");
    buf
}

/// Encrypts one sector's worth of plaintext with `key` and the per-sector
/// `iv`. The engine itself never writes to a disc; this exists so unit and
/// integration tests can build synthetic encrypted fixtures (`decrypt_sector`
/// undoes exactly what this does, by construction) without each test module
/// hand-rolling its own AES-CBC helper.
pub fn encrypt_sector(
    key: &[u8; 16],
    iv: &[u8; 16],
    plaintext: &[u8; SECTOR_SIZE],
) -> [u8; SECTOR_SIZE] {
    let mut buf = *plaintext;
    Aes128CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, SECTOR_SIZE)
        .expect("sector size is always a multiple of the AES block size");
    buf
}
