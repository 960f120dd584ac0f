use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit};
use crypto_common::typenum::Unsigned;
use crypto_common::{IvSizeUser, KeySizeUser, OutputSizeUser};
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::error::CoreError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_SIZE: usize = <<aes::Aes128 as KeySizeUser>::KeySize as Unsigned>::USIZE;
pub const IV_SIZE: usize = <<Aes128CbcEnc as IvSizeUser>::IvSize as Unsigned>::USIZE;
pub const MAC_SIZE: usize = <<HmacSha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;
pub const BLOCK_SIZE: usize = <<aes::Aes128 as BlockSizeUser>::BlockSize as Unsigned>::USIZE;

/// Fixed per-token overhead: leading IV plus trailing HMAC tag.
pub const TOKEN_OVERHEAD: usize = IV_SIZE + MAC_SIZE;
/// PKCS#7 always pads, so a full extra block is the worst case.
pub const MAX_PADDING: usize = BLOCK_SIZE;

/// Authenticated symmetric envelope modelled on the Fernet spec, with the
/// version and timestamp fields removed: they add overhead and leak initiator
/// metadata, and nothing in the protocol needs them. A token is
/// `IV ‖ AES-128-CBC(PKCS#7 plaintext) ‖ HMAC-SHA256(IV ‖ ciphertext)`.
pub struct Fernet {
    sign_key: [u8; KEY_SIZE],
    enc_key: [u8; KEY_SIZE],
}

/// Token length for a given plaintext length.
pub const fn token_len(plain_len: usize) -> usize {
    TOKEN_OVERHEAD + (plain_len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

impl Fernet {
    /// Splits a 32-byte derived key into signing and encryption halves,
    /// signing key first.
    pub fn from_derived_key(key: &[u8; KEY_SIZE * 2]) -> Self {
        let mut sign_key = [0u8; KEY_SIZE];
        let mut enc_key = [0u8; KEY_SIZE];
        sign_key.copy_from_slice(&key[..KEY_SIZE]);
        enc_key.copy_from_slice(&key[KEY_SIZE..]);
        Self { sign_key, enc_key }
    }

    pub fn new(sign_key: [u8; KEY_SIZE], enc_key: [u8; KEY_SIZE]) -> Self {
        Self { sign_key, enc_key }
    }

    pub fn encrypt<'a, R: CryptoRngCore>(
        &self,
        mut rng: R,
        plain: &[u8],
        out: &'a mut [u8],
    ) -> Result<&'a [u8], CoreError> {
        let padded_len = (plain.len() / BLOCK_SIZE + 1) * BLOCK_SIZE;
        if out.len() < TOKEN_OVERHEAD + padded_len {
            return Err(CoreError::BufferOverflow);
        }

        let mut iv = [0u8; IV_SIZE];
        rng.fill_bytes(&mut iv);
        out[..IV_SIZE].copy_from_slice(&iv);

        let cipher_len = Aes128CbcEnc::new(&self.enc_key.into(), &iv.into())
            .encrypt_padded_b2b_mut::<Pkcs7>(plain, &mut out[IV_SIZE..IV_SIZE + padded_len])
            .map_err(|_| CoreError::Crypto)?
            .len();

        let tag = self.mac(&out[..IV_SIZE + cipher_len])?;
        out[IV_SIZE + cipher_len..IV_SIZE + cipher_len + MAC_SIZE].copy_from_slice(&tag);

        Ok(&out[..IV_SIZE + cipher_len + MAC_SIZE])
    }

    /// Verifies the HMAC before any decryption is attempted.
    pub fn decrypt<'a>(&self, token: &[u8], out: &'a mut [u8]) -> Result<&'a [u8], CoreError> {
        if token.len() < TOKEN_OVERHEAD + BLOCK_SIZE
            || (token.len() - TOKEN_OVERHEAD) % BLOCK_SIZE != 0
        {
            return Err(CoreError::InvalidLength);
        }

        let (body, tag) = token.split_at(token.len() - MAC_SIZE);

        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.sign_key).map_err(|_| CoreError::Crypto)?;
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| CoreError::Crypto)?;

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&body[..IV_SIZE]);
        let cipher_text = &body[IV_SIZE..];

        if out.len() < cipher_text.len() {
            return Err(CoreError::BufferOverflow);
        }

        Aes128CbcDec::new(&self.enc_key.into(), &iv.into())
            .decrypt_padded_b2b_mut::<Pkcs7>(cipher_text, out)
            .map_err(|_| CoreError::Crypto)
    }

    /// Convenience wrappers for callers working with heap payloads.
    pub fn encrypt_to_vec<R: CryptoRngCore>(
        &self,
        rng: R,
        plain: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        let mut out = vec![0u8; token_len(plain.len())];
        let len = self.encrypt(rng, plain, &mut out)?.len();
        out.truncate(len);
        Ok(out)
    }

    pub fn decrypt_to_vec(&self, token: &[u8]) -> Result<Vec<u8>, CoreError> {
        let mut out = vec![0u8; token.len()];
        let len = self.decrypt(token, &mut out)?.len();
        out.truncate(len);
        Ok(out)
    }

    fn mac(&self, data: &[u8]) -> Result<[u8; MAC_SIZE], CoreError> {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.sign_key).map_err(|_| CoreError::Crypto)?;
        mac.update(data);
        let mut tag = [0u8; MAC_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{token_len, Fernet, KEY_SIZE, TOKEN_OVERHEAD};
    use crate::error::CoreError;

    fn test_fernet() -> Fernet {
        let mut key = [0u8; KEY_SIZE * 2];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Fernet::from_derived_key(&key)
    }

    #[test]
    fn roundtrip() {
        let fernet = test_fernet();
        let plain = b"attack at dawn";
        let token = fernet.encrypt_to_vec(OsRng, plain).expect("encrypt");
        assert_eq!(token.len(), token_len(plain.len()));
        let decrypted = fernet.decrypt_to_vec(&token).expect("decrypt");
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let fernet = test_fernet();
        let token = fernet.encrypt_to_vec(OsRng, b"").expect("encrypt");
        assert_eq!(token.len(), TOKEN_OVERHEAD + 16);
        assert_eq!(fernet.decrypt_to_vec(&token).expect("decrypt"), b"");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let fernet = test_fernet();
        let mut token = fernet.encrypt_to_vec(OsRng, b"integrity matters").expect("encrypt");
        let index = token.len() / 2;
        token[index] ^= 0x01;
        assert_eq!(fernet.decrypt_to_vec(&token), Err(CoreError::Crypto));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let fernet = test_fernet();
        let token = fernet.encrypt_to_vec(OsRng, b"secret").expect("encrypt");
        let other = Fernet::new([0xAA; KEY_SIZE], [0xBB; KEY_SIZE]);
        assert_eq!(other.decrypt_to_vec(&token), Err(CoreError::Crypto));
    }
}
