//! Field-level encryption for stored profile data.
//!
//! `full_name_enc` and `email_enc` are AES-256-CBC ciphertexts with the
//! 16-byte IV prepended. The key is scrypt-derived from an environment
//! secret with the fixed salt "salt". This mirrors the deployed data
//! layout; it is not authenticated encryption.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{anyhow, Context, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;
const FIXED_SALT: &[u8] = b"salt";

#[derive(Clone)]
pub struct FieldCipher {
    key: [u8; KEY_LEN],
}

impl FieldCipher {
    /// Derive the field key from the deployment secret.
    pub fn new(secret: &str) -> Result<Self> {
        // N=16384, r=8, p=1 matches the scrypt defaults the stored data
        // was produced with.
        let params = scrypt::Params::new(14, 8, 1, KEY_LEN).context("scrypt parameters")?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(secret.as_bytes(), FIXED_SALT, &params, &mut key)
            .map_err(|e| anyhow!("scrypt derivation failed: {e}"))?;
        Ok(Self { key })
    }

    /// Encrypt a field value; output is `iv || ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> Vec<u8> {
        let iv: [u8; IV_LEN] = rand::random();
        let cipher = Aes256CbcEnc::new(&self.key.into(), &iv.into());
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt an `iv || ciphertext` field value.
    pub fn decrypt(&self, data: &[u8]) -> Result<String> {
        if data.len() < IV_LEN {
            return Err(anyhow!("ciphertext shorter than IV"));
        }
        let (iv, ciphertext) = data.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().expect("split length");
        let cipher = Aes256CbcDec::new(&self.key.into(), &iv.into());
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| anyhow!("field decryption failed: {e}"))?;
        String::from_utf8(plaintext).context("decrypted field is not UTF-8")
    }
}
