use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("ciphertext malformed")]
    Malformed,
    #[error("decrypt failed")]
    Decrypt,
    #[error("encrypt failed")]
    Encrypt,
}

const NONCE_LEN: usize = 12;

/// Symmetric secret protection for key material at rest. The AEAD key is
/// derived from the operator's master key; fingerprints are keyless so they
/// stay stable across master-key rotation.
pub struct Cipher {
    aead: ChaCha20Poly1305,
}

impl Cipher {
    pub fn new(master_key: &str) -> Self {
        let derived = blake3::hash(master_key.as_bytes());
        let aead = ChaCha20Poly1305::new(Key::from_slice(derived.as_bytes()));
        Self { aead }
    }

    /// base64(nonce ‖ ciphertext)
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;
        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CipherError> {
        let payload = BASE64.decode(encoded).map_err(|_| CipherError::Malformed)?;
        if payload.len() <= NONCE_LEN {
            return Err(CipherError::Malformed);
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let plain = self
            .aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| CipherError::Decrypt)
    }
}

/// Stable hex fingerprint of a secret, used for dedup and index lookups
/// without ever comparing plaintext in queries.
pub fn fingerprint(value: &str) -> String {
    blake3::hash(value.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cipher = Cipher::new("master");
        let sealed = cipher.encrypt("sk-secret").unwrap();
        assert_ne!(sealed, "sk-secret");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "sk-secret");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let cipher = Cipher::new("master");
        let a = cipher.encrypt("sk-secret").unwrap();
        let b = cipher.encrypt("sk-secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = Cipher::new("one").encrypt("sk-secret").unwrap();
        assert!(Cipher::new("two").decrypt(&sealed).is_err());
    }

    #[test]
    fn tampering_is_detected() {
        let cipher = Cipher::new("master");
        let sealed = cipher.encrypt("sk-secret").unwrap();
        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);
        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_keyless() {
        assert_eq!(fingerprint("sk-a"), fingerprint("sk-a"));
        assert_ne!(fingerprint("sk-a"), fingerprint("sk-b"));
    }
}
