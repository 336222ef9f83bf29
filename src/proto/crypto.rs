// Packet encryption envelope
//
// Every encrypted packet is framed as: tag byte, 12-byte nonce, AEAD
// ciphertext. The configured label prefix, when present, is bound to the
// ciphertext as additional authenticated data. Decryption tries every
// installed key so clusters can rotate keys without a flag day.

use crate::error::{MeshError, Result};
use crate::proto::MessageType;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Ring of AEAD keys. The first key encrypts; all keys are tried for
/// decryption, newest first.
#[derive(Clone)]
pub struct Keyring {
    keys: Vec<Vec<u8>>,
}

impl Keyring {
    /// Build a keyring from a primary key and any number of rotation keys.
    /// Keys must be 16 bytes (AES-128-GCM) or 32 bytes (AES-256-GCM).
    pub fn new(primary: Vec<u8>, extra: Vec<Vec<u8>>) -> Result<Self> {
        let mut keys = Vec::with_capacity(1 + extra.len());
        keys.push(primary);
        keys.extend(extra);
        for key in &keys {
            if key.len() != 16 && key.len() != 32 {
                return Err(MeshError::Configuration(format!(
                    "encryption keys must be 16 or 32 bytes, got {}",
                    key.len()
                )));
            }
        }
        Ok(Self { keys })
    }

    /// Bytes of overhead the envelope adds to a plaintext.
    pub fn overhead() -> usize {
        1 + NONCE_LEN + TAG_LEN
    }

    /// Encrypt a message with the primary key. Returns the full envelope
    /// including the tag byte.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = seal(&self.keys[0], &nonce_bytes, plaintext, aad)?;

        let mut buf = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        buf.push(MessageType::Encrypt as u8);
        buf.extend_from_slice(&nonce_bytes);
        buf.extend_from_slice(&ciphertext);
        Ok(buf)
    }

    /// Decrypt an envelope by trial against every installed key. The caller
    /// has already consumed the tag byte.
    pub fn decrypt(&self, buf: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if buf.len() < NONCE_LEN + TAG_LEN {
            return Err(MeshError::Truncated);
        }
        let (nonce, ciphertext) = buf.split_at(NONCE_LEN);

        for key in &self.keys {
            if let Ok(plaintext) = open(key, nonce, ciphertext, aad) {
                return Ok(plaintext);
            }
        }
        Err(MeshError::DecryptFailed)
    }
}

fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let nonce = Nonce::from_slice(nonce);
    let out = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| MeshError::Configuration(e.to_string()))?
            .encrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| MeshError::Configuration(e.to_string()))?
            .encrypt(nonce, payload),
        _ => return Err(MeshError::Configuration("bad key length".into())),
    };
    out.map_err(|_| MeshError::DecryptFailed)
}

fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let nonce = Nonce::from_slice(nonce);
    let out = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| MeshError::Configuration(e.to_string()))?
            .decrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| MeshError::Configuration(e.to_string()))?
            .decrypt(nonce, payload),
        _ => return Err(MeshError::Configuration("bad key length".into())),
    };
    out.map_err(|_| MeshError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let ring = Keyring::new(vec![7u8; 32], Vec::new()).unwrap();
        let msg = b"gossip payload".to_vec();

        let sealed = ring.encrypt(&msg, b"").unwrap();
        assert_eq!(sealed[0], MessageType::Encrypt as u8);
        assert_eq!(ring.decrypt(&sealed[1..], b"").unwrap(), msg);
    }

    #[test]
    fn test_aes128_keys_work() {
        let ring = Keyring::new(vec![3u8; 16], Vec::new()).unwrap();
        let msg = b"short".to_vec();
        let sealed = ring.encrypt(&msg, b"").unwrap();
        assert_eq!(ring.decrypt(&sealed[1..], b"").unwrap(), msg);
    }

    #[test]
    fn test_rotation_key_decrypts() {
        let old = Keyring::new(vec![1u8; 32], Vec::new()).unwrap();
        let sealed = old.encrypt(b"from before the rotation", b"").unwrap();

        let new = Keyring::new(vec![2u8; 32], vec![vec![1u8; 32]]).unwrap();
        assert_eq!(
            new.decrypt(&sealed[1..], b"").unwrap(),
            b"from before the rotation"
        );
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let a = Keyring::new(vec![1u8; 32], Vec::new()).unwrap();
        let b = Keyring::new(vec![2u8; 32], Vec::new()).unwrap();

        let sealed = a.encrypt(b"secret", b"").unwrap();
        assert!(matches!(
            b.decrypt(&sealed[1..], b""),
            Err(MeshError::DecryptFailed)
        ));
    }

    #[test]
    fn test_aad_is_authenticated() {
        let ring = Keyring::new(vec![9u8; 32], Vec::new()).unwrap();
        let sealed = ring.encrypt(b"msg", b"label-a").unwrap();

        assert!(ring.decrypt(&sealed[1..], b"label-a").is_ok());
        assert!(matches!(
            ring.decrypt(&sealed[1..], b"label-b"),
            Err(MeshError::DecryptFailed)
        ));
    }

    #[test]
    fn test_rejects_bad_key_sizes() {
        assert!(Keyring::new(vec![0u8; 8], Vec::new()).is_err());
        assert!(Keyring::new(vec![0u8; 32], vec![vec![0u8; 9]]).is_err());
    }

    #[test]
    fn test_short_buffer_is_truncated() {
        let ring = Keyring::new(vec![7u8; 32], Vec::new()).unwrap();
        assert!(matches!(
            ring.decrypt(&[0u8; 4], b""),
            Err(MeshError::Truncated)
        ));
    }
}
