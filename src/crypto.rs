use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

const ENVELOPE_PREFIX: &str = "v1:";
const KEY_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption key must be {KEY_BYTES} bytes of hex")]
    InvalidKey,
    #[error("unsupported or malformed ciphertext envelope")]
    MalformedEnvelope,
    #[error("failed to encrypt value")]
    Seal,
    #[error("failed to decrypt value")]
    Open,
}

#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_BYTES],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn from_hex(raw: &str) -> Result<Self, CipherError> {
        let decoded = hex::decode(raw.trim()).map_err(|_| CipherError::InvalidKey)?;
        let key: [u8; KEY_BYTES] = decoded.try_into().map_err(|_| CipherError::InvalidKey)?;
        Ok(Self { key })
    }

    fn sealing_key(&self) -> Result<LessSafeKey, CipherError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CipherError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let key = self.sealing_key()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| CipherError::Seal)?;

        let mut buffer = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut buffer,
        )
        .map_err(|_| CipherError::Seal)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + buffer.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&buffer);
        Ok(format!("{ENVELOPE_PREFIX}{}", hex::encode(envelope)))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<String, CipherError> {
        let encoded = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(CipherError::MalformedEnvelope)?;
        let raw = hex::decode(encoded).map_err(|_| CipherError::MalformedEnvelope)?;
        if raw.len() <= NONCE_LEN {
            return Err(CipherError::MalformedEnvelope);
        }

        let (nonce_part, sealed) = raw.split_at(NONCE_LEN);
        let nonce_bytes: [u8; NONCE_LEN] = nonce_part
            .try_into()
            .map_err(|_| CipherError::MalformedEnvelope)?;
        let mut sealed = sealed.to_vec();

        let key = self.sealing_key()?;
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| CipherError::Open)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CipherError::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn sealed_values_open_with_the_same_key() {
        let cipher = TokenCipher::from_hex(KEY).unwrap();
        let sealed = cipher.encrypt("ya29.a0AfH6SMBx").unwrap();
        assert!(sealed.starts_with("v1:"));
        assert!(!sealed.contains("ya29"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "ya29.a0AfH6SMBx");
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let cipher = TokenCipher::from_hex(KEY).unwrap();
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let cipher = TokenCipher::from_hex(KEY).unwrap();
        let other = TokenCipher::from_hex(&"ff".repeat(32)).unwrap();
        let sealed = cipher.encrypt("secret").unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(CipherError::Open)));
    }

    #[test]
    fn rejects_short_keys_and_plain_strings() {
        assert!(matches!(
            TokenCipher::from_hex("abcd"),
            Err(CipherError::InvalidKey)
        ));
        let cipher = TokenCipher::from_hex(KEY).unwrap();
        assert!(matches!(
            cipher.decrypt("plain-token"),
            Err(CipherError::MalformedEnvelope)
        ));
    }
}
