use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{ Hmac, Mac };
use log::warn;
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;

/// Symmetric encryption for provider API keys at rest. The keystream is
/// HMAC-SHA256 over a per-ciphertext random nonce and a block counter,
/// XORed with the plaintext; wire form is base64(nonce || ciphertext).
#[derive(Clone)]
pub struct Vault {
    key: String,
}

impl Vault {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let nonce_hex = Uuid::new_v4().simple().to_string();
        let nonce = &nonce_hex.as_bytes()[..NONCE_LEN];

        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&self.apply_keystream(nonce, plaintext.as_bytes()));
        BASE64.encode(out)
    }

    /// Decrypt an encrypted API key. Returns the input unchanged if it is
    /// not a valid ciphertext, so a config carrying a plaintext key keeps
    /// working instead of breaking the request.
    pub fn decrypt(&self, ciphertext: &str) -> String {
        match self.try_decrypt(ciphertext) {
            Some(plain) => plain,
            None => {
                warn!("Vault: value is not a valid ciphertext, using it as-is");
                ciphertext.to_string()
            }
        }
    }

    fn try_decrypt(&self, ciphertext: &str) -> Option<String> {
        let raw = BASE64.decode(ciphertext).ok()?;
        if raw.len() < NONCE_LEN {
            return None;
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plain = self.apply_keystream(nonce, body);
        String::from_utf8(plain).ok()
    }

    fn apply_keystream(&self, nonce: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut counter: u64 = 0;

        for block in data.chunks(32) {
            let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
                .expect("HMAC accepts any key length");
            mac.update(nonce);
            mac.update(&counter.to_be_bytes());
            let keystream = mac.finalize().into_bytes();

            for (byte, pad) in block.iter().zip(keystream.iter()) {
                out.push(byte ^ pad);
            }
            counter += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let vault = Vault::new("unit-test-key");
        let secret = "sk-abcdef0123456789-with-a-tail-longer-than-one-block";
        let encrypted = vault.encrypt(secret);
        assert_ne!(encrypted, secret);
        assert_eq!(vault.decrypt(&encrypted), secret);
    }

    #[test]
    fn nonce_makes_ciphertexts_distinct() {
        let vault = Vault::new("unit-test-key");
        assert_ne!(vault.encrypt("same"), vault.encrypt("same"));
    }

    #[test]
    fn invalid_ciphertext_passes_through() {
        let vault = Vault::new("unit-test-key");
        assert_eq!(vault.decrypt("sk-plaintext-key"), "sk-plaintext-key");
        assert_eq!(vault.decrypt(""), "");
    }

    #[test]
    fn wrong_key_does_not_panic() {
        let vault = Vault::new("key-a");
        let other = Vault::new("key-b");
        let encrypted = vault.encrypt("secret");
        // Either garbage-as-utf8 or passthrough; must not panic.
        let _ = other.decrypt(&encrypted);
    }
}
