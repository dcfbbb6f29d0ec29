use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use super::ports::Crypto;

const PBKDF2_ROUNDS: u32 = 100_000;
const KDF_SALT: &[u8] = b"wa-agent-salt";
const NONCE_LEN: usize = 12;
const ENVELOPE_PREFIX: &str = "v1";

/// AES-256-GCM envelope encryption for `WaSession::gateway_api_key` and
/// HMAC-SHA256 signature verification for `/webhooks/gateway/{sessionId}`.
/// Envelope format: `v1:{base64(iv-12B)}:{base64(ciphertext+tag)}`.
pub struct AesGcmCrypto {
    key: [u8; 32],
}

impl AesGcmCrypto {
    pub fn new(secret: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, PBKDF2_ROUNDS, &mut key);
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.key).expect("key is exactly 32 bytes")
    }
}

impl Crypto for AesGcmCrypto {
    fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        let mut iv_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv_bytes);
        let nonce = Nonce::from_slice(&iv_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        Ok(format!(
            "{ENVELOPE_PREFIX}:{}:{}",
            BASE64.encode(iv_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    fn decrypt(&self, envelope: &str) -> anyhow::Result<String> {
        let mut parts = envelope.splitn(3, ':');
        let (Some(version), Some(iv_b64), Some(ct_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("malformed encryption envelope");
        };
        if version != ENVELOPE_PREFIX {
            anyhow::bail!("unsupported envelope version: {version}");
        }

        let iv_bytes = BASE64
            .decode(iv_b64)
            .map_err(|e| anyhow::anyhow!("invalid iv encoding: {e}"))?;
        let ciphertext = BASE64
            .decode(ct_b64)
            .map_err(|e| anyhow::anyhow!("invalid ciphertext encoding: {e}"))?;
        if iv_bytes.len() != NONCE_LEN {
            anyhow::bail!("invalid iv length");
        }
        let nonce = Nonce::from_slice(&iv_bytes);

        let plaintext = self
            .cipher()
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;
        String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("decrypted payload not utf8: {e}"))
    }

    fn verify_webhook_signature(
        &self,
        secret: &str,
        timestamp: &str,
        body: &[u8],
        signature_hex: &str,
    ) -> bool {
        let Ok(expected) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.as_bytes());
        mac.update(b"\n");
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_encrypt_decrypt() {
        let crypto = AesGcmCrypto::new("test-secret");
        let envelope = crypto.encrypt("sk-live-secret").unwrap();
        assert!(envelope.starts_with("v1:"));
        assert_ne!(envelope, "sk-live-secret");
        assert_eq!(crypto.decrypt(&envelope).unwrap(), "sk-live-secret");
    }

    #[test]
    fn each_encryption_uses_a_fresh_iv() {
        let crypto = AesGcmCrypto::new("test-secret");
        let a = crypto.encrypt("same plaintext").unwrap();
        let b = crypto.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_envelope_with_wrong_version() {
        let crypto = AesGcmCrypto::new("test-secret");
        assert!(crypto.decrypt("v2:aa:bb").is_err());
    }

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(b"\n");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn verifies_valid_signature() {
        let crypto = AesGcmCrypto::new("unused");
        let secret = "webhook-secret";
        let body = b"{\"event\":\"message\"}";
        let timestamp = "1700000000";
        let sig = sign(secret, timestamp, body);
        assert!(crypto.verify_webhook_signature(secret, timestamp, body, &sig));
    }

    #[test]
    fn rejects_tampered_body() {
        let crypto = AesGcmCrypto::new("unused");
        let secret = "webhook-secret";
        let sig = sign(secret, "1700000000", b"original");
        assert!(!crypto.verify_webhook_signature(secret, "1700000000", b"tampered", &sig));
    }

    #[test]
    fn rejects_mismatched_timestamp() {
        let crypto = AesGcmCrypto::new("unused");
        let secret = "webhook-secret";
        let body = b"payload";
        let sig = sign(secret, "1700000000", body);
        assert!(!crypto.verify_webhook_signature(secret, "1700000001", body, &sig));
    }

    #[test]
    fn rejects_invalid_hex() {
        let crypto = AesGcmCrypto::new("unused");
        assert!(!crypto.verify_webhook_signature("s", "1700000000", b"body", "not-hex!"));
    }
}
