//! Keyed HMAC-SHA256 signing shared by the state store and the audit log.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex signature of an empty chain head.
pub const ZERO_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Signer over canonical byte encodings, keyed by the audit secret.
#[derive(Clone)]
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Compute the hex HMAC-SHA256 signature of `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a hex signature in constant time.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        let Ok(expected) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(message);
        mac.verify_slice(&expected).is_ok()
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").field("key", &"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = HmacSigner::new(b"0123456789abcdef0123456789abcdef".to_vec());
        let sig = signer.sign(b"payload");

        assert_eq!(sig.len(), 64);
        assert!(signer.verify(b"payload", &sig));
        assert!(!signer.verify(b"tampered", &sig));
    }

    #[test]
    fn test_different_keys_disagree() {
        let a = HmacSigner::new(b"a".repeat(32));
        let b = HmacSigner::new(b"b".repeat(32));

        let sig = a.sign(b"payload");
        assert!(!b.verify(b"payload", &sig));
    }

    #[test]
    fn test_rejects_malformed_signature() {
        let signer = HmacSigner::new(b"k".repeat(32));
        assert!(!signer.verify(b"payload", "not-hex"));
        assert!(!signer.verify(b"payload", ""));
    }

    #[test]
    fn test_debug_redacts_key() {
        let signer = HmacSigner::new(b"super-secret-key-material-abcdef".to_vec());
        let rendered = format!("{signer:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
