//! Authenticated encryption of session data into opaque tokens
//!
//! Token layout (URL-safe base64, no padding):
//!
//! ```text
//! [ nonce: 24 bytes ][ XChaCha20-Poly1305 ciphertext || 16-byte tag ]
//! ```
//!
//! The plaintext is the JSON encoding of the session map. The caller binds
//! the token to a context (the task id) through associated data.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::Sha256;

use super::SessionError;

/// XChaCha20 nonce length
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length
pub const TAG_LEN: usize = 16;

const KEY_LEN: usize = 32;

const HKDF_INFO: &[u8] = b"taskrelay session-data v1";

/// Process-wide cipher for session tokens
#[derive(Clone)]
pub struct SessionCipher {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}

impl SessionCipher {
    /// Derive the encryption key from the configured secret
    pub fn from_secret(secret: &str) -> Result<Self, SessionError> {
        if secret.is_empty() {
            return Err(SessionError::MissingKey);
        }
        let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());
        let mut key = [0u8; KEY_LEN];
        hkdf.expand(HKDF_INFO, &mut key).map_err(|_| SessionError::MissingKey)?;
        Ok(Self { key })
    }

    /// Encrypt `data` into a token bound to `context`
    pub fn seal(&self, data: &Map<String, Value>, context: &[u8]) -> Result<String, SessionError> {
        let plaintext = serde_json::to_vec(data)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let payload = Payload {
            msg: &plaintext,
            aad: context,
        };
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), payload)
            .map_err(|_| SessionError::Encryption)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    /// Verify and decrypt a token produced by [`SessionCipher::seal`] for the same `context`
    pub fn open(&self, token: &str, context: &[u8]) -> Result<Map<String, Value>, SessionError> {
        let raw = URL_SAFE_NO_PAD.decode(token)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(SessionError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let payload = Payload {
            msg: ciphertext,
            aad: context,
        };
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), payload)
            .map_err(|_| SessionError::Verification)?;

        match serde_json::from_slice(&plaintext)? {
            Value::Object(map) => Ok(map),
            _ => Err(SessionError::NotAnObject),
        }
    }
}

/// Generate a random secret suitable for `secret-key`
pub fn generate_secret() -> String {
    let mut bytes = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("f1".to_string(), json!("val1"));
        map.insert("f2".to_string(), json!(20));
        map
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = SessionCipher::from_secret("abc").unwrap();
        let token = cipher.seal(&sample(), b"i1").unwrap();
        assert_eq!(cipher.open(&token, b"i1").unwrap(), sample());
    }

    #[test]
    fn test_token_hides_plaintext() {
        let cipher = SessionCipher::from_secret("abc").unwrap();
        let token = cipher.seal(&sample(), b"i1").unwrap();
        assert!(!token.contains("val1"));
        assert!(!token.contains("f1"));
    }

    #[test]
    fn test_tokens_are_randomized() {
        let cipher = SessionCipher::from_secret("abc").unwrap();
        let a = cipher.seal(&sample(), b"i1").unwrap();
        let b = cipher.seal(&sample(), b"i1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let token = SessionCipher::from_secret("abc").unwrap().seal(&sample(), b"i1").unwrap();
        let other = SessionCipher::from_secret("abd").unwrap();
        assert!(matches!(other.open(&token, b"i1"), Err(SessionError::Verification)));
    }

    #[test]
    fn test_wrong_context_fails() {
        let cipher = SessionCipher::from_secret("abc").unwrap();
        let token = cipher.seal(&sample(), b"i1").unwrap();
        assert!(matches!(cipher.open(&token, b"i2"), Err(SessionError::Verification)));
    }

    #[test]
    fn test_truncated_token_fails() {
        let cipher = SessionCipher::from_secret("abc").unwrap();
        let token = cipher.seal(&sample(), b"i1").unwrap();
        assert!(cipher.open(&token[3..], b"i1").is_err());
        assert!(matches!(cipher.open("AAAA", b"i1"), Err(SessionError::Truncated)));
        assert!(matches!(cipher.open("not base64!", b"i1"), Err(SessionError::Encoding(_))));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(SessionCipher::from_secret(""), Err(SessionError::MissingKey)));
    }

    #[test]
    fn test_generate_secret() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        assert!(SessionCipher::from_secret(&a).is_ok());
    }

    #[test]
    fn test_debug_hides_key() {
        let cipher = SessionCipher::from_secret("abc").unwrap();
        assert_eq!(format!("{:?}", cipher), "SessionCipher { .. }");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<i64>().prop_map(Value::from),
                any::<bool>().prop_map(Value::from),
                "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
                Just(Value::Null),
            ]
        }

        fn arb_session() -> impl Strategy<Value = Map<String, Value>> {
            prop::collection::btree_map("#[a-z_]{1,8}", arb_value(), 0..6)
                .prop_map(|entries| entries.into_iter().collect())
        }

        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

        proptest! {
            #[test]
            fn seal_then_open_is_identity(session in arb_session(), task_id in "[a-z0-9]{1,12}") {
                let cipher = SessionCipher::from_secret("proptest-secret").unwrap();
                let token = cipher.seal(&session, task_id.as_bytes()).unwrap();
                prop_assert_eq!(cipher.open(&token, task_id.as_bytes()).unwrap(), session);
            }

            #[test]
            fn any_single_char_change_is_detected(session in arb_session(), index in any::<prop::sample::Index>(), shift in 1usize..64) {
                let cipher = SessionCipher::from_secret("proptest-secret").unwrap();
                let token = cipher.seal(&session, b"task").unwrap();

                let mut bytes = token.into_bytes();
                let i = index.index(bytes.len());
                let pos = ALPHABET.iter().position(|c| *c == bytes[i]).unwrap();
                bytes[i] = ALPHABET[(pos + shift) % ALPHABET.len()];
                let tampered = String::from_utf8(bytes).unwrap();

                prop_assert!(cipher.open(&tampered, b"task").is_err());
            }
        }
    }
}
