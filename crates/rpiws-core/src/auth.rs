//! Challenge/response authentication for agents.
//!
//! The broker issues a random challenge; the agent answers with
//! `base64(HMAC-SHA1(secret, mac ++ challenge))`. The broker precomputes
//! the MAC state at issue time and verifies the answer in constant time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("response token is not valid base64")]
    MalformedToken,
    #[error("response token does not match")]
    Mismatch,
}

fn keyed(secret: &[u8], mac: &str, challenge: &str) -> HmacSha1 {
    let mut hmac = HmacSha1::new_from_slice(secret).expect("HMAC can take key of any size");
    hmac.update(mac.as_bytes());
    hmac.update(challenge.as_bytes());
    hmac
}

/// `base64(sha1(timestamp ++ 32 random bytes))`.
pub fn generate_challenge() -> String {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    let timestamp = chrono::Utc::now().timestamp_micros().to_string();

    let mut hasher = Sha1::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce);
    STANDARD.encode(hasher.finalize())
}

/// The agent's answer to `challenge`.
pub fn sign_challenge(secret: &[u8], mac: &str, challenge: &str) -> String {
    STANDARD.encode(keyed(secret, mac, challenge).finalize().into_bytes())
}

/// An outstanding challenge for one agent connection.
#[derive(Clone)]
pub struct Challenge {
    token: String,
    expected: HmacSha1,
}

impl std::fmt::Debug for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Challenge")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Challenge {
    pub fn issue(secret: &[u8], mac: &str) -> Self {
        Self::with_token(secret, mac, generate_challenge())
    }

    pub fn with_token(secret: &[u8], mac: &str, token: String) -> Self {
        let expected = keyed(secret, mac, &token);
        Self { token, expected }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn verify(&self, response: &str) -> Result<(), AuthError> {
        let decoded = STANDARD
            .decode(response.as_bytes())
            .map_err(|_| AuthError::MalformedToken)?;
        self.expected
            .clone()
            .verify_slice(&decoded)
            .map_err(|_| AuthError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &[u8] = b"shared-secret";
    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn challenges_are_fresh_sha1_digests() {
        let a = generate_challenge();
        let b = generate_challenge();
        assert_ne!(a, b);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 20);
    }

    #[test]
    fn correct_secret_verifies() {
        let challenge = Challenge::issue(SECRET, MAC);
        let response = sign_challenge(SECRET, MAC, challenge.token());
        assert_eq!(challenge.verify(&response), Ok(()));
    }

    #[test]
    fn wrong_secret_or_mac_is_rejected() {
        let challenge = Challenge::with_token(SECRET, MAC, "T1".to_string());
        let other_secret = sign_challenge(b"nope", MAC, "T1");
        let other_mac = sign_challenge(SECRET, "00:00:00:00:00:00", "T1");
        assert_eq!(challenge.verify(&other_secret), Err(AuthError::Mismatch));
        assert_eq!(challenge.verify(&other_mac), Err(AuthError::Mismatch));
        assert_eq!(challenge.verify("%%%"), Err(AuthError::MalformedToken));
    }

    proptest! {
        #[test]
        fn any_single_bit_flip_is_rejected(bit in 0usize..(20 * 8)) {
            let challenge = Challenge::issue(SECRET, MAC);
            let response = sign_challenge(SECRET, MAC, challenge.token());
            let mut raw = STANDARD.decode(&response).unwrap();
            raw[bit / 8] ^= 1 << (bit % 8);
            let tampered = STANDARD.encode(&raw);
            prop_assert!(challenge.verify(&tampered).is_err());
        }

        #[test]
        fn any_single_bit_flip_in_the_text_is_rejected(bit in 0usize..(28 * 8)) {
            let challenge = Challenge::issue(SECRET, MAC);
            let mut text = sign_challenge(SECRET, MAC, challenge.token()).into_bytes();
            text[bit / 8] ^= 1 << (bit % 8);
            let tampered = String::from_utf8(text);
            prop_assume!(tampered.is_ok());
            prop_assert!(challenge.verify(&tampered.unwrap()).is_err());
        }
    }
}
