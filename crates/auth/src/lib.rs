use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use oscard_proto::{Buffer, CodecError};
use rand::rngs::OsRng;
use rand::RngCore;
use std::error::Error;
use std::fmt::{Display, Formatter};
use subtle::ConstantTimeEq;

/// The constant every AIM client folds into its login digest.
pub const CHALLENGE_SUFFIX: &[u8] = b"AOL Instant Messenger (SM)";

/// Length of the printable challenge key sent in (0x17, 0x07).
pub const AUTH_KEY_LEN: usize = 32;

/// Hard cap on cookie lifetime.
pub const COOKIE_TTL_MAX_SECONDS: i64 = 300;

const COOKIE_MAC_LEN: usize = 32;
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const VERIFICATION_TOKEN_LENGTH: usize = 24;

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    Malformed,
    BadSignature,
    Expired,
    Credential,
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed token"),
            Self::BadSignature => write!(f, "signature mismatch"),
            Self::Expired => write!(f, "token expired"),
            Self::Credential => write!(f, "credential failure"),
        }
    }
}

impl Error for AuthError {}

/// Mints the random printable key the MD5 challenge is built on.
pub fn generate_auth_key() -> String {
    sample_alphabet(AUTH_KEY_LEN)
}

/// Mints a single-use email verification token.
pub fn generate_verification_token() -> String {
    sample_alphabet(VERIFICATION_TOKEN_LENGTH)
}

fn sample_alphabet(length: usize) -> String {
    let mut raw = vec![0u8; length];
    OsRng.fill_bytes(&mut raw);
    raw.iter()
        .map(|byte| TOKEN_ALPHABET[*byte as usize % TOKEN_ALPHABET.len()] as char)
        .collect()
}

/// The login digest: `md5(md5(key || password) || "AOL Instant Messenger (SM)")`.
pub fn challenge_digest(auth_key: &[u8], password: &[u8]) -> [u8; 16] {
    let mut inner = Md5::new();
    inner.update(auth_key);
    inner.update(password);
    let inner = inner.finalize();
    let mut outer = Md5::new();
    outer.update(inner);
    outer.update(CHALLENGE_SUFFIX);
    outer.finalize().into()
}

/// Constant-time check of a client-submitted login digest.
pub fn verify_challenge(auth_key: &[u8], password: &[u8], submitted: &[u8]) -> bool {
    let expected = challenge_digest(auth_key, password);
    if submitted.len() != expected.len() {
        return false;
    }
    expected.ct_eq(submitted).into()
}

/// Mints the opaque BOS cookie: length-prefixed canonical screen name,
/// expiry epoch seconds, keyed MAC over both.
pub fn mint_cookie(secret: &[u8; 32], screen_name: &str, expires_at: DateTime<Utc>) -> Vec<u8> {
    let mut buffer = Buffer::new();
    buffer.write_b8(screen_name.as_bytes());
    buffer.write_u64(expires_at.timestamp().max(0) as u64);
    let mac = blake3::keyed_hash(secret, buffer.as_slice());
    buffer.write_bytes(mac.as_bytes());
    buffer.into_vec()
}

/// Validates a presented cookie and yields the screen name it was minted
/// for. Signature is checked before expiry so a forged expiry cannot
/// change the verdict class.
pub fn verify_cookie(
    secret: &[u8; 32],
    raw: &[u8],
    now: DateTime<Utc>,
) -> Result<String, AuthError> {
    if raw.len() < COOKIE_MAC_LEN {
        return Err(AuthError::Malformed);
    }
    let (body, mac) = raw.split_at(raw.len() - COOKIE_MAC_LEN);
    let expected = blake3::keyed_hash(secret, body);
    let matches: bool = expected.as_bytes().ct_eq(mac).into();
    if !matches {
        return Err(AuthError::BadSignature);
    }
    let mut buffer = Buffer::from_slice(body);
    let screen_name = buffer
        .read_b8()
        .map_err(|_: CodecError| AuthError::Malformed)?;
    let expires = buffer
        .read_u64()
        .map_err(|_: CodecError| AuthError::Malformed)?;
    if !buffer.is_empty() {
        return Err(AuthError::Malformed);
    }
    if now.timestamp() > expires as i64 {
        return Err(AuthError::Expired);
    }
    String::from_utf8(screen_name).map_err(|_| AuthError::Malformed)
}

/// Durable credential of record written at registration.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AuthError::Credential)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn md5_primitive_matches_reference_vector() {
        let digest: [u8; 16] = Md5::digest(b"abc").into();
        assert_eq!(
            digest,
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28,
                0xe1, 0x7f, 0x72,
            ]
        );
    }

    #[test]
    fn challenge_verdict_tracks_password() {
        let key = generate_auth_key();
        let digest = challenge_digest(key.as_bytes(), b"hunter2");
        assert!(verify_challenge(key.as_bytes(), b"hunter2", &digest));
        assert!(!verify_challenge(key.as_bytes(), b"hunter3", &digest));
        assert!(!verify_challenge(b"otherkey", b"hunter2", &digest));
        assert!(!verify_challenge(key.as_bytes(), b"hunter2", &digest[..8]));
    }

    #[test]
    fn auth_key_is_printable_and_sized() {
        let key = generate_auth_key();
        assert_eq!(key.len(), AUTH_KEY_LEN);
        assert!(key.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
        assert_ne!(key, generate_auth_key());
    }

    #[test]
    fn cookie_roundtrip() {
        let secret = [7u8; 32];
        let now = Utc::now();
        let cookie = mint_cookie(&secret, "runningman83", now + Duration::seconds(300));
        assert_eq!(
            verify_cookie(&secret, &cookie, now).unwrap(),
            "runningman83"
        );
    }

    #[test]
    fn cookie_expiry_enforced() {
        let secret = [7u8; 32];
        let now = Utc::now();
        let cookie = mint_cookie(&secret, "alice", now - Duration::seconds(1));
        assert_eq!(verify_cookie(&secret, &cookie, now), Err(AuthError::Expired));
    }

    #[test]
    fn cookie_tamper_and_wrong_secret_rejected() {
        let secret = [7u8; 32];
        let now = Utc::now();
        let mut cookie = mint_cookie(&secret, "alice", now + Duration::seconds(60));
        cookie[1] ^= 0x01;
        assert_eq!(
            verify_cookie(&secret, &cookie, now),
            Err(AuthError::BadSignature)
        );
        let cookie = mint_cookie(&secret, "alice", now + Duration::seconds(60));
        assert_eq!(
            verify_cookie(&[8u8; 32], &cookie, now),
            Err(AuthError::BadSignature)
        );
        assert_eq!(
            verify_cookie(&secret, &cookie[..16], now),
            Err(AuthError::Malformed)
        );
    }

    #[test]
    fn password_verifier_roundtrip() {
        let hash = hash_password("s3cret").unwrap();
        assert!(verify_password(&hash, "s3cret"));
        assert!(!verify_password(&hash, "s3cret!"));
        assert!(!verify_password("not-a-phc-string", "s3cret"));
    }

    #[test]
    fn verification_tokens_differ() {
        let token = generate_verification_token();
        assert_eq!(token.len(), VERIFICATION_TOKEN_LENGTH);
        assert_ne!(token, generate_verification_token());
    }
}
