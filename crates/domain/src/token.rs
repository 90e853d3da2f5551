//! Secret generation and constant-time comparison.
//!
//! All secrets come from the OS entropy source. Short-IDs are 16-char
//! lowercase base-36 (≈82 bits), safe for use as a DNS label, so subdomain
//! collisions stay negligible even at very large sandbox counts.

use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of a sandbox short-ID.
pub const SHORT_ID_LEN: usize = 16;

/// Generate a 32-byte base64 secret (proxy/sandbox/tunnel tokens,
/// registration codes).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Generate a 16-char lowercase base-36 short-ID.
///
/// Sampled with rejection so every character is uniform over the 36-symbol
/// alphabet.
pub fn generate_short_id() -> String {
    let mut out = String::with_capacity(SHORT_ID_LEN);
    while out.len() < SHORT_ID_LEN {
        let mut buf = [0u8; 16];
        OsRng.fill_bytes(&mut buf);
        for b in buf {
            // Reject bytes that would bias the modulo. 252 = 36 * 7.
            if b < 252 {
                out.push(BASE36[(b % 36) as usize] as char);
                if out.len() == SHORT_ID_LEN {
                    break;
                }
            }
        }
    }
    out
}

/// Whether a string is a well-formed short-ID (16 lowercase base-36 chars).
pub fn is_valid_short_id(s: &str) -> bool {
    s.len() == SHORT_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
pub fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

/// SHA-256 digest of a token, hex-encoded for storage.
///
/// The store never keeps raw session-cookie values, only this digest.
pub fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn short_id_shape() {
        for _ in 0..100 {
            let id = generate_short_id();
            assert_eq!(id.len(), SHORT_ID_LEN);
            assert!(is_valid_short_id(&id), "bad short id: {id}");
        }
    }

    #[test]
    fn short_ids_do_not_collide_in_practice() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generate_short_id()));
        }
    }

    #[test]
    fn secrets_are_distinct_and_decodable() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&a)
            .expect("secret should be base64");
        assert_eq!(raw.len(), 32);
    }

    #[test]
    fn token_eq_matches_exact_only() {
        assert!(token_eq("abc", "abc"));
        assert!(!token_eq("abc", "abd"));
        assert!(!token_eq("abc", "abcd"));
        assert!(!token_eq("", "abc"));
    }

    #[test]
    fn digest_is_stable_hex() {
        let d = token_digest("hello");
        assert_eq!(d.len(), 64);
        assert_eq!(d, token_digest("hello"));
        assert_ne!(d, token_digest("hellp"));
    }

    #[test]
    fn short_id_validation_rejects_uppercase_and_length() {
        assert!(!is_valid_short_id("ABCDEF0123456789"));
        assert!(!is_valid_short_id("abc"));
        assert!(!is_valid_short_id("abcdef012345678-"));
        assert!(is_valid_short_id("abcdef0123456789"));
    }
}
