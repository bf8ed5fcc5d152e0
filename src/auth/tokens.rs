//! Opaque token material: refresh tokens, password-reset tokens, and the
//! operator-side secret generator. Tokens are stored hashed; only the raw
//! value ever leaves the process.

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

/// Bytes of entropy behind refresh and reset tokens.
const TOKEN_BYTES: usize = 32;

/// Bytes of entropy for operator secrets (128 hex chars).
pub const SECRET_BYTES: usize = 64;

pub fn generate_token() -> String {
    random_hex(TOKEN_BYTES)
}

pub fn generate_secret() -> String {
    random_hex(SECRET_BYTES)
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_128_lowercase_hex_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 128);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(secret, secret.to_lowercase());
    }

    #[test]
    fn secrets_do_not_repeat() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn tokens_do_not_repeat() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn token_hash_is_stable_and_distinct_from_input() {
        let token = generate_token();
        let hash = hash_token(&token);
        assert_eq!(hash, hash_token(&token));
        assert_ne!(hash, token);
        assert_eq!(hash.len(), 64);
    }
}
