// Cryptographic utilities

use anyhow::Result;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated API secrets.
pub const GENERATED_SECRET_LEN: usize = 32;

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 base64 digest (STANDARD).
pub fn sha256_base64(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Compute a safe fingerprint for a secret (hash only; never log the raw secret).
pub fn secret_fingerprint(input: &str) -> String {
    sha256_base64(input.as_bytes())
}

/// Random `[A-Za-z0-9]` string from the OS CSPRNG.
///
/// Uses rejection sampling so every character is equally likely.
pub fn generate_alphanumeric(len: usize) -> Result<String> {
    let rng = SystemRandom::new();
    // Largest multiple of 62 that fits in a byte.
    let limit = (256 / ALPHANUMERIC.len() * ALPHANUMERIC.len()) as u8;

    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        rng.fill(&mut buf)
            .map_err(|_| anyhow::anyhow!("Failed to read from system random source"))?;
        for &b in buf.iter() {
            if b >= limit {
                continue;
            }
            out.push(ALPHANUMERIC[(b as usize) % ALPHANUMERIC.len()] as char);
            if out.len() == len {
                break;
            }
        }
    }
    Ok(out)
}
