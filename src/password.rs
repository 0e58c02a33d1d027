//! PBKDF2-HMAC-SHA256 password hashes for the web panel login.
//!
//! Format: `pbkdf2:sha256:<iterations>$<salt>$<digest hex>`, the layout
//! werkzeug writes, so hashes from an existing deployment keep working.

use anyhow::{anyhow, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;

const METHOD: &str = "pbkdf2:sha256";
#[cfg(not(test))]
const DEFAULT_ITERATIONS: u32 = 600_000;
#[cfg(test)]
const DEFAULT_ITERATIONS: u32 = 1_000;
/// Upper bound accepted from a stored hash; every login pays this cost.
const MAX_ITERATIONS: u32 = 5_000_000;
const SALT_LEN: usize = 16;
const DIGEST_LEN: usize = 32;

fn derive(password: &str, salt: &str, iterations: u32) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), iterations, &mut out);
    out
}

pub fn hash_password(password: &str) -> String {
    let salt: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LEN)
        .map(char::from)
        .collect();
    let d = derive(password, &salt, DEFAULT_ITERATIONS);
    format!("{METHOD}:{DEFAULT_ITERATIONS}${salt}${}", hex::encode(d))
}

struct ParsedHash<'a> {
    iterations: u32,
    salt: &'a str,
    digest: Vec<u8>,
}

fn parse(stored: &str) -> Result<ParsedHash<'_>> {
    let mut parts = stored.trim().splitn(3, '$');
    let (Some(method), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(anyhow!("expected {METHOD}:<iterations>$<salt>$<digest>"));
    };
    let iterations = method
        .strip_prefix(METHOD)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| anyhow!("unsupported hash method '{method}'"))?
        .parse::<u32>()
        .context("iterations")?;
    if iterations == 0 || iterations > MAX_ITERATIONS {
        return Err(anyhow!("iterations must be in 1..={MAX_ITERATIONS}"));
    }
    if salt.is_empty() {
        return Err(anyhow!("salt must not be empty"));
    }
    let digest = hex::decode(digest).context("digest hex")?;
    if digest.len() != DIGEST_LEN {
        return Err(anyhow!("digest must be {DIGEST_LEN} bytes"));
    }
    Ok(ParsedHash {
        iterations,
        salt,
        digest,
    })
}

pub fn validate_hash(stored: &str) -> Result<()> {
    parse(stored).map(|_| ())
}

/// Constant-time over the digest. A malformed stored hash never verifies.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(p) = parse(stored) else {
        return false;
    };
    let d = derive(password, p.salt, p.iterations);
    d.iter()
        .zip(p.digest.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_right_password_only() {
        let h = hash_password("hunter2");
        assert!(h.starts_with("pbkdf2:sha256:"));
        assert!(verify_password("hunter2", &h));
        assert!(!verify_password("hunter3", &h));
        assert!(!verify_password("", &h));
    }

    #[test]
    fn salts_differ_between_hashes() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn accepts_werkzeug_hashes() {
        let stored = "pbkdf2:sha256:1000$Xq7pLm2Zr9TbWc4N$\
                      ae63f4aaf7211b38564237d44b898f599efe363d9b1d9935611a4396ca555ab0";
        validate_hash(stored).unwrap();
        assert!(verify_password("admin123", stored));
        assert!(!verify_password("admin1234", stored));
        assert!(!verify_password("admin123", &stored.replacen(":1000$", ":1001$", 1)));
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        assert!(validate_hash("admin123").is_err());
        assert!(validate_hash("pbkdf2:sha256:0$salt$00").is_err());
        assert!(validate_hash("pbkdf2:sha256:10$salt$zz").is_err());
        assert!(validate_hash("scrypt:32768:8:1$salt$00").is_err());
        assert!(!verify_password("admin123", "admin123"));
        assert!(validate_hash(&hash_password("x")).is_ok());
    }

    #[test]
    fn iteration_count_is_capped() {
        let digest = "00".repeat(DIGEST_LEN);
        assert!(validate_hash(&format!("pbkdf2:sha256:{MAX_ITERATIONS}$s${digest}")).is_ok());
        let huge = format!("pbkdf2:sha256:{}$s${digest}", u32::MAX);
        assert!(validate_hash(&huge).is_err());
        assert!(!verify_password("pw", &huge));
    }
}
