//! Argon2id hashing for user and host passwords

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use wgmesh_common::{Error, Result};

/// Hash a password into a PHC string suitable for storage
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::Crypto(format!("Failed to hash password: {}", e)))?;

    Ok(hash.to_string())
}

/// Verify a password against a stored PHC string.
///
/// A malformed hash is an error; a mismatch is `Ok(false)`.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| Error::Crypto(format!("Invalid password hash format: {}", e)))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(Error::Crypto(format!("Failed to verify password: {}", e))),
    }
}

/// Whether `value` already looks like a PHC hash
pub fn is_hashed(value: &str) -> bool {
    value.starts_with("$argon2")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("CorrectHorse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(is_hashed(&hash));

        assert!(verify_password("CorrectHorse", &hash).unwrap());
        assert!(!verify_password("correcthorse", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_hash() {
        assert!(verify_password("anything", "not-a-hash").is_err());
        assert!(!is_hashed("plain"));
    }
}
