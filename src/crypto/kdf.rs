//! Argon2id key derivation
//!
//! Every sealed blob names the salt its key came from, so derivation always
//! takes an explicit salt; only a new cipher instance draws a fresh one.

use super::{CryptoError, Passphrase, KEY_SIZE, SALT_SIZE};
use crate::config::EncryptionConfig;
use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::Zeroizing;

/// AES-256 key material, zeroized on drop
pub type DerivedKey = Zeroizing<[u8; KEY_SIZE]>;

fn argon2(config: &EncryptionConfig) -> Result<Argon2<'static>, CryptoError> {
    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Derive the key for `passphrase` under `salt`
pub fn derive_key(
    passphrase: &Passphrase,
    salt: &[u8],
    config: &EncryptionConfig,
) -> Result<DerivedKey, CryptoError> {
    if salt.len() != SALT_SIZE {
        return Err(CryptoError::KeyDerivation(format!(
            "salt is {} bytes, expected {}",
            salt.len(),
            SALT_SIZE
        )));
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2(config)?
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> EncryptionConfig {
        EncryptionConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        }
    }

    #[test]
    fn test_same_inputs_same_key() {
        let salt = generate_salt();
        let pass = Passphrase::from("correct horse");

        let a = derive_key(&pass, &salt, &cheap()).unwrap();
        let b = derive_key(&pass, &salt, &cheap()).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_salt_and_passphrase_both_matter() {
        let salt = generate_salt();
        let base = derive_key(&Passphrase::from("one"), &salt, &cheap()).unwrap();

        let other_pass = derive_key(&Passphrase::from("two"), &salt, &cheap()).unwrap();
        assert_ne!(*base, *other_pass);

        let mut other_salt = salt;
        other_salt[0] ^= 1;
        let salted = derive_key(&Passphrase::from("one"), &other_salt, &cheap()).unwrap();
        assert_ne!(*base, *salted);
    }

    #[test]
    fn test_bad_inputs() {
        let pass = Passphrase::from("p");
        assert!(matches!(
            derive_key(&pass, &[0u8; 4], &cheap()),
            Err(CryptoError::KeyDerivation(_))
        ));

        let broken = EncryptionConfig {
            argon2_memory_kib: 1,
            ..cheap()
        };
        assert!(matches!(
            derive_key(&pass, &generate_salt(), &broken),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
