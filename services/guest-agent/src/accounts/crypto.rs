//! Password encryption under a windows-key's RSA public key.

use base64::{engine::general_purpose::STANDARD, Engine};
use rsa::rand_core::OsRng;
use rsa::{BigUint, Oaep, RsaPublicKey};
use thiserror::Error;

use super::key::WindowsKey;

/// Errors while preparing an encrypted credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("error decoding {field}: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("invalid public key: {0}")]
    InvalidKey(#[source] rsa::Error),

    #[error("unknown hash function requested: {0:?}")]
    UnsupportedHash(String),

    #[error("error encrypting password: {0}")]
    Encrypt(#[source] rsa::Error),
}

/// OAEP digest selectable by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunction {
    Sha1,
    Sha256,
    Sha512,
}

impl HashFunction {
    pub fn parse(name: &str) -> Result<Self, CredentialError> {
        match name {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(CredentialError::UnsupportedHash(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn padding(&self) -> Oaep {
        match self {
            Self::Sha1 => Oaep::new::<sha1::Sha1>(),
            Self::Sha256 => Oaep::new::<sha2::Sha256>(),
            Self::Sha512 => Oaep::new::<sha2::Sha512>(),
        }
    }
}

/// Hash requested by the key, `sha1` when unset.
pub fn hash_function(key: &WindowsKey) -> Result<HashFunction, CredentialError> {
    match key.hash_function.as_deref() {
        None | Some("") => Ok(HashFunction::Sha1),
        Some(name) => HashFunction::parse(name),
    }
}

/// Build the RSA public key from base64 modulus and exponent.
pub fn public_key(key: &WindowsKey) -> Result<RsaPublicKey, CredentialError> {
    let modulus = STANDARD
        .decode(&key.modulus)
        .map_err(|source| CredentialError::Decode {
            field: "modulus",
            source,
        })?;
    let exponent = STANDARD
        .decode(&key.exponent)
        .map_err(|source| CredentialError::Decode {
            field: "exponent",
            source,
        })?;

    RsaPublicKey::new(
        BigUint::from_bytes_be(&modulus),
        BigUint::from_bytes_be(&exponent),
    )
    .map_err(CredentialError::InvalidKey)
}

/// Encrypt `password` for `key` and return the base64 ciphertext.
pub fn encrypt_password(
    key: &WindowsKey,
    hash: HashFunction,
    password: &str,
) -> Result<String, CredentialError> {
    let public = public_key(key)?;
    let ciphertext = public
        .encrypt(&mut OsRng, hash.padding(), password.as_bytes())
        .map_err(CredentialError::Encrypt)?;
    Ok(STANDARD.encode(ciphertext))
}
