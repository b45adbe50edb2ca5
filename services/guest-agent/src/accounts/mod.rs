//! Windows-key driven account management.
//!
//! Each `windows-keys` line names a user and an RSA public key. New keys
//! get a local admin account with a fresh password, disclosed only as
//! ciphertext under that key.

mod crypto;
mod key;
mod password;
mod reader;
mod writer;

pub use crypto::{CredentialError, HashFunction};
pub use key::WindowsKey;
pub use reader::{
    parse_windows_keys, AccountsReader, KeySet, DISABLE_ACCOUNT_MANAGER, WINDOWS_KEYS,
};
pub use writer::AccountsWriter;

/// Domain name used in logs.
pub const DOMAIN: &str = "accounts";
