//! API credentials.

use crate::error::ConfigError;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Required length of an access key, in characters
pub const ACCESS_KEY_LEN: usize = 13;

/// Required length of a secret key, in characters
pub const SECRET_KEY_LEN: usize = 30;

/// Every access key starts with this prefix
pub const ACCESS_KEY_PREFIX: &str = "Idi";

/// Secret half of the credentials, zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
struct SecretKey(String);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Access key / secret key pair identifying an API project
///
/// Both keys are validated at construction; an instance is always
/// well-formed. Share it between clients with `Arc<Credentials>`.
///
/// `Display` and `Debug` never show the secret key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: SecretKey,
}

impl Credentials {
    /// Create credentials from an access key and its matching secret key
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidCredentials` if the access key is not
    /// 13 characters starting with `Idi`, or the secret key is not
    /// 30 characters.
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let access_key = access_key.into();
        let secret_key = SecretKey(secret_key.into());

        if access_key.chars().count() != ACCESS_KEY_LEN {
            return Err(invalid(format!(
                "access key must be {ACCESS_KEY_LEN} characters"
            )));
        }
        if !access_key.starts_with(ACCESS_KEY_PREFIX) {
            return Err(invalid(format!(
                "access key must start with '{ACCESS_KEY_PREFIX}'"
            )));
        }
        if secret_key.0.chars().count() != SECRET_KEY_LEN {
            return Err(invalid(format!(
                "secret key must be {SECRET_KEY_LEN} characters"
            )));
        }

        Ok(Self {
            access_key,
            secret_key,
        })
    }

    /// Create credentials from the combined key (access key followed by secret key)
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidCredentials` if the combined key cannot be
    /// split into a valid access key and secret key.
    pub fn from_key(key: &str) -> Result<Self, ConfigError> {
        let split = key
            .char_indices()
            .nth(ACCESS_KEY_LEN)
            .map(|(idx, _)| idx)
            .ok_or_else(|| invalid("combined key is too short".to_owned()))?;
        let (access_key, secret_key) = key.split_at(split);
        Self::new(access_key, secret_key)
    }

    /// The public access key
    #[must_use]
    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Raw secret key bytes, for the signer only
    pub(crate) fn secret_key(&self) -> &[u8] {
        self.secret_key.0.as_bytes()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key)
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.access_key)
    }
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::InvalidCredentials { reason }
}
