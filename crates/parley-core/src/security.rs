use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};

/// A client-supplied secret (api key or password), redacted in Debug.
#[derive(Clone)]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(SecretString::from(raw.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Compare against a stored key without short-circuiting on the first
    /// differing byte.
    pub fn matches(&self, stored: &str) -> bool {
        let a = self.expose().as_bytes();
        let b = stored.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Derive the api key a user authenticates with: lowercase hex
/// SHA-256 of `username ‖ password`.
pub fn derive_api_key(username: &str, password: &Credential) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(password.expose().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation;

    #[test]
    fn debug_is_redacted() {
        let c = Credential::new("hunter22");
        assert_eq!(format!("{c:?}"), "Credential([REDACTED])");
    }

    #[test]
    fn derived_key_has_credential_shape() {
        let key = derive_api_key("alice", &Credential::new("hunter22"));
        assert!(validation::is_credential(&key), "got: {key}");
    }

    #[test]
    fn derivation_is_deterministic_and_user_bound() {
        let pw = Credential::new("hunter22");
        assert_eq!(derive_api_key("alice", &pw), derive_api_key("alice", &pw));
        assert_ne!(derive_api_key("alice", &pw), derive_api_key("bob", &pw));
    }

    #[test]
    fn matches_compares_exactly() {
        let c = Credential::new("abc");
        assert!(c.matches("abc"));
        assert!(!c.matches("abd"));
        assert!(!c.matches("abcd"));
    }

    #[test]
    fn deserializes_from_plain_string() {
        let c: Credential = serde_json::from_str("\"k3y\"").unwrap();
        assert_eq!(c.expose(), "k3y");
    }
}
