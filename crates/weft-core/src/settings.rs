//! Persisted host settings.
//!
//! The only durable state: the long-term key pair and the last port that
//! bound successfully. Minute keys and session keys are ephemeral by
//! design and never touch disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

use weft_crypto::x25519::Keypair;

use crate::error::HostError;

/// On-disk settings blob (TOML).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSettings {
    /// Last successfully bound port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Long-term secret key, hex encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl HostSettings {
    /// Load settings, returning defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// [`HostError::Settings`] for unreadable or unparsable files.
    pub fn load(path: &Path) -> Result<Self, HostError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            std::fs::read_to_string(path).map_err(|e| HostError::Settings(e.to_string()))?;
        toml::from_str(&text).map_err(|e| HostError::Settings(e.to_string()))
    }

    /// Write settings back.
    ///
    /// # Errors
    ///
    /// [`HostError::Settings`] on serialization or I/O failure.
    pub fn store(&self, path: &Path) -> Result<(), HostError> {
        let text = toml::to_string_pretty(self).map_err(|e| HostError::Settings(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| HostError::Settings(e.to_string()))
    }

    /// Recover the stored identity, or mint and record a fresh one.
    ///
    /// # Errors
    ///
    /// [`HostError::Settings`] when the stored key is malformed.
    pub fn identity(&mut self) -> Result<Keypair, HostError> {
        if let Some(hex_key) = &self.secret_key {
            let bytes: [u8; 32] = hex::decode(hex_key)
                .map_err(|e| HostError::Settings(e.to_string()))?
                .try_into()
                .map_err(|_| HostError::Settings("malformed secret key".into()))?;
            return Ok(Keypair::from_secret_bytes(bytes));
        }
        let pair = Keypair::generate(&mut rand_core::OsRng);
        self.secret_key = Some(hex::encode(pair.secret().to_bytes()));
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_roundtrips_through_hex() {
        let mut settings = HostSettings::default();
        let first = settings.identity().unwrap();
        let second = settings.identity().unwrap();
        assert_eq!(first.public().to_bytes(), second.public().to_bytes());
    }

    #[test]
    fn malformed_key_rejected() {
        let mut settings = HostSettings {
            secret_key: Some("zz".into()),
            ..Default::default()
        };
        assert!(settings.identity().is_err());
    }
}
