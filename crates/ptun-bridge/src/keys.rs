//! WireGuard key material
//!
//! X25519 keys as handed to the tunnel engine. In configuration files they
//! are base64 strings.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Decode a base64 string holding exactly 32 bytes.
fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| KeyError::InvalidLength(bytes.len()))
}

/// Local private key
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Parse a base64 encoded key
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Raw key bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Peer public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Raw key bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length {0} (expected 32 bytes)")]
    InvalidLength(usize),
}
