//! 256-bit actor addresses.

use derive_more::{Display, Error};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::instrument;

/// A 256-bit address naming a page or a game.
///
/// Addresses always render as 64 lowercase hex digits. Parsing accepts
/// shorter input and pads it on the left, so `"ff"` and
/// `"00…00ff"` name the same actor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; Address::LEN]);

impl Address {
    /// Width of an address in bytes.
    pub const LEN: usize = 32;

    /// Wraps raw big-endian bytes.
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Builds an address whose low 8 bytes hold `value` (big-endian).
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; Self::LEN];
        bytes[Self::LEN - 8..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Draws a fresh address from the operating system RNG.
    #[instrument]
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derives an address as the SHA-256 of the given parts.
    ///
    /// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]`
    /// never collide.
    pub fn digest(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&hasher.finalize());
        Self(bytes)
    }

    /// Raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Canonical 64-digit lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        let digits = digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits);
        if digits.is_empty() {
            return Err(AddressError::new("empty address".to_string()));
        }

        let padded = if digits.len() % 2 == 1 {
            format!("0{digits}")
        } else {
            digits.to_string()
        };
        let raw = hex::decode(&padded)
            .map_err(|e| AddressError::new(format!("invalid hex address '{}': {}", s, e)))?;
        if raw.len() > Self::LEN {
            return Err(AddressError::new(format!(
                "address '{}' is {} bytes, at most {} allowed",
                s,
                raw.len(),
                Self::LEN
            )));
        }

        let mut bytes = [0u8; Self::LEN];
        bytes[Self::LEN - raw.len()..].copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Address parse error.
#[derive(Debug, Clone, Display, Error)]
#[display("Address error: {} at {}:{}", message, file, line)]
pub struct AddressError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl AddressError {
    /// Creates a new address error with caller location tracking.
    #[track_caller]
    pub fn new(message: String) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message,
            line: loc.line(),
            file: loc.file(),
        }
    }
}
