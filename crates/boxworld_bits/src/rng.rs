//! Address-keyed deterministic randomness.
//!
//! A generator for `(secret, stream, address)` is a PCG32 whose seed and
//! stream selector come from `HMAC-SHA256(stream_key, address)`, where
//! `stream_key = HMAC-SHA256(secret, stream)`. Game layouts can therefore
//! be regenerated from the address alone.

use crate::address::Address;
use derive_more::{Display, Error};
use hmac::{Hmac, Mac};
use rand_pcg::Pcg32;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once, PoisonError};
use tracing::{debug, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

static ZERO_SECRET_WARNING: Once = Once::new();

/// Builds and caches one [`AddressedRng`] per stream name.
pub struct AddressedRngFactory {
    secret: Arc<[u8]>,
    streams: Mutex<HashMap<String, AddressedRng>>,
}

impl std::fmt::Debug for AddressedRngFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressedRngFactory")
            .field("secret_len", &self.secret.len())
            .finish_non_exhaustive()
    }
}

impl AddressedRngFactory {
    /// Creates a factory from raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RngConfigError`] if the secret is empty.
    #[instrument(skip(secret))]
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, RngConfigError> {
        let secret: Vec<u8> = secret.into();
        if secret.is_empty() {
            return Err(RngConfigError::new("RNG secret must not be empty".to_string()));
        }
        if secret.iter().all(|&b| b == 0) {
            ZERO_SECRET_WARNING.call_once(|| {
                warn!(
                    len = secret.len(),
                    "RNG secret is all zero bytes; game layouts are predictable"
                );
            });
        }
        info!(len = secret.len(), "Creating addressed RNG factory");
        Ok(Self {
            secret: secret.into(),
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a factory from a hex-encoded secret.
    ///
    /// # Errors
    ///
    /// Returns [`RngConfigError`] if the text is not hex or decodes to nothing.
    #[instrument(skip(secret_hex))]
    pub fn from_hex(secret_hex: &str) -> Result<Self, RngConfigError> {
        let secret = hex::decode(secret_hex.trim())
            .map_err(|e| RngConfigError::new(format!("RNG secret is not hex: {}", e)))?;
        Self::new(secret)
    }

    /// Returns the generator for `stream`, deriving it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RngConfigError`] if the HMAC key cannot be built.
    #[instrument(skip(self))]
    pub fn derive(&self, stream: &str) -> Result<AddressedRng, RngConfigError> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rng) = streams.get(stream) {
            return Ok(rng.clone());
        }

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| RngConfigError::new(format!("invalid secret: {}", e)))?;
        mac.update(stream.as_bytes());
        let stream_key = mac.finalize().into_bytes();
        let keyed = HmacSha256::new_from_slice(&stream_key)
            .map_err(|e| RngConfigError::new(format!("invalid stream key: {}", e)))?;

        let rng = AddressedRng {
            stream: stream.into(),
            mac: keyed,
        };
        streams.insert(stream.to_string(), rng.clone());
        debug!(stream, "Derived RNG stream");
        Ok(rng)
    }
}

/// Per-stream generator source.
#[derive(Clone)]
pub struct AddressedRng {
    stream: Arc<str>,
    mac: HmacSha256,
}

impl std::fmt::Debug for AddressedRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressedRng")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl AddressedRng {
    /// Stream name this generator was derived for.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Returns the PCG32 generator for `address`.
    pub fn for_address(&self, address: &Address) -> Pcg32 {
        let mut mac = self.mac.clone();
        mac.update(address.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut seed = [0u8; 8];
        let mut selector = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        selector.copy_from_slice(&digest[8..16]);
        Pcg32::new(u64::from_le_bytes(seed), u64::from_le_bytes(selector))
    }

    /// Parses `hex_address` and returns its generator.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AddressError`] if the address does not parse.
    pub fn for_hex(&self, hex_address: &str) -> Result<Pcg32, crate::AddressError> {
        Ok(self.for_address(&hex_address.parse()?))
    }
}

/// RNG configuration error.
#[derive(Debug, Clone, Display, Error)]
#[display("RNG config error: {} at {}:{}", message, file, line)]
pub struct RngConfigError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl RngConfigError {
    /// Creates a new RNG configuration error.
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

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn draws(rng: &AddressedRng, address: &Address, n: usize) -> Vec<u32> {
        let mut generator = rng.for_address(address);
        (0..n).map(|_| generator.next_u32()).collect()
    }

    #[test]
    fn test_same_inputs_same_sequence() {
        let a = AddressedRngFactory::new(b"test-secret".to_vec()).unwrap();
        let b = AddressedRngFactory::new(b"test-secret".to_vec()).unwrap();
        let address = Address::from_u64(42);
        assert_eq!(
            draws(&a.derive("minesweeper").unwrap(), &address, 1000),
            draws(&b.derive("minesweeper").unwrap(), &address, 1000)
        );
    }

    #[test]
    fn test_one_bit_apart_addresses_diverge() {
        let factory = AddressedRngFactory::new(b"test-secret".to_vec()).unwrap();
        let rng = factory.derive("minesweeper").unwrap();
        let first = draws(&rng, &Address::from_u64(2), 1000);
        let second = draws(&rng, &Address::from_u64(3), 1000);
        assert_ne!(first, second);
        let equal = first.iter().zip(&second).filter(|(a, b)| a == b).count();
        assert!(equal < 5, "{equal} positions matched");
    }

    #[test]
    fn test_streams_do_not_collide() {
        let factory = AddressedRngFactory::new(b"test-secret".to_vec()).unwrap();
        let address = Address::from_u64(7);
        assert_ne!(
            draws(&factory.derive("minesweeper").unwrap(), &address, 64),
            draws(&factory.derive("golddigger").unwrap(), &address, 64)
        );
    }

    #[test]
    fn test_secret_changes_sequence() {
        let a = AddressedRngFactory::new(b"one".to_vec()).unwrap();
        let b = AddressedRngFactory::new(b"two".to_vec()).unwrap();
        let address = Address::from_u64(7);
        assert_ne!(
            draws(&a.derive("s").unwrap(), &address, 16),
            draws(&b.derive("s").unwrap(), &address, 16)
        );
    }

    #[test]
    fn test_derive_is_cached() {
        let factory = AddressedRngFactory::new(vec![1, 2, 3]).unwrap();
        let address = Address::from_u64(9);
        let first = factory.derive("war").unwrap();
        let again = factory.derive("war").unwrap();
        assert_eq!(first.stream(), "war");
        assert_eq!(draws(&first, &address, 8), draws(&again, &address, 8));
    }

    #[test]
    fn test_empty_secret_is_rejected() {
        assert!(AddressedRngFactory::new(Vec::new()).is_err());
        assert!(AddressedRngFactory::from_hex("").is_err());
        assert!(AddressedRngFactory::from_hex("zz").is_err());
    }

    #[test]
    fn test_zero_secret_is_accepted() {
        assert!(AddressedRngFactory::new(vec![0u8; 32]).is_ok());
    }

    #[test]
    fn test_hex_address_matches_parsed() {
        let factory = AddressedRngFactory::from_hex("00ff").unwrap();
        let rng = factory.derive("s").unwrap();
        let mut by_hex = rng.for_hex("beef").unwrap();
        let mut by_addr = rng.for_address(&"beef".parse().unwrap());
        assert_eq!(by_hex.next_u64(), by_addr.next_u64());
    }
}
