//! Boxworld bit-level primitives.
//!
//! Everything in this crate is synchronous and free of I/O so the actor
//! runtime and the game crates can share it.
//!
//! # Contents
//!
//! - **Address**: the 256-bit key that names pages and games
//! - **Codec**: the RLE/literal compression used for stored and wire page state
//! - **Packing**: big-endian bit packing used by bulk page seeding
//! - **Rng**: deterministic generators keyed by a secret and an address

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod address;
mod codec;
mod packing;
mod rng;

pub use address::{Address, AddressError};
pub use codec::{CodecError, compress, decompress};
pub use packing::{pack_be, unpack_be};
pub use rng::{AddressedRng, AddressedRngFactory, RngConfigError};

/// Number of checkboxes on one page.
pub const PAGE_BITS: usize = 4096;
