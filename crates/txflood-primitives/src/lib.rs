//! # txflood-primitives
//!
//! Fixed-size byte types used across txflood: account addresses, 32-byte
//! hashes and the 256-bit unsigned integer used for balances.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bytes;
mod error;

pub use bytes::{Address, H256};
pub use error::PrimitiveError;

pub use primitive_types::U256;

/// Block height type
pub type BlockHeight = u64;

/// Account nonce type
pub type Nonce = u64;

/// Parse a `0x`-prefixed hex quantity into a `u64`.
pub fn parse_quantity(s: &str) -> Result<u64, PrimitiveError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Err(PrimitiveError::InvalidQuantity(s.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| PrimitiveError::InvalidQuantity(s.to_string()))
}

/// Format a `u64` as a minimal `0x`-prefixed hex quantity.
pub fn format_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}
