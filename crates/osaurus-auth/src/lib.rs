//! Challenge/response authentication for tunnel agents
//!
//! Agents prove ownership of a secp256k1 address by signing a canonical
//! message with the EIP-191 personal-sign prefix. The relay issues single-use
//! nonces and verifies signatures by public-key recovery.

pub mod eip191;
pub mod nonce;

pub use eip191::{
    canonical_message, eth_signed_message, timestamp_in_window, unix_now, verify_agent,
    verify_all, verify_personal_sign, AuthFailure,
};
