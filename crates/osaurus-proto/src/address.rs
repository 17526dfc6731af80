//! Agent addresses
//!
//! A 20-byte secp256k1 identity rendered as `0x` + 40 hex characters.
//! Input is case-insensitive; the canonical lowercase form is used for every
//! routing and lookup key.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Agent address parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must start with 0x")]
    MissingPrefix,

    #[error("address must be 42 characters, got {0}")]
    BadLength(usize),

    #[error("address contains a non-hex character")]
    NotHex,
}

/// A canonical agent address: lowercase `0x` + 40 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AgentAddress(String);

impl AgentAddress {
    /// Parse and canonicalise an address. Accepts any hex case.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        if !input.starts_with("0x") && !input.starts_with("0X") {
            return Err(AddressError::MissingPrefix);
        }
        if input.len() != 42 {
            return Err(AddressError::BadLength(input.len()));
        }
        let digits = &input[2..];
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::NotHex);
        }
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Public URL for this address under the given base domain.
    pub fn url(&self, base_domain: &str) -> String {
        format!("https://{}.{}", self.0, base_domain)
    }
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for AgentAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
