//! EIP-191 personal-sign verification
//!
//! The canonical signed message is `osaurus-tunnel:<address>:<nonce>:<timestamp>`
//! where `timestamp` is whole seconds since the Unix epoch. Verification
//! recovers the signing key from the 65-byte `(r, s, v)` signature over the
//! Keccak-256 digest of the EIP-191 prefixed message and compares the derived
//! address. Any malformed input or failure in the underlying primitive is
//! treated as an invalid signature.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use osaurus_proto::{AgentAddress, AgentCredential, SIGNATURE_WINDOW_SECS};
use sha3::{Digest, Keccak256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Why an agent credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("agent {address} rejected: {reason}")]
pub struct AuthFailure {
    pub address: String,
    pub reason: &'static str,
}

/// Current wall-clock time as whole seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The message an agent signs to bind `(address, nonce, timestamp)`.
pub fn canonical_message(address: &AgentAddress, nonce: &str, timestamp: i64) -> String {
    format!("osaurus-tunnel:{}:{}:{}", address, nonce, timestamp)
}

/// `true` when `timestamp` is within the accepted skew of `now`.
pub fn timestamp_in_window(timestamp: i64, now: i64) -> bool {
    (now - timestamp).abs() <= SIGNATURE_WINDOW_SECS
}

/// The EIP-191 prefixed byte sequence whose Keccak-256 digest is signed.
pub fn eth_signed_message(message: &str) -> Vec<u8> {
    let mut out = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    out.extend_from_slice(message.as_bytes());
    out
}

/// Verify an EIP-191 personal-sign signature over `message` for `address`.
pub fn verify_personal_sign(address: &AgentAddress, message: &str, signature: &str) -> bool {
    recover_signer(message, signature)
        .map(|signer| signer == *address)
        .unwrap_or(false)
}

/// Verify one credential bound to `(nonce, timestamp)` and return the
/// canonical address on success.
pub fn verify_agent(
    address: &str,
    signature: &str,
    nonce: &str,
    timestamp: i64,
    now: i64,
) -> Result<AgentAddress, AuthFailure> {
    let canonical = AgentAddress::parse(address).map_err(|_| AuthFailure {
        address: address.to_string(),
        reason: "invalid_address",
    })?;
    if !timestamp_in_window(timestamp, now) {
        return Err(AuthFailure {
            address: canonical.to_string(),
            reason: "invalid_signature",
        });
    }
    let message = canonical_message(&canonical, nonce, timestamp);
    if !verify_personal_sign(&canonical, &message, signature) {
        return Err(AuthFailure {
            address: canonical.to_string(),
            reason: "invalid_signature",
        });
    }
    Ok(canonical)
}

/// Batch verification for the initial `auth` frame.
///
/// All-or-nothing: the first failing credential fails the whole batch, so a
/// tunnel is never established with a partially verified agent list.
pub fn verify_all(
    agents: &[AgentCredential],
    nonce: &str,
    timestamp: i64,
    now: i64,
) -> Result<Vec<AgentAddress>, AuthFailure> {
    let mut verified = Vec::with_capacity(agents.len());
    for agent in agents {
        verified.push(verify_agent(
            &agent.address,
            &agent.signature,
            nonce,
            timestamp,
            now,
        )?);
    }
    Ok(verified)
}

fn recover_signer(message: &str, signature: &str) -> Option<AgentAddress> {
    let raw = hex::decode(signature.strip_prefix("0x").unwrap_or(signature)).ok()?;
    if raw.len() != 65 {
        return None;
    }
    let v = raw[64];
    let recovery = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v })?;
    let mut sig = Signature::from_slice(&raw[..64]).ok()?;
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
    }
    let digest = Keccak256::new_with_prefix(eth_signed_message(message));
    let key = VerifyingKey::recover_from_digest(digest, &sig, recovery).ok()?;
    address_of(&key)
}

fn address_of(key: &VerifyingKey) -> Option<AgentAddress> {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    AgentAddress::parse(&format!("0x{}", hex::encode(&hash[12..]))).ok()
}
