//! Deterministic canonicalization and hash derivation for payments.
//!
//! The canonical payload is the byte-exact commitment that gets hashed and
//! anchored: compact JSON with a fixed lexicographic key order, so the same
//! logical payment always produces the same hash regardless of how the
//! caller assembled its fields.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Bumped whenever the canonical serialization changes shape.
pub const SCHEMA_VERSION: &str = "1.0";

/// Length of the truncated privacy digest for counterpart identifiers.
const ID_DIGEST_LEN: usize = 16;

/// The committed fields of a payment, as the canonicalizer consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFields {
    pub external_ref: String,
    pub payer_ref: String,
    pub beneficiary_ref: String,
    pub amount_minor_units: u64,
    pub currency: String,
    pub executed_at: DateTime<Utc>,
    pub bank_reference: Option<String>,
}

/// Wire shape of the canonical payload. Field declaration order here is the
/// serialization order, and must stay lexicographic over the camelCase keys.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalPayload<'a> {
    amount_minor_units: String,
    bank_reference: &'a str,
    beneficiary_id: String,
    currency: &'a str,
    executed_at: String,
    external_id: &'a str,
    payer_id: String,
    version: &'a str,
}

/// A payload and its binding hash. The payload is retained verbatim so the
/// hash can be re-verified later without re-deriving it from the payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCommitment {
    pub canonical_payload: String,
    pub payment_hash: String,
}

/// Privacy-preserving digest for counterpart identifiers: the public ledger
/// never sees raw payer/beneficiary references, only this truncated hash.
pub fn hash_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    hex::encode(digest)[..ID_DIGEST_LEN].to_string()
}

/// Builds the deterministic serialization of the committed fields.
pub fn build_canonical_payload(fields: &CanonicalFields) -> Result<String> {
    let payload = CanonicalPayload {
        amount_minor_units: fields.amount_minor_units.to_string(),
        bank_reference: fields.bank_reference.as_deref().unwrap_or(""),
        beneficiary_id: hash_id(&fields.beneficiary_ref),
        currency: &fields.currency,
        executed_at: fields.executed_at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        external_id: &fields.external_ref,
        payer_id: hash_id(&fields.payer_ref),
        version: SCHEMA_VERSION,
    };
    Ok(serde_json::to_string(&payload)?)
}

/// SHA-256 of the UTF-8 payload, hex-encoded with the `0x` prefix.
pub fn hash_payload(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    format!("0x{}", hex::encode(digest))
}

/// Canonicalizes and hashes in one step.
pub fn generate_payment_hash(fields: &CanonicalFields) -> Result<PaymentCommitment> {
    let canonical_payload = build_canonical_payload(fields)?;
    let payment_hash = hash_payload(&canonical_payload);
    Ok(PaymentCommitment {
        canonical_payload,
        payment_hash,
    })
}

/// Recomputes the hash of a stored payload and compares it to a stored hash,
/// case-insensitively. Detects local tampering independent of the ledger.
pub fn verify_payload(payload: &str, expected_hash: &str) -> bool {
    hash_payload(payload).eq_ignore_ascii_case(expected_hash)
}
