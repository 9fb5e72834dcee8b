//! JSON scenario input for the CLI runner.

use serde::Deserialize;
use std::io;

use crate::error::Result;

/// One payment to create, complete, and anchor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub external_id: String,
    pub payer_id: String,
    pub beneficiary_id: String,
    pub amount_minor_units: u64,
    pub currency: String,
    #[serde(default)]
    pub bank_reference: Option<String>,
}

/// Reads a JSON array of payment requests.
pub fn read_payment_requests<R: io::Read>(reader: R) -> Result<Vec<PaymentRequest>> {
    Ok(serde_json::from_reader(reader)?)
}
