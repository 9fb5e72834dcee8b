use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::canonical::CanonicalFields;
use crate::error::{AnchorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Anchored,
    Failed,
}

impl PaymentStatus {
    /// Exhaustive transition table. Anything not listed is rejected.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Anchored)
                | (Completed, Failed)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Anchored => "ANCHORED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// An off-chain settled transfer.
///
/// The payment store owns these records; the orchestrator works on
/// per-invocation copies and writes them back explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    /// Caller-assigned, unique across all payments.
    pub external_ref: String,
    pub payer_ref: String,
    pub beneficiary_ref: String,
    pub amount_minor_units: u64,
    /// ISO 4217 alphabetic code.
    pub currency: String,
    pub status: PaymentStatus,
    pub bank_reference: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        external_ref: impl Into<String>,
        payer_ref: impl Into<String>,
        beneficiary_ref: impl Into<String>,
        amount_minor_units: u64,
        currency: impl Into<String>,
    ) -> Result<Self> {
        let external_ref = external_ref.into();
        if external_ref.is_empty() {
            return Err(AnchorError::Validation(
                "external reference must not be empty".to_string(),
            ));
        }
        let currency = currency.into();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(AnchorError::Validation(format!(
                "currency must be a 3-letter uppercase code, got {currency:?}"
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(),
            external_ref,
            payer_ref: payer_ref.into(),
            beneficiary_ref: beneficiary_ref.into(),
            amount_minor_units,
            currency,
            status: PaymentStatus::Pending,
            bank_reference: None,
            executed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn transition(&mut self, next: PaymentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AnchorError::InvalidPaymentTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the payment as settled and records the execution details.
    pub fn complete(
        &mut self,
        bank_reference: Option<String>,
        executed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(PaymentStatus::Completed)?;
        self.bank_reference = bank_reference;
        self.executed_at = Some(executed_at);
        Ok(())
    }

    pub fn mark_anchored(&mut self) -> Result<()> {
        self.transition(PaymentStatus::Anchored)
    }

    /// The committed fields the canonicalizer binds into the hash.
    /// Requires the payment to have been executed.
    pub fn canonical_fields(&self) -> Result<CanonicalFields> {
        let executed_at = self.executed_at.ok_or_else(|| {
            AnchorError::Validation(format!(
                "payment {} has no execution timestamp",
                self.id
            ))
        })?;
        Ok(CanonicalFields {
            external_ref: self.external_ref.clone(),
            payer_ref: self.payer_ref.clone(),
            beneficiary_ref: self.beneficiary_ref.clone(),
            amount_minor_units: self.amount_minor_units,
            currency: self.currency.clone(),
            executed_at,
            bank_reference: self.bank_reference.clone(),
        })
    }
}
