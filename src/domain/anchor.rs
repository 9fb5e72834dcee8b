use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::canonical::PaymentCommitment;
use crate::error::{AnchorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnchorStatus {
    Pending,
    Anchored,
    Failed,
}

impl AnchorStatus {
    /// `Anchored` is terminal and immutable; a failed record may re-enter
    /// `Pending` for another attempt.
    pub fn can_transition_to(self, next: AnchorStatus) -> bool {
        use AnchorStatus::*;
        matches!(
            (self, next),
            (Pending, Anchored) | (Pending, Failed) | (Failed, Pending)
        )
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Anchored => "ANCHORED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One payment's commitment to the ledger. Exactly one per payment, created
/// lazily on the first anchor attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub payment_id: Uuid,
    /// The exact serialized string that was hashed, retained for
    /// re-verification.
    pub canonical_payload: String,
    pub payment_hash: String,
    pub status: AnchorStatus,
    pub network: String,
    pub tx_ref: Option<String>,
    pub sequence_number: Option<u64>,
    pub anchored_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnchorRecord {
    pub fn new(payment_id: Uuid, commitment: &PaymentCommitment, network: String) -> Self {
        let now = Utc::now();
        Self {
            payment_id,
            canonical_payload: commitment.canonical_payload.clone(),
            payment_hash: commitment.payment_hash.clone(),
            status: AnchorStatus::Pending,
            network,
            tx_ref: None,
            sequence_number: None,
            anchored_at: None,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: AnchorStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AnchorError::InvalidAnchorTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Finalizes the record after a confirmed ledger write. The transaction
    /// reference is absent when convergence happened via duplicate
    /// reconciliation rather than our own submission.
    pub fn mark_anchored(
        &mut self,
        tx_ref: Option<String>,
        sequence_number: Option<u64>,
        anchored_at: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(AnchorStatus::Anchored)?;
        self.tx_ref = tx_ref;
        self.sequence_number = sequence_number;
        self.anchored_at = Some(anchored_at);
        self.last_error = None;
        Ok(())
    }

    /// Records a failed attempt. The retry count reflects the number of
    /// attempts made so far.
    pub fn mark_failed(&mut self, error: &str) -> Result<()> {
        self.transition(AnchorStatus::Failed)?;
        self.last_error = Some(error.to_string());
        self.retry_count += 1;
        Ok(())
    }

    /// Re-enters `Pending` with a freshly rebuilt payload and hash.
    pub fn reset_for_retry(&mut self, commitment: &PaymentCommitment) -> Result<()> {
        self.transition(AnchorStatus::Pending)?;
        self.rebuild_commitment(commitment);
        Ok(())
    }

    /// Recomputes payload and hash in place without a status change. Used
    /// when a record was left `Pending` by an interrupted run.
    pub fn rebuild_commitment(&mut self, commitment: &PaymentCommitment) {
        self.canonical_payload = commitment.canonical_payload.clone();
        self.payment_hash = commitment.payment_hash.clone();
        self.updated_at = Utc::now();
    }
}
