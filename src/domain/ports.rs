use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::anchor::AnchorRecord;
use super::payment::Payment;
use crate::error::{LedgerError, Result};

/// Single source of truth for payment and anchor state. Implementations
/// must provide consistent read-after-write within the process and
/// serialize concurrent updates to the same record.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Payment>>;
    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Payment>>;
    async fn save_payment(&self, payment: Payment) -> Result<()>;
    async fn get_anchor_by_payment_id(&self, payment_id: Uuid) -> Result<Option<AnchorRecord>>;
    async fn save_anchor(&self, record: AnchorRecord) -> Result<()>;
    /// Anchor records stuck in `PENDING` since before `cutoff`; feeds the
    /// recovery sweep.
    async fn stale_pending_anchors(&self, cutoff: DateTime<Utc>) -> Result<Vec<AnchorRecord>>;
}

/// What the orchestrator submits to the ledger for one anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorSubmission {
    pub payment_hash: String,
    pub external_ref: String,
    pub amount_minor_units: u64,
    pub currency: String,
    pub executed_at_unix: i64,
}

/// Confirmation of a successful ledger write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorReceipt {
    pub tx_ref: String,
    pub sequence_number: u64,
}

/// The authoritative on-chain record, exactly as committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainAnchor {
    pub payment_hash: String,
    pub external_ref: String,
    pub amount_minor_units: u64,
    pub currency: String,
    pub executed_at_unix: i64,
    pub anchored_at_unix: i64,
    pub anchored_by: String,
}

/// Boundary to the external append-only ledger. The ledger itself enforces
/// hash uniqueness and writer authorization; callers only react to the
/// outcomes.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn submit_anchor(
        &self,
        submission: &AnchorSubmission,
    ) -> std::result::Result<AnchorReceipt, LedgerError>;

    async fn query_anchor(
        &self,
        payment_hash: &str,
    ) -> std::result::Result<Option<OnChainAnchor>, LedgerError>;

    /// Identity this client submits anchors under.
    async fn writer_identity(&self) -> std::result::Result<String, LedgerError>;

    async fn total_anchored(&self) -> std::result::Result<u64, LedgerError>;
}

pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type LedgerClientRef = Arc<dyn LedgerClient>;
