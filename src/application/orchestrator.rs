use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::canonical::{self, CanonicalFields, PaymentCommitment};
use crate::config::AnchorConfig;
use crate::domain::anchor::{AnchorRecord, AnchorStatus};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::domain::ports::{
    AnchorSubmission, LedgerClientRef, OnChainAnchor, PaymentStoreRef,
};
use crate::error::{AnchorError, LedgerError, Result};

/// Per-payment anchoring workflow.
///
/// Holds no long-lived entity state; every invocation loads fresh copies
/// from the store and writes them back explicitly. The orchestrator never
/// retries internally; failures are recorded on the anchor record and
/// propagated to the queue, which owns the retry policy.
pub struct AnchorOrchestrator {
    store: PaymentStoreRef,
    ledger: LedgerClientRef,
    config: AnchorConfig,
}

/// How an anchoring invocation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorOutcome {
    /// A new anchor was written to the ledger (or converged via duplicate
    /// reconciliation).
    Anchored,
    /// The payment was already anchored; no ledger call was made.
    AlreadyAnchored,
}

impl AnchorOrchestrator {
    pub fn new(store: PaymentStoreRef, ledger: LedgerClientRef, config: AnchorConfig) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    /// Runs the anchoring workflow for one payment.
    ///
    /// Preconditions: the payment exists and is `COMPLETED` (or already
    /// `ANCHORED`, in which case the call is an idempotent no-op). The
    /// pending anchor record is persisted before the ledger submission so a
    /// crash mid-flight is recoverable by re-deriving the same hash.
    pub async fn anchor_payment(&self, payment_id: Uuid) -> Result<AnchorOutcome> {
        info!(%payment_id, "processing payment anchor");

        let mut payment = self
            .store
            .get(payment_id)
            .await?
            .ok_or(AnchorError::PaymentNotFound(payment_id))?;

        match payment.status {
            PaymentStatus::Completed | PaymentStatus::Anchored => {}
            status => {
                return Err(AnchorError::InvalidState {
                    id: payment_id,
                    status,
                });
            }
        }

        let existing = self.store.get_anchor_by_payment_id(payment_id).await?;

        // Idempotency short-circuit: at most one effective submission per
        // payment. Also heals a crash between the two success writes by
        // re-propagating the anchor status to the payment.
        if let Some(record) = &existing {
            if record.status == AnchorStatus::Anchored {
                if payment.status != PaymentStatus::Anchored {
                    payment.mark_anchored()?;
                    self.store.save_payment(payment).await?;
                    info!(%payment_id, "repaired payment status from anchored record");
                } else {
                    info!(%payment_id, "payment already anchored");
                }
                return Ok(AnchorOutcome::AlreadyAnchored);
            }
        }
        if payment.status == PaymentStatus::Anchored {
            // An anchored payment without an anchored record means local
            // state was corrupted out-of-band; refuse to guess.
            return Err(AnchorError::InvalidState {
                id: payment_id,
                status: payment.status,
            });
        }

        let fields = payment.canonical_fields()?;
        let commitment = canonical::generate_payment_hash(&fields)?;
        info!(%payment_id, payment_hash = %commitment.payment_hash, "generated payment hash");

        let mut record = match existing {
            Some(mut record) if record.status == AnchorStatus::Failed => {
                record.reset_for_retry(&commitment)?;
                record
            }
            // Left PENDING by an interrupted run; rebuild in place.
            Some(mut record) => {
                record.rebuild_commitment(&commitment);
                record
            }
            None => AnchorRecord::new(payment_id, &commitment, self.config.network.clone()),
        };

        // Durable before the ledger call.
        self.store.save_anchor(record.clone()).await?;

        let submission = AnchorSubmission {
            payment_hash: commitment.payment_hash.clone(),
            external_ref: payment.external_ref.clone(),
            amount_minor_units: payment.amount_minor_units,
            currency: payment.currency.clone(),
            executed_at_unix: fields.executed_at.timestamp(),
        };

        match self.submit(&submission, &fields, &commitment).await {
            Ok(confirmation) => {
                record.mark_anchored(
                    confirmation.tx_ref,
                    confirmation.sequence_number,
                    confirmation.anchored_at,
                )?;
                self.store.save_anchor(record).await?;
                payment.mark_anchored()?;
                self.store.save_payment(payment).await?;
                info!(%payment_id, "payment anchored successfully");
                Ok(AnchorOutcome::Anchored)
            }
            Err(err) => {
                self.record_failure(record, &err).await;
                Err(err)
            }
        }
    }

    /// Submits to the ledger with a bounded confirmation wait, reconciling
    /// ledger-side duplicate rejections by re-querying the authoritative
    /// record.
    async fn submit(
        &self,
        submission: &AnchorSubmission,
        fields: &CanonicalFields,
        commitment: &PaymentCommitment,
    ) -> Result<Confirmation> {
        let result = tokio::time::timeout(
            self.config.submit_timeout(),
            self.ledger.submit_anchor(submission),
        )
        .await;

        match result {
            Err(_elapsed) => Err(LedgerError::Timeout.into()),
            Ok(Ok(receipt)) => Ok(Confirmation {
                tx_ref: Some(receipt.tx_ref),
                sequence_number: Some(receipt.sequence_number),
                anchored_at: Utc::now(),
            }),
            Ok(Err(LedgerError::DuplicateHash)) => {
                self.reconcile_duplicate(submission, fields, commitment).await
            }
            Ok(Err(err)) => Err(err.into()),
        }
    }

    /// The ledger rejected the hash as already anchored. If the on-chain
    /// record matches this payment's own recomputed commitment, the anchor
    /// effectively succeeded on an earlier attempt; converge instead of
    /// failing.
    async fn reconcile_duplicate(
        &self,
        submission: &AnchorSubmission,
        fields: &CanonicalFields,
        commitment: &PaymentCommitment,
    ) -> Result<Confirmation> {
        let on_chain = self.ledger.query_anchor(&commitment.payment_hash).await?;
        match on_chain {
            Some(record)
                if record.external_ref == fields.external_ref
                    && record
                        .payment_hash
                        .eq_ignore_ascii_case(&commitment.payment_hash) =>
            {
                info!(
                    payment_hash = %commitment.payment_hash,
                    "duplicate submission reconciled against existing on-chain anchor"
                );
                let anchored_at = Utc
                    .timestamp_opt(record.anchored_at_unix, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                Ok(Confirmation {
                    tx_ref: None,
                    sequence_number: None,
                    anchored_at,
                })
            }
            Some(_) => Err(AnchorError::HashCollision),
            None => Err(LedgerError::Rejected(format!(
                "ledger reported duplicate for {} but holds no such anchor",
                submission.payment_hash
            ))
            .into()),
        }
    }

    /// Best-effort failure recording so state stays inspectable even if the
    /// caller drops the error.
    async fn record_failure(&self, mut record: AnchorRecord, err: &AnchorError) {
        warn!(payment_id = %record.payment_id, error = %err, "anchor attempt failed");
        if let Err(transition_err) = record.mark_failed(&err.to_string()) {
            warn!(payment_id = %record.payment_id, error = %transition_err, "could not mark anchor record failed");
            return;
        }
        if let Err(save_err) = self.store.save_anchor(record).await {
            warn!(error = %save_err, "could not persist anchor failure");
        }
    }

    /// Read-only composite verification of a payment's anchor by external
    /// reference. Never fails on ledger unreachability; the on-chain block
    /// carries an explicit error instead.
    pub async fn verify_payment_anchor(&self, external_ref: &str) -> Result<VerificationReport> {
        let Some(payment) = self.store.get_by_external_ref(external_ref).await? else {
            return Ok(VerificationReport::not_found());
        };

        let Some(record) = self.store.get_anchor_by_payment_id(payment.id).await? else {
            return Ok(VerificationReport {
                found: true,
                is_anchored: Some(false),
                payment: Some(PaymentSummary::from(&payment)),
                anchor: None,
                verification: None,
            });
        };

        let local_hash_valid =
            canonical::verify_payload(&record.canonical_payload, &record.payment_hash);

        let (on_chain_confirmed, on_chain_record, on_chain_error) =
            match self.ledger.query_anchor(&record.payment_hash).await {
                Ok(Some(on_chain)) => (true, Some(on_chain), None),
                Ok(None) => (false, None, None),
                Err(err) => {
                    warn!(external_ref, error = %err, "on-chain verification unavailable");
                    (false, None, Some(err.to_string()))
                }
            };

        Ok(VerificationReport {
            found: true,
            is_anchored: Some(record.status == AnchorStatus::Anchored),
            payment: Some(PaymentSummary::from(&payment)),
            anchor: Some(AnchorSummary::from(&record)),
            verification: Some(VerificationChecks {
                local_hash_valid,
                on_chain_confirmed,
                on_chain_record,
                on_chain_error,
            }),
        })
    }

    /// Payments whose anchor record has been `PENDING` beyond the staleness
    /// threshold, for re-enqueueing by the recovery sweep.
    pub async fn stale_pending(&self) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_after())
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let records = self.store.stale_pending_anchors(cutoff).await?;
        Ok(records.into_iter().map(|r| r.payment_id).collect())
    }
}

struct Confirmation {
    tx_ref: Option<String>,
    sequence_number: Option<u64>,
    anchored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    pub external_ref: String,
    pub status: PaymentStatus,
    pub amount_minor_units: u64,
    pub currency: String,
    pub executed_at: Option<DateTime<Utc>>,
}

impl From<&Payment> for PaymentSummary {
    fn from(payment: &Payment) -> Self {
        Self {
            external_ref: payment.external_ref.clone(),
            status: payment.status,
            amount_minor_units: payment.amount_minor_units,
            currency: payment.currency.clone(),
            executed_at: payment.executed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorSummary {
    pub status: AnchorStatus,
    pub payment_hash: String,
    pub tx_ref: Option<String>,
    pub sequence_number: Option<u64>,
    pub anchored_at: Option<DateTime<Utc>>,
    pub network: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl From<&AnchorRecord> for AnchorSummary {
    fn from(record: &AnchorRecord) -> Self {
        Self {
            status: record.status,
            payment_hash: record.payment_hash.clone(),
            tx_ref: record.tx_ref.clone(),
            sequence_number: record.sequence_number,
            anchored_at: record.anchored_at,
            network: record.network.clone(),
            retry_count: record.retry_count,
            last_error: record.last_error.clone(),
        }
    }
}

/// Local and on-chain checks are independent; a mismatch in either is
/// surfaced, never hidden.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationChecks {
    pub local_hash_valid: bool,
    pub on_chain_confirmed: bool,
    pub on_chain_record: Option<OnChainAnchor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_chain_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_anchored: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationChecks>,
}

impl VerificationReport {
    fn not_found() -> Self {
        Self {
            found: false,
            is_anchored: None,
            payment: None,
            anchor: None,
            verification: None,
        }
    }
}
