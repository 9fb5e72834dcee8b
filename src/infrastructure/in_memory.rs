use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::canonical;
use crate::domain::anchor::{AnchorRecord, AnchorStatus};
use crate::domain::payment::Payment;
use crate::domain::ports::{
    AnchorReceipt, AnchorSubmission, LedgerClient, OnChainAnchor, PaymentStore,
};
use crate::error::{AnchorError, LedgerError, Result};

/// Thread-safe in-memory payment store.
///
/// `Arc<RwLock<HashMap>>` maps give shared concurrent access with
/// consistent read-after-write; the external-reference index enforces the
/// caller-assigned uniqueness constraint.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<Uuid, Payment>>>,
    external_refs: Arc<RwLock<HashMap<String, Uuid>>>,
    anchors: Arc<RwLock<HashMap<Uuid, AnchorRecord>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn get(&self, id: Uuid) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(&id).cloned())
    }

    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Payment>> {
        let refs = self.external_refs.read().await;
        let Some(id) = refs.get(external_ref).copied() else {
            return Ok(None);
        };
        drop(refs);
        self.get(id).await
    }

    async fn save_payment(&self, payment: Payment) -> Result<()> {
        let mut refs = self.external_refs.write().await;
        match refs.get(&payment.external_ref) {
            Some(existing) if *existing != payment.id => {
                return Err(AnchorError::Validation(format!(
                    "external reference {} already in use",
                    payment.external_ref
                )));
            }
            _ => {
                refs.insert(payment.external_ref.clone(), payment.id);
            }
        }
        let mut payments = self.payments.write().await;
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn get_anchor_by_payment_id(&self, payment_id: Uuid) -> Result<Option<AnchorRecord>> {
        let anchors = self.anchors.read().await;
        Ok(anchors.get(&payment_id).cloned())
    }

    async fn save_anchor(&self, record: AnchorRecord) -> Result<()> {
        let mut anchors = self.anchors.write().await;
        anchors.insert(record.payment_id, record);
        Ok(())
    }

    async fn stale_pending_anchors(&self, cutoff: DateTime<Utc>) -> Result<Vec<AnchorRecord>> {
        let anchors = self.anchors.read().await;
        Ok(anchors
            .values()
            .filter(|r| r.status == AnchorStatus::Pending && r.updated_at < cutoff)
            .cloned()
            .collect())
    }
}

/// Event emitted by the ledger for each successful anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorEvent {
    pub record: OnChainAnchor,
}

/// Injectable submit/query failure for exercising retry paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerFault {
    Network,
    Timeout,
    Rejected,
}

impl LedgerFault {
    fn to_error(self) -> LedgerError {
        match self {
            Self::Network => LedgerError::Network("injected network failure".to_string()),
            Self::Timeout => LedgerError::Timeout,
            Self::Rejected => LedgerError::Rejected("injected rejection".to_string()),
        }
    }
}

/// In-memory stand-in for the external ledger.
///
/// Enforces the ledger's own contract locally: global hash uniqueness,
/// a single authorized writer identity, and an append-only event per
/// successful anchor. Keys are lowercased so uniqueness is case-insensitive
/// over the hex hash.
#[derive(Clone)]
pub struct InMemoryLedger {
    anchors: Arc<RwLock<HashMap<String, OnChainAnchor>>>,
    events: Arc<RwLock<Vec<AnchorEvent>>>,
    writer: String,
    authorized_writer: String,
    sequence: Arc<AtomicU64>,
    submit_calls: Arc<AtomicU64>,
    submit_fault: Arc<Mutex<Option<(LedgerFault, u32)>>>,
    query_fault: Arc<Mutex<Option<(LedgerFault, u32)>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_writer("anchor-operator", "anchor-operator")
    }

    /// Separate writer and authorized identities, for exercising the
    /// authorization failure path.
    pub fn with_writer(writer: impl Into<String>, authorized: impl Into<String>) -> Self {
        Self {
            anchors: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(Vec::new())),
            writer: writer.into(),
            authorized_writer: authorized.into(),
            sequence: Arc::new(AtomicU64::new(0)),
            submit_calls: Arc::new(AtomicU64::new(0)),
            submit_fault: Arc::new(Mutex::new(None)),
            query_fault: Arc::new(Mutex::new(None)),
        }
    }

    /// Makes the next `times` submissions fail with `fault`.
    pub async fn fail_submissions(&self, fault: LedgerFault, times: u32) {
        *self.submit_fault.lock().await = Some((fault, times));
    }

    /// Makes the next `times` queries fail with `fault`.
    pub async fn fail_queries(&self, fault: LedgerFault, times: u32) {
        *self.query_fault.lock().await = Some((fault, times));
    }

    /// Total submissions attempted, successful or not.
    pub fn submit_calls(&self) -> u64 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub async fn events(&self) -> Vec<AnchorEvent> {
        self.events.read().await.clone()
    }

    async fn take_fault(slot: &Mutex<Option<(LedgerFault, u32)>>) -> Option<LedgerError> {
        let mut guard = slot.lock().await;
        match guard.take() {
            Some((fault, times)) if times > 1 => {
                *guard = Some((fault, times - 1));
                Some(fault.to_error())
            }
            Some((fault, _)) => Some(fault.to_error()),
            None => None,
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit_anchor(
        &self,
        submission: &AnchorSubmission,
    ) -> std::result::Result<AnchorReceipt, LedgerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = Self::take_fault(&self.submit_fault).await {
            return Err(err);
        }
        if self.writer != self.authorized_writer {
            return Err(LedgerError::Unauthorized);
        }
        if submission.payment_hash.is_empty() {
            return Err(LedgerError::Rejected("empty payment hash".to_string()));
        }

        let key = submission.payment_hash.to_lowercase();
        let mut anchors = self.anchors.write().await;
        if anchors.contains_key(&key) {
            return Err(LedgerError::DuplicateHash);
        }

        let sequence_number = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let tx_ref = canonical::hash_payload(&format!("{key}:{sequence_number}"));
        let record = OnChainAnchor {
            payment_hash: submission.payment_hash.clone(),
            external_ref: submission.external_ref.clone(),
            amount_minor_units: submission.amount_minor_units,
            currency: submission.currency.clone(),
            executed_at_unix: submission.executed_at_unix,
            anchored_at_unix: Utc::now().timestamp(),
            anchored_by: self.writer.clone(),
        };
        anchors.insert(key, record.clone());
        drop(anchors);

        self.events.write().await.push(AnchorEvent { record });

        Ok(AnchorReceipt {
            tx_ref,
            sequence_number,
        })
    }

    async fn query_anchor(
        &self,
        payment_hash: &str,
    ) -> std::result::Result<Option<OnChainAnchor>, LedgerError> {
        if let Some(err) = Self::take_fault(&self.query_fault).await {
            return Err(err);
        }
        let anchors = self.anchors.read().await;
        Ok(anchors.get(&payment_hash.to_lowercase()).cloned())
    }

    async fn writer_identity(&self) -> std::result::Result<String, LedgerError> {
        Ok(self.writer.clone())
    }

    async fn total_anchored(&self) -> std::result::Result<u64, LedgerError> {
        let anchors = self.anchors.read().await;
        Ok(anchors.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::PaymentCommitment;

    fn submission(hash: &str, external_ref: &str) -> AnchorSubmission {
        AnchorSubmission {
            payment_hash: hash.to_string(),
            external_ref: external_ref.to_string(),
            amount_minor_units: 1_000,
            currency: "COP".to_string(),
            executed_at_unix: 1_717_243_845,
        }
    }

    #[tokio::test]
    async fn test_store_payment_roundtrip() {
        let store = InMemoryPaymentStore::new();
        let payment = Payment::new("PAY-1", "payer", "beneficiary", 500, "USD").unwrap();
        let id = payment.id;
        store.save_payment(payment).await.unwrap();

        assert!(store.get(id).await.unwrap().is_some());
        let by_ref = store.get_by_external_ref("PAY-1").await.unwrap().unwrap();
        assert_eq!(by_ref.id, id);
        assert!(store.get_by_external_ref("PAY-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_external_ref() {
        let store = InMemoryPaymentStore::new();
        let first = Payment::new("PAY-1", "a", "b", 1, "USD").unwrap();
        let second = Payment::new("PAY-1", "c", "d", 2, "USD").unwrap();
        store.save_payment(first).await.unwrap();
        assert!(matches!(
            store.save_payment(second).await,
            Err(AnchorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_pending_filter() {
        let store = InMemoryPaymentStore::new();
        let commitment = PaymentCommitment {
            canonical_payload: "{}".to_string(),
            payment_hash: "0xaa".to_string(),
        };
        let record = AnchorRecord::new(Uuid::now_v7(), &commitment, "devnet".to_string());
        store.save_anchor(record.clone()).await.unwrap();

        // Cutoff in the past: the fresh record is not stale.
        let past = Utc::now() - chrono::Duration::minutes(10);
        assert!(store.stale_pending_anchors(past).await.unwrap().is_empty());

        // Cutoff in the future: now it is.
        let future = Utc::now() + chrono::Duration::minutes(10);
        assert_eq!(store.stale_pending_anchors(future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_enforces_hash_uniqueness() {
        let ledger = InMemoryLedger::new();
        ledger.submit_anchor(&submission("0xAB", "PAY-1")).await.unwrap();
        // Same hash, different case: still a duplicate.
        let err = ledger
            .submit_anchor(&submission("0xab", "PAY-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateHash));
        assert_eq!(ledger.total_anchored().await.unwrap(), 1);
        assert_eq!(ledger.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_ledger_rejects_unauthorized_writer() {
        let ledger = InMemoryLedger::with_writer("intruder", "anchor-operator");
        let err = ledger
            .submit_anchor(&submission("0xab", "PAY-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized));
        assert_eq!(ledger.total_anchored().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writer_identity_reports_submitting_identity() {
        let ledger = InMemoryLedger::new();
        assert_eq!(ledger.writer_identity().await.unwrap(), "anchor-operator");

        // Split identities: the client still reports who it submits as,
        // not who the ledger would accept.
        let split = InMemoryLedger::with_writer("intruder", "anchor-operator");
        assert_eq!(split.writer_identity().await.unwrap(), "intruder");
    }

    #[tokio::test]
    async fn test_ledger_emits_event_per_anchor() {
        let ledger = InMemoryLedger::new();
        ledger.submit_anchor(&submission("0x01", "PAY-1")).await.unwrap();
        ledger.submit_anchor(&submission("0x02", "PAY-2")).await.unwrap();

        let events = ledger.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].record.external_ref, "PAY-1");
        assert_eq!(events[0].record.anchored_by, "anchor-operator");

        let queried = ledger.query_anchor("0x01").await.unwrap().unwrap();
        assert_eq!(queried.external_ref, "PAY-1");
    }

    #[tokio::test]
    async fn test_ledger_fault_injection_is_bounded() {
        let ledger = InMemoryLedger::new();
        ledger.fail_submissions(LedgerFault::Network, 2).await;

        assert!(ledger.submit_anchor(&submission("0x01", "PAY-1")).await.is_err());
        assert!(ledger.submit_anchor(&submission("0x01", "PAY-1")).await.is_err());
        assert!(ledger.submit_anchor(&submission("0x01", "PAY-1")).await.is_ok());
    }
}
