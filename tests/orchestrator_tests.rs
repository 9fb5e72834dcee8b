mod common;

use chrono::Utc;
use uuid::Uuid;

use common::{completed_payment, harness};
use payanchor::application::orchestrator::AnchorOutcome;
use payanchor::canonical;
use payanchor::domain::anchor::AnchorStatus;
use payanchor::domain::payment::{Payment, PaymentStatus};
use payanchor::domain::ports::{LedgerClient, PaymentStore};
use payanchor::error::AnchorError;
use payanchor::infrastructure::in_memory::LedgerFault;

#[tokio::test]
async fn test_anchor_happy_path() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 150_000_000, "COP").await;

    let outcome = h.orchestrator.anchor_payment(payment_id).await.unwrap();
    assert_eq!(outcome, AnchorOutcome::Anchored);

    let payment = h.store.get(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Anchored);

    let record = h
        .store
        .get_anchor_by_payment_id(payment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, AnchorStatus::Anchored);
    assert!(record.tx_ref.is_some());
    assert_eq!(record.sequence_number, Some(1));
    assert!(record.anchored_at.is_some());
    assert!(canonical::verify_payload(
        &record.canonical_payload,
        &record.payment_hash
    ));

    // The ledger holds exactly this anchor and emitted one event for it.
    let on_chain = h
        .ledger
        .query_anchor(&record.payment_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_chain.external_ref, "PAY-1");
    assert_eq!(on_chain.amount_minor_units, 150_000_000);
    assert_eq!(h.ledger.events().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_payment_is_not_found() {
    let h = harness();
    let err = h.orchestrator.anchor_payment(Uuid::now_v7()).await.unwrap_err();
    assert!(matches!(err, AnchorError::PaymentNotFound(_)));
}

#[tokio::test]
async fn test_pending_payment_is_invalid_state() {
    let h = harness();
    let payment = Payment::new("PAY-1", "a", "b", 100, "USD").unwrap();
    let payment_id = payment.id;
    h.store.save_payment(payment).await.unwrap();

    let err = h.orchestrator.anchor_payment(payment_id).await.unwrap_err();
    assert!(matches!(
        err,
        AnchorError::InvalidState {
            status: PaymentStatus::Pending,
            ..
        }
    ));
    // No anchor record is created for an ineligible payment.
    assert!(h
        .store
        .get_anchor_by_payment_id(payment_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_second_invocation_short_circuits_without_ledger_call() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;

    assert_eq!(
        h.orchestrator.anchor_payment(payment_id).await.unwrap(),
        AnchorOutcome::Anchored
    );
    assert_eq!(h.ledger.submit_calls(), 1);

    assert_eq!(
        h.orchestrator.anchor_payment(payment_id).await.unwrap(),
        AnchorOutcome::AlreadyAnchored
    );
    // At-most-once effective submission: the count did not move.
    assert_eq!(h.ledger.submit_calls(), 1);
}

#[tokio::test]
async fn test_crash_between_success_writes_self_heals() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;
    h.orchestrator.anchor_payment(payment_id).await.unwrap();

    // Simulate the payment write being lost: anchor record ANCHORED,
    // payment rolled back to COMPLETED.
    let mut payment = Payment::new("PAY-1-X", "a", "b", 1_000, "COP").unwrap();
    payment.id = payment_id;
    payment.external_ref = "PAY-1".to_string();
    payment.complete(None, Utc::now()).unwrap();
    h.store.save_payment(payment).await.unwrap();

    let outcome = h.orchestrator.anchor_payment(payment_id).await.unwrap();
    assert_eq!(outcome, AnchorOutcome::AlreadyAnchored);
    assert_eq!(h.ledger.submit_calls(), 1);

    let repaired = h.store.get(payment_id).await.unwrap().unwrap();
    assert_eq!(repaired.status, PaymentStatus::Anchored);
}

#[tokio::test]
async fn test_duplicate_hash_reconciles_to_anchored() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;

    // First run anchors normally.
    h.orchestrator.anchor_payment(payment_id).await.unwrap();

    // Wipe the local anchor record so the orchestrator resubmits the same
    // hash; the ledger will reject it as a duplicate.
    let record = h
        .store
        .get_anchor_by_payment_id(payment_id)
        .await
        .unwrap()
        .unwrap();
    let mut payment = h.store.get(payment_id).await.unwrap().unwrap();
    payment.status = PaymentStatus::Completed;
    h.store.save_payment(payment).await.unwrap();
    let fresh = payanchor::domain::anchor::AnchorRecord::new(
        payment_id,
        &payanchor::canonical::PaymentCommitment {
            canonical_payload: record.canonical_payload.clone(),
            payment_hash: record.payment_hash.clone(),
        },
        "devnet".to_string(),
    );
    h.store.save_anchor(fresh).await.unwrap();

    let outcome = h.orchestrator.anchor_payment(payment_id).await.unwrap();
    assert_eq!(outcome, AnchorOutcome::Anchored);

    let converged = h
        .store
        .get_anchor_by_payment_id(payment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(converged.status, AnchorStatus::Anchored);
    // Convergence claimed no transaction of its own.
    assert!(converged.tx_ref.is_none());
    assert_eq!(h.ledger.total_anchored().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failure_is_recorded_before_propagation() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;
    h.ledger.fail_submissions(LedgerFault::Network, 1).await;

    let err = h.orchestrator.anchor_payment(payment_id).await.unwrap_err();
    assert!(err.is_retryable());

    let record = h
        .store
        .get_anchor_by_payment_id(payment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, AnchorStatus::Failed);
    assert_eq!(record.retry_count, 1);
    assert!(record.last_error.unwrap().contains("network"));

    // The payment itself stays eligible for re-anchoring.
    let payment = h.store.get(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn test_retry_after_failure_rebuilds_and_anchors() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;
    h.ledger.fail_submissions(LedgerFault::Timeout, 1).await;

    assert!(h.orchestrator.anchor_payment(payment_id).await.is_err());
    let outcome = h.orchestrator.anchor_payment(payment_id).await.unwrap();
    assert_eq!(outcome, AnchorOutcome::Anchored);

    let record = h
        .store
        .get_anchor_by_payment_id(payment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, AnchorStatus::Anchored);
    assert_eq!(record.retry_count, 1);
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn test_rejection_is_not_retryable() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;
    h.ledger.fail_submissions(LedgerFault::Rejected, 1).await;

    let err = h.orchestrator.anchor_payment(payment_id).await.unwrap_err();
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_verify_unknown_external_ref() {
    let h = harness();
    let report = h.orchestrator.verify_payment_anchor("NOPE").await.unwrap();
    assert!(!report.found);
    assert!(report.payment.is_none());
    assert!(report.verification.is_none());
}

#[tokio::test]
async fn test_verify_payment_without_anchor_record() {
    let h = harness();
    completed_payment(&h.store, "PAY-1", 1_000, "COP").await;

    let report = h.orchestrator.verify_payment_anchor("PAY-1").await.unwrap();
    assert!(report.found);
    assert_eq!(report.is_anchored, Some(false));
    assert!(report.anchor.is_none());
    assert!(report.verification.is_none());
}

#[tokio::test]
async fn test_verify_anchored_payment_full_report() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;
    h.orchestrator.anchor_payment(payment_id).await.unwrap();

    let report = h.orchestrator.verify_payment_anchor("PAY-1").await.unwrap();
    assert!(report.found);
    assert_eq!(report.is_anchored, Some(true));

    let checks = report.verification.unwrap();
    assert!(checks.local_hash_valid);
    assert!(checks.on_chain_confirmed);
    assert_eq!(checks.on_chain_record.unwrap().external_ref, "PAY-1");
    assert!(checks.on_chain_error.is_none());
}

#[tokio::test]
async fn test_verify_detects_local_tampering() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;
    h.orchestrator.anchor_payment(payment_id).await.unwrap();

    let mut record = h
        .store
        .get_anchor_by_payment_id(payment_id)
        .await
        .unwrap()
        .unwrap();
    record.canonical_payload = record.canonical_payload.replace("1000", "9000");
    h.store.save_anchor(record).await.unwrap();

    let report = h.orchestrator.verify_payment_anchor("PAY-1").await.unwrap();
    let checks = report.verification.unwrap();
    assert!(!checks.local_hash_valid);
    // The on-chain side is independent and still confirms.
    assert!(checks.on_chain_confirmed);
}

#[tokio::test]
async fn test_verify_reports_ledger_outage_instead_of_failing() {
    let h = harness();
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;
    h.orchestrator.anchor_payment(payment_id).await.unwrap();

    h.ledger.fail_queries(LedgerFault::Network, 1).await;
    let report = h.orchestrator.verify_payment_anchor("PAY-1").await.unwrap();
    let checks = report.verification.unwrap();
    assert!(checks.local_hash_valid);
    assert!(!checks.on_chain_confirmed);
    assert!(checks.on_chain_error.unwrap().contains("network"));
}

#[tokio::test]
async fn test_stale_pending_sweep_lists_abandoned_records() {
    let mut config = common::fast_config();
    config.stale_after_secs = 0;
    let h = common::harness_with(config);
    let payment_id = completed_payment(&h.store, "PAY-1", 1_000, "COP").await;

    // Leave a PENDING record behind, as a crashed run would.
    h.ledger.fail_submissions(LedgerFault::Network, 1).await;
    assert!(h.orchestrator.anchor_payment(payment_id).await.is_err());
    let mut record = h
        .store
        .get_anchor_by_payment_id(payment_id)
        .await
        .unwrap()
        .unwrap();
    record.status = AnchorStatus::Pending;
    record.updated_at = Utc::now() - chrono::Duration::seconds(5);
    h.store.save_anchor(record).await.unwrap();

    let stale = h.orchestrator.stale_pending().await.unwrap();
    assert_eq!(stale, vec![payment_id]);
}
