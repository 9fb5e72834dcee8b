use chrono::{TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use payanchor::application::orchestrator::AnchorOrchestrator;
use payanchor::config::{AnchorConfig, RetryConfig};
use payanchor::domain::payment::Payment;
use payanchor::domain::ports::PaymentStore;
use payanchor::infrastructure::in_memory::{InMemoryLedger, InMemoryPaymentStore};

/// Config with millisecond backoff so retry paths run fast in tests.
pub fn fast_config() -> AnchorConfig {
    AnchorConfig {
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            multiplier: 2.0,
        },
        ..AnchorConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<InMemoryPaymentStore>,
    pub ledger: Arc<InMemoryLedger>,
    pub orchestrator: Arc<AnchorOrchestrator>,
    pub config: AnchorConfig,
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: AnchorConfig) -> Harness {
    let store = Arc::new(InMemoryPaymentStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let orchestrator = Arc::new(AnchorOrchestrator::new(
        store.clone(),
        ledger.clone(),
        config.clone(),
    ));
    Harness {
        store,
        ledger,
        orchestrator,
        config,
    }
}

/// Creates a completed payment ready for anchoring and returns its id.
pub async fn completed_payment(
    store: &InMemoryPaymentStore,
    external_ref: &str,
    amount_minor_units: u64,
    currency: &str,
) -> Uuid {
    let mut payment = Payment::new(
        external_ref,
        format!("payer-{external_ref}"),
        format!("beneficiary-{external_ref}"),
        amount_minor_units,
        currency,
    )
    .unwrap();
    payment
        .complete(
            Some(format!("BANK-{external_ref}")),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        )
        .unwrap();
    let id = payment.id;
    store.save_payment(payment).await.unwrap();
    id
}
