use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use payanchor::application::orchestrator::AnchorOrchestrator;
use payanchor::application::queue::AnchorQueue;
use payanchor::config::AnchorConfig;
use payanchor::domain::payment::Payment;
use payanchor::domain::ports::{LedgerClient, PaymentStore};
use payanchor::infrastructure::in_memory::{InMemoryLedger, InMemoryPaymentStore};
use payanchor::interfaces::json::read_payment_requests;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON scenario file: an array of payment requests to anchor
    scenario: PathBuf,

    /// Pipeline configuration file (JSON). Defaults apply if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the number of anchor workers
    #[arg(long)]
    workers: Option<usize>,

    /// Override the maximum anchor attempts per payment
    #[arg(long)]
    max_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let file = File::open(path).into_diagnostic()?;
            serde_json::from_reader(file).into_diagnostic()?
        }
        None => AnchorConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.retry.max_attempts = max_attempts;
    }

    let store = Arc::new(InMemoryPaymentStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let writer = ledger.writer_identity().await.into_diagnostic()?;
    tracing::info!(writer, network = %config.network, workers = config.workers, "anchoring pipeline ready");
    let orchestrator = Arc::new(AnchorOrchestrator::new(
        store.clone(),
        ledger,
        config.clone(),
    ));
    let queue = AnchorQueue::start(orchestrator.clone(), &config);

    let file = File::open(&cli.scenario).into_diagnostic()?;
    let requests = read_payment_requests(file).into_diagnostic()?;

    let mut external_refs = Vec::with_capacity(requests.len());
    for request in requests {
        let mut payment = Payment::new(
            request.external_id,
            request.payer_id,
            request.beneficiary_id,
            request.amount_minor_units,
            request.currency,
        )
        .into_diagnostic()?;
        payment
            .complete(request.bank_reference, Utc::now())
            .into_diagnostic()?;

        let payment_id = payment.id;
        external_refs.push(payment.external_ref.clone());
        store.save_payment(payment).await.into_diagnostic()?;
        queue.enqueue(payment_id).await.into_diagnostic()?;
    }

    queue.drain().await;
    queue.shutdown().await;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for external_ref in external_refs {
        let report = orchestrator
            .verify_payment_anchor(&external_ref)
            .await
            .into_diagnostic()?;
        serde_json::to_writer(&mut out, &report).into_diagnostic()?;
        writeln!(out).into_diagnostic()?;
    }

    Ok(())
}
