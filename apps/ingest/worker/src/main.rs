//! GitHub Ingest Worker
//!
//! Binary entry point for the NATS-based ingestion worker.

#[tokio::main]
async fn main() {
    if let Err(e) = ingest_worker::run().await {
        eprintln!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
