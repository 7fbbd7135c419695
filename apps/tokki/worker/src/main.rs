//! Tokki Worker - Entry Point
//!
//! Consumes one worker queue and drains it on SIGINT/SIGTERM.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tokki_worker::run().await
}
