//! Messaging-patterns teaching server - entry point.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    server::run().await
}
