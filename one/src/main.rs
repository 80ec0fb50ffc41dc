//! Entry point of the replica-one binary.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    replica_one::run().await
}
