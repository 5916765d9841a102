#[tokio::main]
async fn main() -> anyhow::Result<()> {
    restarter::sup::cli::run().await
}
