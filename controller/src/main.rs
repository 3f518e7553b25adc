#[tokio::main]
async fn main() -> anyhow::Result<()> {
    autoprint_controller::host::run().await
}
