#[tokio::main]
async fn main() -> anyhow::Result<()> {
    daisy_lib::run().await
}
