#[tokio::main]
async fn main() -> anyhow::Result<()> {
    model_gateway::run().await
}
