use gridload::demo::LoadDemo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoadDemo::run().await
}
