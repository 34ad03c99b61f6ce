#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orderbook_coordinator=info".parse()?)
                .add_directive("orderbook_coordinator_lib=info".parse()?),
        )
        .init();

    orderbook_coordinator_lib::run().await?;
    Ok(())
}
