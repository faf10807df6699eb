use outpost::{Config, Relay};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    outpost::init_tracing()?;

    let config = Config::load()?;

    let relay = Relay::connect_with().config(config).call().await?;

    relay.start();
    tracing::info!("outpost running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    relay.stop().await;

    Ok(())
}
