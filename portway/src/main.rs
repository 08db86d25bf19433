use portway::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    let state = AppState::from_config(config.clone()).await?;
    if let Some(bus) = state.bus() {
        bus.start().await?;
    }

    Server::new(config).serve(state).await?;
    Ok(())
}
