use tumor_api::{config, start_app, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::get_configuration()?;
    telemetry::init_tracing(&config.log_level);

    start_app(config).await?;

    Ok(())
}
