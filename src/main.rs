use easyearth::{build_rocket, logging, AppConfig};

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    logging::init(&config);

    tracing::info!(run_mode = ?config.run_mode, "starting EasyEarth server");
    let _rocket = build_rocket(config)?.launch().await?;
    Ok(())
}
