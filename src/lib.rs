//! EasyEarth: an HTTP service that runs SAM-family and semantic segmentation
//! models on (geo)rasters and answers with GeoJSON features.

#[macro_use]
extern crate rocket;

pub mod config;
pub mod embedding;
pub mod error;
pub mod geo;
pub mod image_source;
pub mod logging;
pub mod models;
pub mod prompt;
pub mod routes;
pub mod state;
pub mod vectorize;

use rocket::figment::providers::Env;
use rocket::figment::Figment;
use rocket::{Build, Rocket};

pub use config::AppConfig;
pub use state::{AppState, StartupError};

pub const DEFAULT_PORT: u16 = 3781;

/// Rocket settings: listen on all interfaces at [`DEFAULT_PORT`] unless
/// `ROCKET_*` variables say otherwise.
pub fn rocket_figment() -> Figment {
    Figment::from(rocket::Config::default())
        .merge(("address", "0.0.0.0"))
        .merge(("port", DEFAULT_PORT))
        .merge(Env::prefixed("ROCKET_").global())
}

/// Assemble the server without launching it.
pub fn build_rocket(config: AppConfig) -> Result<Rocket<Build>, StartupError> {
    let state = AppState::new(config)?;
    let api = routes![routes::ping::ping, routes::predict::predict];

    Ok(rocket::custom(rocket_figment())
        .manage(state)
        .mount("/", routes![routes::welcome::index])
        .mount("/", api.clone())
        .mount("/v1/easyearth", api)
        .register(
            "/",
            catchers![
                routes::catchers::bad_request,
                routes::catchers::not_found,
                routes::catchers::unprocessable,
                routes::catchers::default
            ],
        ))
}
