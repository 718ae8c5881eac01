use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub message: String,
    pub device: String,
    pub user_base_dir: Option<String>,
    pub run_mode: Option<String>,
}

/// Liveness plus the device inference runs on.
#[get("/ping")]
pub fn ping(state: &State<AppState>) -> Json<PingResponse> {
    Json(PingResponse {
        message: "Server is alive".to_string(),
        device: state.device().as_str().to_string(),
        user_base_dir: state.config.user_base_dir.clone(),
        run_mode: state.config.run_mode.clone(),
    })
}
