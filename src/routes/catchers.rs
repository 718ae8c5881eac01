//! JSON bodies for errors raised before a handler runs.

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::Request;

use crate::error::ErrorBody;

#[catch(400)]
pub fn bad_request(_req: &Request) -> Json<ErrorBody> {
    Json(ErrorBody::new("Bad request"))
}

#[catch(404)]
pub fn not_found(req: &Request) -> Json<ErrorBody> {
    Json(ErrorBody::new(format!("No route for {}", req.uri())))
}

#[catch(422)]
pub fn unprocessable(_req: &Request) -> Json<ErrorBody> {
    Json(ErrorBody::new("Malformed request body"))
}

#[catch(default)]
pub fn default(status: Status, _req: &Request) -> Json<ErrorBody> {
    Json(ErrorBody::new(format!("Server error: {}", status)))
}
