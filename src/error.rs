use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};

use crate::embedding::CacheError;
use crate::geo::TransformError;
use crate::image_source::ImageSourceError;
use crate::models::ModelError;
use crate::vectorize::VectorizeError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Everything a request can fail with, mapped to a status in one place.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Image(#[from] ImageSourceError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Invalid prompt transform: {0}")]
    Transform(#[from] TransformError),

    #[error("Failed to save image embeddings: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Vectorize(#[from] VectorizeError),

    #[error("No valid masks generated")]
    NoMasks,

    #[error("Server error: {0}")]
    Internal(String),
}

/// The `{status: "error", message}` envelope shared by handlers and catchers.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::BadRequest(_) | ApiError::Transform(_) | ApiError::NoMasks => Status::BadRequest,
            ApiError::Image(e) if e.is_client_error() => Status::BadRequest,
            ApiError::Model(e) if e.is_client_error() => Status::BadRequest,
            ApiError::Image(_)
            | ApiError::Model(_)
            | ApiError::Cache(_)
            | ApiError::Vectorize(_)
            | ApiError::Internal(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let message = self.to_string();
        if status.code >= 500 {
            tracing::error!(status = status.code, uri = %req.uri(), error = %message, "request failed");
        } else {
            tracing::warn!(status = status.code, uri = %req.uri(), error = %message, "request rejected");
        }

        Response::build_from(Json(ErrorBody::new(message)).respond_to(req)?)
            .status(status)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelKind;

    #[test]
    fn statuses_follow_the_error_taxonomy() {
        assert_eq!(ApiError::NoMasks.status(), Status::BadRequest);
        assert_eq!(
            ApiError::from(ImageSourceError::InvalidPath("/x".into())).status(),
            Status::BadRequest
        );
        assert_eq!(
            ApiError::from(ImageSourceError::Io(std::io::Error::other("disk"))).status(),
            Status::InternalServerError
        );
        assert_eq!(
            ApiError::from(ModelError::UnknownModelType("yolo".into())).status(),
            Status::BadRequest
        );
        assert_eq!(
            ApiError::from(ModelError::UnknownModel {
                kind: ModelKind::Sam2,
                id: "x".into(),
                available: String::new()
            })
            .status(),
            Status::BadRequest
        );
        assert_eq!(
            ApiError::from(ModelError::WeightsUnavailable("gone".into())).status(),
            Status::InternalServerError
        );
        assert_eq!(ApiError::Internal("boom".into()).status(), Status::InternalServerError);
    }

    #[test]
    fn messages_are_echoed() {
        assert_eq!(ApiError::NoMasks.to_string(), "No valid masks generated");
        assert_eq!(
            ApiError::from(ModelError::UnknownModelType("yolo".into())).to_string(),
            "Unknown model_type: yolo"
        );
        let body = serde_json::to_value(ErrorBody::new("nope")).unwrap();
        assert_eq!(body, serde_json::json!({"status": "error", "message": "nope"}));
    }
}
