use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

const NO_IMAGE_MESSAGE: &str = "No image uploaded";

/// Failure of a caption request, rendered as `{"error": ...}`.
///
/// Rejected uploads carry a 4xx status. Everything that goes wrong while decoding or running the
/// model converts through `From` and becomes a 500 carrying the error's message.
#[derive(Debug)]
pub struct CaptionError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
}

impl CaptionError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        CaptionError {
            status,
            message: HttpErrorResponse {
                error: message.into(),
            },
        }
    }

    /// The request has no `image` file part.
    pub fn no_image() -> Self {
        Self::new(StatusCode::BAD_REQUEST, NO_IMAGE_MESSAGE)
    }
}

impl IntoResponse for CaptionError {
    fn into_response(self) -> Response {
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

impl<E> From<E> for CaptionError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.into().to_string())
    }
}

pub type CaptionResult<T, E = CaptionError> = Result<T, E>;
