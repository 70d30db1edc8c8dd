use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::{CaptionError, CaptionResult};
use crate::inference::task::caption::{caption_image, CaptionHandler, CaptionResponse};

const IMAGE_FIELD: &str = "image";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) captioner: Arc<dyn CaptionHandler>,
}

pub(crate) fn router(state: AppState, max_upload_size: usize) -> Router {
    Router::new()
        .route("/caption", post(handle_caption_request))
        .layer(DefaultBodyLimit::max(max_upload_size))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[axum_macros::debug_handler]
async fn handle_caption_request(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> CaptionResult<(StatusCode, Json<CaptionResponse>)> {
    let Ok(mut multipart) = multipart else {
        return Err(CaptionError::no_image());
    };

    // First `image` part sent as a file wins, like a form file lookup
    let mut opt_image_bytes: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| CaptionError::new(err.status(), err.body_text()))?
    {
        if field.name() != Some(IMAGE_FIELD) || field.file_name().is_none() {
            debug!("Ignoring multipart field {:?}", field.name());
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|err| CaptionError::new(err.status(), err.body_text()))?;
        opt_image_bytes = Some(bytes);
        break;
    }

    let Some(image_bytes) = opt_image_bytes else {
        return Err(CaptionError::no_image());
    };

    let captioner = Arc::clone(&state.captioner);
    let response =
        tokio::task::spawn_blocking(move || caption_image(captioner.as_ref(), &image_bytes))
            .await??;

    Ok((StatusCode::OK, Json(response)))
}
