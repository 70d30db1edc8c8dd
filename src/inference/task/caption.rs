use std::time::Instant;

use anyhow::Result;
use image::RgbImage;
use serde::Serialize;
use tracing::debug;

use crate::inference::image_processor::decode_image;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CaptionResponse {
    pub caption: String,
}

pub trait CaptionHandler: Send + Sync {
    /// Produces a caption for a decoded image. Implementations must not mutate shared state.
    fn run_caption(&self, image: &RgbImage) -> Result<CaptionResponse>;
}

/// Full request path minus HTTP: decode the uploaded bytes and caption them.
#[tracing::instrument(level = "info", skip_all, fields(size = bytes.len()))]
pub fn caption_image(handler: &dyn CaptionHandler, bytes: &[u8]) -> Result<CaptionResponse> {
    let image = decode_image(bytes)?;
    let start = Instant::now();
    let response = handler.run_caption(&image)?;
    debug!(
        "Captioned {}x{} image in {:?}",
        image.width(),
        image.height(),
        start.elapsed()
    );
    Ok(response)
}
