use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use candle_transformers::models::{blip, blip_text};
use clap::ValueEnum;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::inference::caption_pipeline::CaptionGeneratorPipeline;
use crate::inference::models::model::ModelBase;
use crate::inference::task::caption::{CaptionHandler, CaptionResponse};

#[derive(ValueEnum, Deserialize, Serialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlipVariant {
    /// `Salesforce/blip-image-captioning-base`
    #[default]
    Base,
    /// `Salesforce/blip-image-captioning-large`
    Large,
}

impl BlipVariant {
    pub fn config(self) -> blip::Config {
        match self {
            BlipVariant::Base => blip_base_config(),
            BlipVariant::Large => blip::Config::image_captioning_large(),
        }
    }
}

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = blip::VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: 384,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

#[derive(Clone)]
pub struct BlipModel {
    generator_pipeline: CaptionGeneratorPipeline,
}

impl BlipModel {
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "info", skip(api, device))]
    pub fn new(
        api: Api,
        base: &ModelBase,
        variant: BlipVariant,
        weights_filename: &str,
        tokenizer_repo_id: &str,
        tokenizer_filename: &str,
        device: Device,
        max_length: usize,
    ) -> Result<Self> {
        let repo = api.repo(Repo::with_revision(
            base.repo_id.clone(),
            RepoType::Model,
            base.repo_revision.clone(),
        ));
        let tokenizer_repo = api.model(tokenizer_repo_id.to_string());

        let weights_file = fetch(&repo, weights_filename)?;
        let tokenizer_file = fetch(&tokenizer_repo, tokenizer_filename)?;
        info!(
            "Loading {} ({} license) weights from {}",
            base.name,
            base.license,
            weights_file.display()
        );

        let config = variant.config();
        let generator_pipeline = if is_gguf(&weights_file) {
            CaptionGeneratorPipeline::with_quantized_gguf(
                &config,
                &tokenizer_file,
                &weights_file,
                device,
                max_length,
            )?
        } else {
            CaptionGeneratorPipeline::with_safetensors(
                &config,
                &tokenizer_file,
                &weights_file,
                device,
                max_length,
            )?
        };

        Ok(Self { generator_pipeline })
    }

    pub fn device(&self) -> &Device {
        self.generator_pipeline.device()
    }
}

impl CaptionHandler for BlipModel {
    #[tracing::instrument(level = "info", skip_all)]
    fn run_caption(&self, image: &RgbImage) -> Result<CaptionResponse> {
        let caption = self.generator_pipeline.generate(image)?;
        Ok(CaptionResponse { caption })
    }
}

/// Local paths win over hub files so the server can run offline.
fn fetch(repo: &ApiRepo, filename: &str) -> Result<PathBuf> {
    let local = Path::new(filename);
    if local.is_file() {
        return Ok(local.to_path_buf());
    }
    repo.get(filename)
        .with_context(|| format!("Failed to fetch {filename}"))
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("gguf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_and_large_differ_in_vision_width() {
        let base = BlipVariant::Base.config();
        let large = BlipVariant::Large.config();

        assert_eq!(base.vision_config.hidden_size, 768);
        assert_eq!(large.vision_config.hidden_size, 1024);
        assert_eq!(base.vision_config.image_size, 384);
        assert_eq!(large.vision_config.image_size, 384);
        assert_eq!(base.text_config.vocab_size, large.text_config.vocab_size);
    }

    #[test]
    fn weights_format_follows_extension() {
        assert!(is_gguf(Path::new("blip-image-captioning-large-q4k.gguf")));
        assert!(is_gguf(Path::new("/models/BLIP.GGUF")));
        assert!(!is_gguf(Path::new("model.safetensors")));
        assert!(!is_gguf(Path::new("gguf")));
    }

    #[test]
    fn existing_local_files_skip_the_hub() {
        let api = Api::new().unwrap();
        let repo = api.model("Salesforce/blip-image-captioning-base".to_string());
        let path = fetch(&repo, "Cargo.toml").unwrap();
        assert_eq!(path, PathBuf::from("Cargo.toml"));
    }
}
