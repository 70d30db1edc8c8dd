use std::path::Path;

use anyhow::{Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{blip, quantized_blip};
use image::RgbImage;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::inference::image_processor::preprocess;

/// `[DEC]`, the token BLIP starts every caption with
pub const BOS_TOKEN_ID: u32 = 30522;
/// `[SEP]`, ends the caption
pub const SEP_TOKEN_ID: u32 = 102;

// Sampling is disabled so the seed never influences the output
const GREEDY_SEED: u64 = 299_792_458;

// Taken from
// https://github.com/huggingface/candle/blob/main/candle-examples/examples/blip/main.rs
#[derive(Clone)]
pub struct CaptionGeneratorPipeline {
    model: Model,
    tokenizer: Tokenizer,
    device: Device,
    image_size: usize,
    max_length: usize,
}

#[derive(Clone)]
pub enum Model {
    Full(blip::BlipForConditionalGeneration),
    Quantized(quantized_blip::BlipForConditionalGeneration),
}

impl Model {
    fn embed_image(&self, image: &Tensor) -> Result<Tensor> {
        let image = image.unsqueeze(0)?;
        let embeds = match self {
            Model::Full(model) => image.apply(model.vision_model())?,
            Model::Quantized(model) => image.apply(model.vision_model())?,
        };
        Ok(embeds)
    }

    fn decode_step(&mut self, input_ids: &Tensor, image_embeds: &Tensor) -> Result<Tensor> {
        let logits = match self {
            Model::Full(model) => model.text_decoder().forward(input_ids, image_embeds)?,
            Model::Quantized(model) => model.text_decoder().forward(input_ids, image_embeds)?,
        };
        Ok(logits)
    }

    fn reset_kv_cache(&mut self) {
        match self {
            Model::Full(model) => model.text_decoder().reset_kv_cache(),
            Model::Quantized(model) => model.text_decoder().reset_kv_cache(),
        }
    }
}

impl CaptionGeneratorPipeline {
    pub fn with_safetensors(
        config: &blip::Config,
        tokenizer_file: &Path,
        weights_file: &Path,
        device: Device,
        max_length: usize,
    ) -> Result<Self> {
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], DType::F32, &device)? };
        let model = Model::Full(blip::BlipForConditionalGeneration::new(config, vb)?);
        Self::with_model(model, config, tokenizer_file, device, max_length)
    }

    pub fn with_quantized_gguf(
        config: &blip::Config,
        tokenizer_file: &Path,
        gguf_file: &Path,
        device: Device,
        max_length: usize,
    ) -> Result<Self> {
        let vb = quantized_blip::VarBuilder::from_gguf(gguf_file, &device)?;
        let model =
            Model::Quantized(quantized_blip::BlipForConditionalGeneration::new(config, vb)?);
        Self::with_model(model, config, tokenizer_file, device, max_length)
    }

    fn with_model(
        model: Model,
        config: &blip::Config,
        tokenizer_file: &Path,
        device: Device,
        max_length: usize,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(E::msg)?;
        Ok(Self {
            model,
            tokenizer,
            device,
            image_size: config.vision_config.image_size,
            max_length,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Greedily decodes a caption for one image.
    ///
    /// Works on a clone of the weights so the key/value cache is private to the call and the
    /// pipeline itself stays untouched.
    pub fn generate(&self, image: &RgbImage) -> Result<String> {
        let pixels = preprocess(image, self.image_size, &self.device)?;

        let mut model = self.model.clone();
        model.reset_kv_cache();
        let image_embeds = model.embed_image(&pixels)?;

        let token_ids = greedy_decode(self.max_length, |context| {
            let input_ids = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model.decode_step(&input_ids, &image_embeds)?.squeeze(0)?;
            Ok(logits.get(logits.dim(0)? - 1)?.to_dtype(DType::F32)?)
        })?;
        debug!("Generated {} tokens", token_ids.len());

        decode_caption(&self.tokenizer, &token_ids)
    }
}

/// Runs the token loop from `[DEC]` until `[SEP]` or `max_length` tokens.
///
/// `next_logits` gets the tokens the decoder has not seen yet: the start token on the first step,
/// then only the last sampled token since the decoder keeps its own key/value cache. The returned
/// ids start with `BOS_TOKEN_ID` and never contain `SEP_TOKEN_ID`.
fn greedy_decode(
    max_length: usize,
    mut next_logits: impl FnMut(&[u32]) -> Result<Tensor>,
) -> Result<Vec<u32>> {
    let mut logits_processor = LogitsProcessor::new(GREEDY_SEED, None, None);
    let mut token_ids = vec![BOS_TOKEN_ID];
    while token_ids.len() < max_length {
        let context_size = if token_ids.len() > 1 { 1 } else { token_ids.len() };
        let start_pos = token_ids.len() - context_size;

        let logits = next_logits(&token_ids[start_pos..])?;
        let token = logits_processor.sample(&logits)?;
        if token == SEP_TOKEN_ID {
            break;
        }
        token_ids.push(token);
    }
    Ok(token_ids)
}

fn decode_caption(tokenizer: &Tokenizer, token_ids: &[u32]) -> Result<String> {
    let caption = tokenizer.decode(token_ids, true).map_err(E::msg)?;
    Ok(caption.trim().to_string())
}
