use anyhow::{ensure, Result};
use clap_serde_derive::ClapSerde;

use crate::inference::device::DevicePreference;
use crate::inference::models::blip::BlipVariant;

#[derive(ClapSerde, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(5000)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// Hub repository holding the model weights
    #[default("Salesforce/blip-image-captioning-base".to_string())]
    #[arg(long, env)]
    pub(crate) model_repo: String,

    /// Revision of the model repository
    #[default("main".to_string())]
    #[arg(long, env)]
    pub(crate) model_revision: String,

    /// Architecture of the weights, must match the weights file
    #[default(BlipVariant::Base)]
    #[arg(long, env, value_enum)]
    pub(crate) model_variant: BlipVariant,

    /// Weights file inside the model repository or a local path, `.gguf` files load quantized
    #[default("model.safetensors".to_string())]
    #[arg(long, env)]
    pub(crate) weights_file: String,

    /// Hub repository holding the tokenizer
    #[default("Salesforce/blip-image-captioning-base".to_string())]
    #[arg(long, env)]
    pub(crate) tokenizer_repo: String,

    /// Tokenizer file inside the tokenizer repository or a local path
    #[default("tokenizer.json".to_string())]
    #[arg(long, env)]
    pub(crate) tokenizer_file: String,

    /// Device used for inference
    #[default(DevicePreference::Auto)]
    #[arg(long, env, value_enum)]
    pub(crate) device: DevicePreference,

    /// Maximum caption length in tokens, including the start token
    #[default(20)]
    #[arg(long, env)]
    pub(crate) max_length: usize,

    /// Maximum accepted upload size in bytes
    #[default(10 * 1024 * 1024)]
    #[arg(long, env)]
    pub(crate) max_upload_size: usize,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        Self::from_toml_str(&str)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        // One slot is taken by the start token
        ensure!(
            self.max_length >= 2,
            "max_length must be at least 2, got {}",
            self.max_length
        );
        ensure!(self.max_upload_size > 0, "max_upload_size must be positive");
        Ok(())
    }

    /// Keys missing from the file keep their defaults.
    fn from_toml_str(str: &str) -> Result<Self> {
        let opt: <Config as ClapSerde>::Opt = toml::from_str(str)?;
        Ok(Config::from(opt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_toml_file() {
        let config = Config::from_toml_str(
            r#"
            address = "127.0.0.1"
            port = 8080
            model_repo = "lmz/candle-blip"
            model_variant = "large"
            weights_file = "blip-image-captioning-large-q4k.gguf"
            device = "cpu"
            max_length = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.model_repo, "lmz/candle-blip");
        assert_eq!(config.model_variant, BlipVariant::Large);
        assert_eq!(config.weights_file, "blip-image-captioning-large-q4k.gguf");
        assert_eq!(config.device, DevicePreference::Cpu);
        assert_eq!(config.max_length, 30);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = Config::from_toml_str("port = 9000").unwrap();
        let defaults = Config::default();

        assert_eq!(config.port, 9000);
        assert_eq!(config.address, defaults.address);
        assert_eq!(config.model_repo, "Salesforce/blip-image-captioning-base");
        assert_eq!(config.model_variant, BlipVariant::Base);
        assert_eq!(config.device, DevicePreference::Auto);
        assert_eq!(config.max_length, 20);
        assert_eq!(config.max_upload_size, 10 * 1024 * 1024);
    }

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn max_length_must_leave_room_for_a_word() {
        for max_length in [0, 1] {
            let config = Config::from_toml_str(&format!("max_length = {max_length}")).unwrap();
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("max_length"));
        }
        let config = Config::from_toml_str("max_length = 2").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_upload_size_is_rejected() {
        let config = Config::from_toml_str("max_upload_size = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_variants() {
        assert!(Config::from_toml_str(r#"model_variant = "huge""#).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::from_toml("does-not-exist/Captioner.toml").is_err());
    }
}
