use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use hf_hub::api::sync::Api;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::api::AppState;
use crate::config::Config;
use crate::inference::device::{device_name, select_device};
use crate::inference::models::blip::BlipModel;
use crate::inference::models::model::ModelBase;

mod api;
mod config;
mod error;
mod inference;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "Captioner.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// OTLP collector receiving traces and metrics, console logging only when unset
    #[arg(long, env)]
    otlp_endpoint: Option<String>,

    /// Keep console logging when exporting to an OTLP collector
    #[arg(long, env)]
    console: bool,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_telemetry(&args.otlp_endpoint, args.console)?;

    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == DEFAULT_CONFIG_FILE {
                Config::default().merge(args.opt_config)
            } else {
                exit_err!(
                    1,
                    "Failed to read configuration file {} with error: {}",
                    args.config_file,
                    err
                );
            }
        }
    };

    if let Err(err) = config.validate() {
        exit_err!(1, "Invalid configuration: {}", err);
    }

    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let captioner = match load_captioner(&config) {
        Ok(model) => model,
        Err(err) => exit_err!(1, "Failed to load captioning model: {:#}", err),
    };
    info!("Model ready on {}", device_name(captioner.device()));

    let state = AppState {
        captioner: Arc::new(captioner),
    };
    let router = api::router(state, config.max_upload_size);

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Blocks until the weights and tokenizer are in memory. The server never starts without them.
fn load_captioner(config: &Config) -> Result<BlipModel> {
    let device = select_device(config.device)?;
    let base = ModelBase {
        name: format!("Candle BLIP {:?}", config.model_variant),
        license: "BSD-3-Clause".into(),
        repo_id: config.model_repo.clone(),
        repo_revision: config.model_revision.clone(),
    };

    BlipModel::new(
        Api::new()?,
        &base,
        config.model_variant,
        &config.weights_file,
        &config.tokenizer_repo,
        &config.tokenizer_file,
        device,
        config.max_length,
    )
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}
