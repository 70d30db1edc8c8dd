pub mod caption_pipeline;
pub mod device;
pub mod image_processor;
pub mod models;
pub mod task;
