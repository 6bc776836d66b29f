//! babycare-predict library
//!
//! Prediction orchestration for uploaded skin images: fetch the image from
//! object storage, run it through a hosted inference endpoint, normalize the
//! reply, and hand the result to Redis as a stream entry or a cached value.

pub mod aws;
pub mod cli;
pub mod config;
pub mod distribution;
pub mod error;
pub mod inference;
pub mod logging;
pub mod pipeline;
pub mod result;
pub mod storage;

pub use error::PipelineError;
pub use pipeline::{PredictionPipeline, PipelineSettings};
