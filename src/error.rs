//! Errors raised while resolving, loading and running a checkpoint.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("could not resolve checkpoint file: {0}")]
    Resolution(#[from] hf_hub::api::sync::ApiError),

    #[error("checkpoint file not found: {0}")]
    MissingFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid checkpoint config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("inconsistent checkpoint config: {0}")]
    InvalidConfig(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("checkpoint {0} ships custom code; enable trust_remote_code to load it")]
    RemoteCodeNotTrusted(String),

    #[error("checkpoint {model_id} requires custom code for model_type `{model_type}`, which cannot run natively")]
    RemoteCodeUnsupported { model_id: String, model_type: String },

    #[error("unsupported model_type `{0}`")]
    UnsupportedArchitecture(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("generation failed: {0}")]
    Generation(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
