//! Load a causal language model checkpoint and generate text with it.
//!
//! The flow is strictly linear: resolve the model identifier, load the
//! tokenizer, load the model, compose both into a batch-size-1
//! [`TextGenerationPipeline`], then generate. Llama-family checkpoints
//! (`llama`, `mistral`, `qwen2`) in safetensors format are supported.

pub mod api;
pub mod app_state;
pub mod cli;
pub mod config;
pub mod error;
pub mod hub;
pub mod llm;
pub mod pipeline;
pub mod placement;
pub mod tokenizer;

pub use config::{GenerationConfig, ModelConfig};
pub use error::{PipelineError, Result};
pub use hub::{CheckpointLoader, HubLoader, LoadOptions, ModelId};
pub use pipeline::{GenerationOutput, TextGenerationPipeline};
