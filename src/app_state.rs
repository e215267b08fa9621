use std::sync::Mutex;

use crate::config::GenerationConfig;
use crate::error::Result;
use crate::llm::models::CausalLm;
use crate::pipeline::{GenerationOutput, TextGenerationPipeline};
use crate::tokenizer::TextTokenizer;

/// What the HTTP layer needs from a loaded pipeline.
pub trait TextGenerator {
    fn defaults(&self) -> &GenerationConfig;
    fn generate_with(&self, prompt: &str, config: &GenerationConfig) -> Result<GenerationOutput>;
}

impl<T: TextTokenizer, M: CausalLm> TextGenerator for TextGenerationPipeline<T, M> {
    fn defaults(&self) -> &GenerationConfig {
        TextGenerationPipeline::defaults(self)
    }

    fn generate_with(&self, prompt: &str, config: &GenerationConfig) -> Result<GenerationOutput> {
        TextGenerationPipeline::generate_with(self, prompt, config)
    }
}

pub struct AppState {
    /// One request at a time owns the device.
    pub pipeline: Mutex<Box<dyn TextGenerator + Send>>,
    pub model_name: String,
}

impl AppState {
    pub fn new(pipeline: Box<dyn TextGenerator + Send>, model_name: String) -> Self {
        Self {
            pipeline: Mutex::new(pipeline),
            model_name,
        }
    }
}
