use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MAX_NEW_TOKENS;

/// Upper bound on `max_new_tokens` for a single request.
pub const MAX_NEW_TOKENS_LIMIT: usize = 1024;

#[derive(Debug, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<u64>,
}

fn default_max_new_tokens() -> usize {
    DEFAULT_MAX_NEW_TOKENS
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub generated_text: String,
    pub new_tokens: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
}
