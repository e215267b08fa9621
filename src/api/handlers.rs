use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::models::{HealthResponse, InferenceRequest, InferenceResponse, MAX_NEW_TOKENS_LIMIT};
use crate::app_state::AppState;
use crate::config::GenerationConfig;
use crate::error::PipelineError;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.model_name.clone(),
    })
}

fn error_response(e: PipelineError) -> (StatusCode, String) {
    let status = match e {
        PipelineError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

pub async fn inference(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, (StatusCode, String)> {
    tracing::info!("Inference request: {:?}", payload);

    let max_new_tokens = payload.max_new_tokens.min(MAX_NEW_TOKENS_LIMIT);

    let output = tokio::task::spawn_blocking(move || {
        let pipeline = state
            .pipeline
            .lock()
            .map_err(|_| PipelineError::Generation("pipeline lock poisoned".into()))?;

        let defaults = pipeline.defaults();
        let config = GenerationConfig {
            max_new_tokens,
            do_sample: defaults.do_sample || payload.temperature.is_some(),
            temperature: payload.temperature.unwrap_or(defaults.temperature),
            top_p: payload.top_p.unwrap_or(defaults.top_p),
            seed: payload.seed.unwrap_or(defaults.seed),
            eos_token_ids: defaults.eos_token_ids.clone(),
        };
        pipeline.generate_with(&payload.prompt, &config)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(error_response)?;

    tracing::debug!("Generated text: {}", output.generated_text);

    Ok(Json(InferenceResponse {
        new_tokens: output.new_token_ids.len(),
        generated_text: output.generated_text,
    }))
}
