//! Command-line interface.
//!
//! With no subcommand the binary behaves like `run` with every default:
//! load the default checkpoint and generate once for the default prompt.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokenizers::Tokenizer;

use crate::api;
use crate::app_state::AppState;
use crate::config::{
    GenerationConfig, DEFAULT_MAX_NEW_TOKENS, DEFAULT_MODEL_ID, DEFAULT_PROMPT, DEFAULT_REVISION,
    DEFAULT_SEED,
};
use crate::hub::{HubLoader, LoadOptions, ModelId};
use crate::llm::models::LlamaModel;
use crate::pipeline::TextGenerationPipeline;
use crate::placement::{DTypePreference, DevicePreference};

#[derive(Parser)]
#[command(name = "rustllm-pipeline")]
#[command(version, about = "Load a causal LM checkpoint and generate text", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load the model and generate once
    Run(RunArgs),

    /// Load the model once and serve generation requests over HTTP
    Serve {
        #[command(flatten)]
        model: ModelArgs,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

#[derive(Args, Clone, Debug)]
pub struct ModelArgs {
    /// Hub repository id or local checkpoint directory
    #[arg(long, short, default_value = DEFAULT_MODEL_ID)]
    pub model: String,

    /// Hub revision (branch, tag or commit)
    #[arg(long, default_value = DEFAULT_REVISION)]
    pub revision: String,

    #[arg(long, value_enum, default_value_t = DevicePreference::Auto)]
    pub device: DevicePreference,

    /// CUDA device ordinal
    #[arg(long, default_value = "0")]
    pub cuda_ordinal: usize,

    #[arg(long, value_enum, default_value_t = DTypePreference::Auto)]
    pub dtype: DTypePreference,

    /// Refuse checkpoints that ship their own modeling code
    #[arg(long)]
    pub no_trust_remote_code: bool,

    /// Sample instead of greedy decoding
    #[arg(long)]
    pub sample: bool,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Top-p nucleus sampling
    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL_ID.to_string(),
            revision: DEFAULT_REVISION.to_string(),
            device: DevicePreference::Auto,
            cuda_ordinal: 0,
            dtype: DTypePreference::Auto,
            no_trust_remote_code: false,
            sample: false,
            temperature: None,
            top_p: None,
            seed: DEFAULT_SEED,
        }
    }
}

impl ModelArgs {
    pub fn model_id(&self) -> ModelId {
        ModelId::with_revision(self.model.clone(), self.revision.clone())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            device: self.device,
            cuda_ordinal: self.cuda_ordinal,
            dtype: self.dtype,
            trust_remote_code: !self.no_trust_remote_code,
        }
    }

    /// Baseline decoding parameters; checkpoint defaults are layered on top,
    /// then explicit flags win again in [`Self::apply_overrides`].
    pub fn base_generation(&self) -> GenerationConfig {
        GenerationConfig {
            seed: self.seed,
            ..Default::default()
        }
    }

    pub fn apply_overrides(&self, mut config: GenerationConfig) -> GenerationConfig {
        if self.sample {
            config.do_sample = true;
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            config.top_p = top_p;
        }
        config
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Prompt text
    #[arg(long, short, default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Maximum number of new tokens
    #[arg(long, default_value_t = DEFAULT_MAX_NEW_TOKENS)]
    pub max_new_tokens: usize,

    /// Write the generated text to stdout
    #[arg(long)]
    pub print: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            model: ModelArgs::default(),
            prompt: DEFAULT_PROMPT.to_string(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            print: false,
        }
    }
}

type HubPipeline = TextGenerationPipeline<Tokenizer, LlamaModel>;

/// Loads the pipeline, then layers explicit sampling flags over the
/// checkpoint's own generation defaults.
fn load_pipeline(model: &ModelArgs) -> Result<HubPipeline> {
    let loader = HubLoader::new(true);
    let mut pipeline = TextGenerationPipeline::load(
        &loader,
        model.model_id(),
        &model.load_options(),
        model.base_generation(),
    )?;
    let defaults = model.apply_overrides(pipeline.defaults().clone());
    pipeline.set_defaults(defaults);
    Ok(pipeline)
}

/// Load, generate once, exit. The result is dropped unless `--print` is set.
pub fn run(args: RunArgs) -> Result<()> {
    let pipeline = load_pipeline(&args.model)?;
    tracing::info!("Model ready");

    let output = pipeline.generate(&args.prompt, args.max_new_tokens)?;

    if args.print {
        println!("{}", output.generated_text);
    }
    Ok(())
}

pub async fn serve(model: ModelArgs, host: String, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let model_name = model.model_id().to_string();

    let pipeline = tokio::task::spawn_blocking(move || load_pipeline(&model)).await??;
    tracing::info!("Model ready");

    let state = Arc::new(AppState::new(Box::new(pipeline), model_name));
    api::serve(state, addr).await?;
    Ok(())
}
