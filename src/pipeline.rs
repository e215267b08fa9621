//! Text-generation pipeline: one tokenizer and one causal LM, batch size 1.

use std::time::Instant;

use crate::config::GenerationConfig;
use crate::error::Result;
use crate::hub::{CheckpointLoader, LoadOptions, ModelId};
use crate::llm::inference;
use crate::llm::models::CausalLm;
use crate::tokenizer::TextTokenizer;

/// Requests are never batched together.
pub const BATCH_SIZE: usize = 1;

pub const TASK: &str = "text-generation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    /// Prompt followed by the continuation, special tokens removed.
    pub generated_text: String,
    pub prompt_tokens: usize,
    /// Newly generated ids, including a terminating EOS if one was produced.
    pub new_token_ids: Vec<u32>,
}

pub struct TextGenerationPipeline<T, M> {
    model_id: ModelId,
    tokenizer: T,
    model: M,
    defaults: GenerationConfig,
    trust_remote_code: bool,
}

impl<T, M> TextGenerationPipeline<T, M>
where
    T: TextTokenizer,
    M: CausalLm,
{
    pub fn new(
        model_id: ModelId,
        tokenizer: T,
        model: M,
        defaults: GenerationConfig,
        trust_remote_code: bool,
    ) -> Self {
        Self {
            model_id,
            tokenizer,
            model,
            defaults,
            trust_remote_code,
        }
    }

    /// Loads tokenizer then model through `loader` and composes them.
    ///
    /// Nothing is built if either load fails.
    pub fn load<L>(
        loader: &L,
        model_id: ModelId,
        options: &LoadOptions,
        base: GenerationConfig,
    ) -> Result<Self>
    where
        L: CheckpointLoader<Tokenizer = T, Model = M>,
    {
        tracing::info!("Loading model: {}", model_id);
        let tokenizer = loader.load_tokenizer(&model_id)?;
        let model = loader.load_model(&model_id, options)?;

        let defaults = match loader.load_generation_defaults(&model_id)? {
            Some(checkpoint_defaults) => base.with_defaults(&checkpoint_defaults),
            None => base,
        };

        Ok(Self::new(
            model_id,
            tokenizer,
            model,
            defaults,
            options.trust_remote_code,
        ))
    }

    pub fn task(&self) -> &'static str {
        TASK
    }

    pub fn batch_size(&self) -> usize {
        BATCH_SIZE
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn trust_remote_code(&self) -> bool {
        self.trust_remote_code
    }

    /// Generation parameters used by [`Self::generate`].
    pub fn defaults(&self) -> &GenerationConfig {
        &self.defaults
    }

    pub fn set_defaults(&mut self, defaults: GenerationConfig) {
        self.defaults = defaults;
    }

    /// Generates with the pipeline defaults and the given token budget.
    pub fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<GenerationOutput> {
        let config = GenerationConfig {
            max_new_tokens,
            ..self.defaults.clone()
        };
        self.generate_with(prompt, &config)
    }

    pub fn generate_with(&self, prompt: &str, config: &GenerationConfig) -> Result<GenerationOutput> {
        let start = Instant::now();

        let prompt_ids = self.tokenizer.encode(prompt)?;
        let tokens = inference::generate(&prompt_ids, &self.model, config)?;
        let generated_text = self.tokenizer.decode(&tokens.all_ids())?;

        let elapsed = start.elapsed();
        tracing::info!(
            "Generated {} tokens in {:.2}s ({:.1} tok/s)",
            tokens.new_ids.len(),
            elapsed.as_secs_f64(),
            tokens.new_ids.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );

        Ok(GenerationOutput {
            generated_text,
            prompt_tokens: tokens.prompt_ids.len(),
            new_token_ids: tokens.new_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use candle_core::{Device, Result as CandleResult, Tensor};

    use super::*;
    use crate::config::{GenerationDefaults, DEFAULT_MAX_NEW_TOKENS, DEFAULT_PROMPT};
    use crate::error::PipelineError;
    use crate::llm::causal_self_attention::KVCache;

    const VOCAB: usize = 8;
    const EOS: u32 = 0;

    type CallLog = Rc<RefCell<Vec<String>>>;

    /// Maps characters to ids `1..VOCAB` and back.
    struct StubTokenizer {
        log: CallLog,
    }

    impl TextTokenizer for StubTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            self.log.borrow_mut().push(format!("encode:{}", text));
            Ok(text.bytes().map(|b| 1 + (b as u32) % (VOCAB as u32 - 1)).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids
                .iter()
                .filter(|&&id| id != EOS)
                .map(|id| char::from(b'a' + *id as u8))
                .collect())
        }
    }

    /// Always predicts `next`, recording the shape of every forward input.
    struct StubModel {
        next: u32,
        log: CallLog,
        device: Device,
    }

    impl CausalLm for StubModel {
        fn forward_with_cache(
            &self,
            input_ids: &Tensor,
            _kv_caches: &mut [KVCache],
            position: usize,
        ) -> CandleResult<Tensor> {
            let (batch, seq_len) = input_ids.dims2()?;
            self.log
                .borrow_mut()
                .push(format!("forward:{}x{}@{}", batch, seq_len, position));
            let mut logits = vec![0f32; batch * seq_len * VOCAB];
            for row in 0..batch * seq_len {
                logits[row * VOCAB + self.next as usize] = 10.0;
            }
            Tensor::from_vec(logits, (batch, seq_len, VOCAB), &self.device)
        }

        fn num_layers(&self) -> usize {
            1
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn eos_token_ids(&self) -> Vec<u32> {
            vec![EOS]
        }

        fn max_position_embeddings(&self) -> usize {
            512
        }
    }

    struct StubLoader {
        log: CallLog,
        next: u32,
        known: &'static str,
    }

    impl StubLoader {
        fn new(next: u32) -> Self {
            Self {
                log: Rc::new(RefCell::new(Vec::new())),
                next,
                known: "org/stub",
            }
        }

        fn calls(&self) -> Vec<String> {
            self.log.borrow().clone()
        }

        fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
            self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
        }
    }

    impl CheckpointLoader for StubLoader {
        type Tokenizer = StubTokenizer;
        type Model = StubModel;

        fn load_tokenizer(&self, model_id: &ModelId) -> Result<StubTokenizer> {
            self.log.borrow_mut().push(format!("tokenizer:{}", model_id));
            if model_id.repo != self.known {
                return Err(PipelineError::MissingFile(format!("{}/tokenizer.json", model_id)));
            }
            Ok(StubTokenizer {
                log: self.log.clone(),
            })
        }

        fn load_model(&self, model_id: &ModelId, _options: &LoadOptions) -> Result<StubModel> {
            self.log.borrow_mut().push(format!("model:{}", model_id));
            Ok(StubModel {
                next: self.next,
                log: self.log.clone(),
                device: Device::Cpu,
            })
        }
    }

    fn load(loader: &StubLoader, id: &str) -> Result<TextGenerationPipeline<StubTokenizer, StubModel>> {
        TextGenerationPipeline::load(
            loader,
            ModelId::new(id),
            &LoadOptions::default(),
            GenerationConfig::default(),
        )
    }

    #[test]
    fn test_loads_tokenizer_then_model_once_each() {
        let loader = StubLoader::new(3);
        load(&loader, "org/stub").unwrap();
        assert_eq!(loader.calls(), vec!["tokenizer:org/stub", "model:org/stub"]);
    }

    #[test]
    fn test_unresolvable_id_builds_nothing() {
        let loader = StubLoader::new(3);
        let err = load(&loader, "org/missing").err().unwrap();
        assert!(matches!(err, PipelineError::MissingFile(_)));
        assert_eq!(loader.calls(), vec!["tokenizer:org/missing"]);
    }

    #[test]
    fn test_every_run_loads_again() {
        let loader = StubLoader::new(3);
        for _ in 0..3 {
            load(&loader, "org/stub").unwrap().generate("hi", 2).unwrap();
        }
        assert_eq!(loader.calls_starting_with("tokenizer:").len(), 3);
        assert_eq!(loader.calls_starting_with("model:").len(), 3);
    }

    #[test]
    fn test_batch_size_is_one_for_every_forward() {
        let loader = StubLoader::new(3);
        let pipeline = load(&loader, "org/stub").unwrap();
        assert_eq!(pipeline.batch_size(), 1);
        assert_eq!(pipeline.task(), "text-generation");
        assert!(pipeline.trust_remote_code());

        pipeline.generate("a longer prompt", 4).unwrap();
        let forwards = loader.calls_starting_with("forward:");
        assert_eq!(forwards.len(), 4);
        assert!(forwards.iter().all(|f| f.starts_with("forward:1x")));
        assert_eq!(forwards[0], "forward:1x15@0");
        assert_eq!(forwards[1], "forward:1x1@15");
    }

    #[test]
    fn test_token_budget_is_never_exceeded() {
        let loader = StubLoader::new(3);
        let pipeline = load(&loader, "org/stub").unwrap();
        let output = pipeline.generate("Hello", DEFAULT_MAX_NEW_TOKENS).unwrap();
        assert_eq!(output.new_token_ids.len(), DEFAULT_MAX_NEW_TOKENS);
        assert_eq!(output.prompt_tokens, 5);
    }

    #[test]
    fn test_immediate_eos_yields_one_new_token() {
        let loader = StubLoader::new(EOS);
        let pipeline = load(&loader, "org/stub").unwrap();
        let output = pipeline.generate("Hello", DEFAULT_MAX_NEW_TOKENS).unwrap();
        assert_eq!(output.new_token_ids, vec![EOS]);
        assert!(output.new_token_ids.len() < DEFAULT_MAX_NEW_TOKENS);
        assert_eq!(loader.calls_starting_with("forward:").len(), 1);
    }

    #[test]
    fn test_zero_budget_is_invalid() {
        let loader = StubLoader::new(3);
        let pipeline = load(&loader, "org/stub").unwrap();
        let err = pipeline.generate("Hello", 0).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }

    #[test]
    fn test_default_prompt_runs_once() {
        let loader = StubLoader::new(3);
        let output = load(&loader, "org/stub")
            .unwrap()
            .generate(DEFAULT_PROMPT, 25)
            .unwrap();

        assert_eq!(
            loader.calls_starting_with("encode:"),
            vec!["encode:Hello, What are you?"]
        );
        assert!(output.new_token_ids.len() <= 25);
        assert!(output.generated_text.ends_with("ddd"));
    }

    /// Stub loader that also ships a `generation_config.json`.
    struct WithDefaults {
        inner: StubLoader,
        json: &'static str,
    }

    impl CheckpointLoader for WithDefaults {
        type Tokenizer = StubTokenizer;
        type Model = StubModel;

        fn load_tokenizer(&self, model_id: &ModelId) -> Result<StubTokenizer> {
            self.inner.load_tokenizer(model_id)
        }

        fn load_model(&self, model_id: &ModelId, options: &LoadOptions) -> Result<StubModel> {
            self.inner.load_model(model_id, options)
        }

        fn load_generation_defaults(&self, _: &ModelId) -> Result<Option<GenerationDefaults>> {
            Ok(Some(serde_json::from_str(self.json)?))
        }
    }

    fn load_with_defaults(
        json: &'static str,
    ) -> TextGenerationPipeline<StubTokenizer, StubModel> {
        let loader = WithDefaults {
            inner: StubLoader::new(3),
            json,
        };
        TextGenerationPipeline::load(
            &loader,
            ModelId::new("org/stub"),
            &LoadOptions::default(),
            GenerationConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_checkpoint_defaults_apply() {
        let pipeline = load_with_defaults(r#"{"eos_token_id": 3}"#);
        assert_eq!(pipeline.defaults().eos_token_ids, vec![3]);

        let output = pipeline.generate("Hello", 25).unwrap();
        assert_eq!(output.new_token_ids, vec![3]);
    }

    #[test]
    fn test_checkpoint_cannot_shrink_token_budget() {
        let pipeline = load_with_defaults(r#"{"max_new_tokens": 3, "do_sample": false}"#);
        assert_eq!(pipeline.defaults().max_new_tokens, DEFAULT_MAX_NEW_TOKENS);

        let output = pipeline.generate("Hello", DEFAULT_MAX_NEW_TOKENS).unwrap();
        assert_eq!(output.new_token_ids.len(), DEFAULT_MAX_NEW_TOKENS);
    }

    #[test]
    fn test_prompt_past_position_limit_fails_without_forward() {
        let loader = StubLoader::new(3);
        let pipeline = load(&loader, "org/stub").unwrap();
        let prompt = "x".repeat(600);
        let err = pipeline.generate(&prompt, DEFAULT_MAX_NEW_TOKENS).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
        assert!(loader.calls_starting_with("forward:").is_empty());
    }
}
