//! GGUF runtime built on candle's quantized llama implementation.
//!
//! Weights are memory-resident once loaded. The tokenizer is a HuggingFace
//! `tokenizer.json`, either configured explicitly or found next to the weights.

use super::native::{NativeModel, NativeRuntime};
use super::{BackendError, FinalResult, InferParams, Usage};
use bon::Builder;
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama::ModelWeights;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Upper bound of the quantized llama attention mask.
const MAX_SEQ_LEN: usize = 4096;
const REPEAT_LAST_N: usize = 64;

#[derive(Debug, Clone, Builder)]
pub struct CandleConfig {
    /// Tokenizer used for every model. Defaults to `tokenizer.json` beside the weights.
    #[builder(into)]
    pub tokenizer: Option<PathBuf>,
    /// Completion length when a request sets no `max_tokens`.
    #[builder(default = 512)]
    pub default_max_tokens: u32,
    #[builder(default = 0.8)]
    pub default_temperature: f64,
    #[builder(default = 1.1)]
    pub default_repeat_penalty: f32,
}

#[derive(Debug)]
pub struct CandleRuntime {
    config: CandleConfig,
    device: Device,
}

impl CandleRuntime {
    pub fn new(config: CandleConfig) -> Result<Self, BackendError> {
        let device = Device::cuda_if_available(0)
            .map_err(|e| BackendError::Config(format!("no usable device: {e}")))?;
        Ok(Self { config, device })
    }

    fn tokenizer_path(&self, model_path: &Path) -> PathBuf {
        match &self.config.tokenizer {
            Some(path) => path.clone(),
            None => model_path.with_file_name("tokenizer.json"),
        }
    }
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> BackendError {
    BackendError::Load(format!("{}: {e}", path.display()))
}

impl NativeRuntime for CandleRuntime {
    fn load(&self, model_path: &Path) -> Result<Box<dyn NativeModel>, BackendError> {
        let mut file = std::fs::File::open(model_path).map_err(|e| load_error(model_path, e))?;
        let content =
            gguf_file::Content::read(&mut file).map_err(|e| load_error(model_path, e))?;

        let tokenizer_path = self.tokenizer_path(model_path);
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| load_error(&tokenizer_path, format!("tokenizer: {e}")))?;

        let metadata_u32 = |key: &str| content.metadata.get(key).and_then(|v| v.to_u32().ok());
        let eos = metadata_u32("tokenizer.ggml.eos_token_id")
            .or_else(|| tokenizer.token_to_id("</s>"))
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"));
        let context_length = metadata_u32("llama.context_length")
            .map_or(MAX_SEQ_LEN, |n| (n as usize).min(MAX_SEQ_LEN));

        let weights = ModelWeights::from_gguf(content, &mut file, &self.device)
            .map_err(|e| load_error(model_path, e))?;
        info!(
            path = %model_path.display(),
            device = ?self.device,
            context_length,
            "Loaded GGUF weights"
        );

        Ok(Box::new(CandleModel {
            weights,
            tokenizer,
            device: self.device.clone(),
            eos,
            context_length,
            config: self.config.clone(),
        }))
    }
}

struct CandleModel {
    weights: ModelWeights,
    tokenizer: Tokenizer,
    device: Device,
    eos: Option<u32>,
    context_length: usize,
    config: CandleConfig,
}

fn stream_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::Stream(e.to_string())
}

/// Sampling strategy for a request. A non-positive temperature is greedy.
fn sampling(params: &InferParams, default_temperature: f64) -> Sampling {
    let temperature = params.temperature.map_or(default_temperature, f64::from);
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    let k = params.top_k.filter(|&k| k > 0).map(|k| k as usize);
    let p = params.top_p.filter(|&p| p > 0.0 && p < 1.0).map(f64::from);
    match (k, p) {
        (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        (Some(k), None) => Sampling::TopK { k, temperature },
        (None, Some(p)) => Sampling::TopP { p, temperature },
        (None, None) => Sampling::All { temperature },
    }
}

/// Turns token ids into text fragments without splitting multi-byte characters.
struct Detokenizer<'a> {
    tokenizer: &'a Tokenizer,
    tokens: Vec<u32>,
    emitted: usize,
}

impl<'a> Detokenizer<'a> {
    fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            emitted: 0,
        }
    }

    fn push(&mut self, token: u32) -> Result<Option<String>, BackendError> {
        self.tokens.push(token);
        let text = self
            .tokenizer
            .decode(&self.tokens, true)
            .map_err(stream_error)?;
        // A trailing replacement char means the last token ends mid-character
        if text.len() <= self.emitted || text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        if !text.is_char_boundary(self.emitted) {
            return Ok(None);
        }
        let fragment = text[self.emitted..].to_string();
        self.emitted = text.len();
        Ok(Some(fragment))
    }
}

impl NativeModel for CandleModel {
    fn generate(
        &mut self,
        prompt: &str,
        params: &InferParams,
        on_token: &mut dyn FnMut(&str) -> bool,
    ) -> Result<FinalResult, BackendError> {
        let encoding = self.tokenizer.encode(prompt, true).map_err(stream_error)?;
        let prompt_tokens = encoding.get_ids().to_vec();
        if prompt_tokens.is_empty() {
            return Err(BackendError::Stream("prompt produced no tokens".into()));
        }
        if prompt_tokens.len() >= self.context_length {
            return Err(BackendError::Stream(format!(
                "prompt of {} tokens exceeds the context length {}",
                prompt_tokens.len(),
                self.context_length
            )));
        }

        let max_tokens = params
            .max_tokens
            .filter(|&n| n > 0)
            .unwrap_or(self.config.default_max_tokens) as usize;
        let repeat_penalty = params
            .repeat_penalty
            .unwrap_or(self.config.default_repeat_penalty);
        let seed = params.seed.map_or(299_792_458, |s| s as u64);
        let mut sampler =
            LogitsProcessor::from_sampling(seed, sampling(params, self.config.default_temperature));
        let mut detokenizer = Detokenizer::new(&self.tokenizer);

        let mut context = prompt_tokens.clone();
        let mut input = prompt_tokens.clone();
        let mut content = String::new();
        let mut generated = 0usize;
        let mut finish_reason = "length";

        while generated < max_tokens {
            if context.len() >= self.context_length {
                break;
            }
            let index_pos = context.len() - input.len();
            let x = Tensor::new(input.as_slice(), &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(stream_error)?;
            let logits = self
                .weights
                .forward(&x, index_pos)
                .and_then(|l| l.squeeze(0))
                .and_then(|l| l.to_dtype(DType::F32))
                .map_err(stream_error)?;
            let logits = if repeat_penalty == 1.0 {
                logits
            } else {
                let start = context.len().saturating_sub(REPEAT_LAST_N);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    repeat_penalty,
                    &context[start..],
                )
                .map_err(stream_error)?
            };
            let next = sampler.sample(&logits).map_err(stream_error)?;
            generated += 1;
            context.push(next);
            input = vec![next];

            if Some(next) == self.eos {
                finish_reason = "stop";
                break;
            }
            let Some(fragment) = detokenizer.push(next)? else {
                continue;
            };
            content.push_str(&fragment);
            if let Some(stop) = params
                .stop
                .iter()
                .find(|s| !s.is_empty() && content.contains(s.as_str()))
            {
                if let Some(at) = content.find(stop.as_str()) {
                    content.truncate(at);
                }
                finish_reason = "stop";
                break;
            }
            if !on_token(&fragment) {
                finish_reason = "cancelled";
                break;
            }
        }

        debug!(generated, finish_reason, "Candle generation finished");
        let prompt_tokens = prompt_tokens.len() as u64;
        let completion_tokens = generated as u64;
        Ok(FinalResult {
            content,
            finish_reason: finish_reason.to_string(),
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }
}
