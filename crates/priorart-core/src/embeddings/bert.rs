//! Sentence encoder using Hugging Face Candle
//!
//! Runs a BERT-family transformer (BERT, RoBERTa and their sentence-transformer
//! fine-tunes) and mean-pools the last hidden state over the attention mask.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, Activation, Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use crate::config::DevicePreference;
use crate::embeddings::TextEncoder;
use crate::error::PriorArtError;

/// Files a model directory must contain
const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Model configuration loaded from config.json
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: String,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: usize,
    #[serde(default)]
    pub model_type: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        // BERT-base layout
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: "gelu".to_string(),
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            pad_token_id: 0,
            model_type: "bert".to_string(),
        }
    }
}

impl EncoderConfig {
    /// RoBERTa position ids start after the padding index
    fn position_offset(&self) -> usize {
        if self.model_type == "roberta" || self.model_type == "xlm-roberta" {
            self.pad_token_id + 1
        } else {
            0
        }
    }

    /// Longest token sequence the position table can hold
    fn max_tokens(&self) -> usize {
        self.max_position_embeddings
            .saturating_sub(self.position_offset())
    }
}

/// Token, position and segment embeddings
struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl Embeddings {
    fn load(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                config.type_vocab_size,
                config.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        let word = self.word_embeddings.forward(input_ids)?;
        let position = self.position_embeddings.forward(position_ids)?;
        let token_type = self.token_type_embeddings.forward(token_type_ids)?;
        let summed = ((word + position)? + token_type)?;
        Ok(self.layer_norm.forward(&summed)?)
    }
}

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_attention_heads: usize,
    attention_head_size: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        let attention_head_size = config.hidden_size / config.num_attention_heads;
        let all_head_size = config.num_attention_heads * attention_head_size;

        Ok(Self {
            query: linear(config.hidden_size, all_head_size, vb.pp("query"))?,
            key: linear(config.hidden_size, all_head_size, vb.pp("key"))?,
            value: linear(config.hidden_size, all_head_size, vb.pp("value"))?,
            num_attention_heads: config.num_attention_heads,
            attention_head_size,
        })
    }

    /// [batch, seq, hidden] -> [batch, heads, seq, head_size]
    fn transpose_for_scores(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        let x = x.reshape((batch, seq_len, self.num_attention_heads, self.attention_head_size))?;
        Ok(x.transpose(1, 2)?.contiguous()?)
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let query = self.transpose_for_scores(&self.query.forward(hidden_states)?)?;
        let key = self.transpose_for_scores(&self.key.forward(hidden_states)?)?;
        let value = self.transpose_for_scores(&self.value.forward(hidden_states)?)?;

        let scores = query.matmul(&key.t()?.contiguous()?)?;
        let scores = (scores / (self.attention_head_size as f64).sqrt())?;
        let scores = scores.broadcast_add(attention_mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let context = probs.matmul(&value)?;
        let context = context.transpose(1, 2)?.contiguous()?;
        Ok(context.flatten_from(2)?)
    }
}

/// Dense + residual + layer norm, used after attention and after the FFN
struct ResidualOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl ResidualOutput {
    fn load(vb: VarBuilder, in_size: usize, config: &EncoderConfig) -> Result<Self> {
        Ok(Self {
            dense: linear(in_size, config.hidden_size, vb.pp("dense"))?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, input_tensor: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        Ok(self.layer_norm.forward(&(hidden_states + input_tensor)?)?)
    }
}

/// One transformer block
struct Layer {
    attention: SelfAttention,
    attention_output: ResidualOutput,
    intermediate: Linear,
    activation: Activation,
    output: ResidualOutput,
}

impl Layer {
    fn load(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        let activation = match config.hidden_act.as_str() {
            "relu" => Activation::Relu,
            "gelu_new" => Activation::NewGelu,
            _ => Activation::Gelu,
        };

        Ok(Self {
            attention: SelfAttention::load(vb.pp("attention").pp("self"), config)?,
            attention_output: ResidualOutput::load(
                vb.pp("attention").pp("output"),
                config.hidden_size,
                config,
            )?,
            intermediate: linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            activation,
            output: ResidualOutput::load(vb.pp("output"), config.intermediate_size, config)?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let attended = self.attention.forward(hidden_states, attention_mask)?;
        let attended = self.attention_output.forward(&attended, hidden_states)?;
        let intermediate = self.activation.forward(&self.intermediate.forward(&attended)?)?;
        self.output.forward(&intermediate, &attended)
    }
}

struct Transformer {
    embeddings: Embeddings,
    layers: Vec<Layer>,
}

impl Transformer {
    fn load(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        let embeddings = Embeddings::load(vb.pp("embeddings"), config)?;
        let vb_layers = vb.pp("encoder").pp("layer");
        let layers = (0..config.num_hidden_layers)
            .map(|i| Layer::load(vb_layers.pp(i), config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        position_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<Tensor> {
        let mut hidden = self.embeddings.forward(input_ids, token_type_ids, position_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, attention_mask)?;
        }
        Ok(hidden)
    }
}

/// Candle sentence encoder
pub struct BertEncoder {
    model: Transformer,
    tokenizer: Tokenizer,
    config: EncoderConfig,
    device: Device,
}

impl BertEncoder {
    /// Load an encoder from a local model directory
    ///
    /// # Arguments
    /// * `model_path` - Directory containing:
    ///   - `config.json` - The model configuration
    ///   - `tokenizer.json` - The tokenizer configuration
    ///   - `model.safetensors` - The model weights
    /// * `device` - Compute device preference
    pub fn load(model_path: &Path, device: DevicePreference) -> Result<Self> {
        let device = select_device(device)?;
        tracing::info!("Loading encoder on device: {:?}", device);

        let config_path = model_path.join(CONFIG_FILE);
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Config not found at {}", config_path.display()))?;
        let config: EncoderConfig = serde_json::from_str(&config_str)
            .map_err(|e| anyhow!("Failed to parse {}: {}", CONFIG_FILE, e))?;

        tracing::info!(
            "Loaded config: {} layers, {} hidden size, {} attention heads",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads
        );

        let tokenizer_path = model_path.join(TOKENIZER_FILE);
        if !tokenizer_path.exists() {
            return Err(anyhow!("Tokenizer not found at {}", tokenizer_path.display()));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let weights_path = model_path.join(WEIGHTS_FILE);
        if !weights_path.exists() {
            return Err(anyhow!("Model weights not found at {}", weights_path.display()));
        }
        tracing::info!("Loading model weights from {}", weights_path.display());

        // SAFETY: the weights file is treated as read-only for the process lifetime
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)? };

        // Sentence-transformer exports store the transformer either bare or
        // under the architecture name
        let prefix = ["", "bert", "roberta"]
            .into_iter()
            .find(|prefix| {
                let name = if prefix.is_empty() {
                    "embeddings.word_embeddings.weight".to_string()
                } else {
                    format!("{}.embeddings.word_embeddings.weight", prefix)
                };
                vb.contains_tensor(&name)
            })
            .ok_or_else(|| anyhow!("No BERT-style embeddings found in {}", WEIGHTS_FILE))?;
        let vb = if prefix.is_empty() { vb } else { vb.pp(prefix) };

        let model = Transformer::load(vb, &config)?;
        tracing::info!("Encoder loaded successfully");

        Ok(Self {
            model,
            tokenizer,
            config,
            device,
        })
    }

    /// Download an encoder from the Hugging Face Hub and return its local directory
    pub fn download(model_id: &str) -> Result<PathBuf> {
        use hf_hub::api::sync::Api;

        tracing::info!("Downloading {} from Hugging Face Hub...", model_id);

        let api = Api::new()?;
        let repo = api.model(model_id.to_string());

        let config = repo.get(CONFIG_FILE)?;
        repo.get(TOKENIZER_FILE)?;
        repo.get(WEIGHTS_FILE)?;

        config
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("Downloaded file has no parent directory"))
    }

    /// Generate the mean-pooled embedding for a single text
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let seq_len = encoding.get_ids().len().min(self.config.max_tokens());
        if seq_len == 0 {
            return Err(anyhow!("Tokenizer produced no tokens"));
        }
        let input_ids = &encoding.get_ids()[..seq_len];
        let attention_mask = &encoding.get_attention_mask()[..seq_len];

        let input_ids = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let attention_mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?;
        let token_type_ids = input_ids.zeros_like()?;

        let offset = self.config.position_offset() as u32;
        let position_ids: Vec<u32> = (offset..offset + seq_len as u32).collect();
        let position_ids = Tensor::new(&position_ids[..], &self.device)?.unsqueeze(0)?;

        // 0 where attended, -10000 where masked; shape [1, 1, 1, seq]
        let additive_mask = attention_mask
            .affine(10000.0, -10000.0)?
            .unsqueeze(1)?
            .unsqueeze(1)?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, &position_ids, &additive_mask)?;

        let pooled = mean_pooling(&hidden, &attention_mask)?;
        Ok(pooled.squeeze(0)?.to_vec1::<f32>()?)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl TextEncoder for BertEncoder {
    fn dimension(&self) -> usize {
        self.config.hidden_size
    }

    fn device_label(&self) -> String {
        device_label(&self.device).to_string()
    }

    fn encode_raw(&self, text: &str) -> crate::error::Result<Vec<f32>> {
        self.embed(text)
            .map_err(|e| PriorArtError::Encoding(e.to_string()))
    }
}

/// Average hidden states over attended tokens: [1, seq, h] -> [1, h]
fn mean_pooling(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let count = mask.sum(1)?;
    Ok(summed.broadcast_div(&count)?)
}

fn select_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0)?,
        DevicePreference::Metal => Device::new_metal(0)?,
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0)?
            } else {
                Device::Cpu
            }
        }
    };
    Ok(device)
}

fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}
