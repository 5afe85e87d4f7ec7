//! # Wav2Vec2 Audio Classification Model
//!
//! A candle implementation of the Wav2Vec2 sequence-classification architecture
//! (convolutional feature encoder, transformer encoder, projector, mean pooling,
//! classifier head), as used by speech emotion recognition checkpoints on
//! HuggingFace.
//!
//! ## Supported Checkpoint Variants:
//! - **Base style**: `feat_extract_norm = "group"`, post-norm transformer layers
//! - **Large/XLSR style**: `feat_extract_norm = "layer"`, `do_stable_layer_norm = true`
//! - **Positional conv weights**: legacy `weight_g`/`weight_v` weight norm as well
//!   as the newer `parametrizations.weight.original0/1` naming
//!
//! ## Input Pipeline:
//! Mirrors the HuggingFace feature extractor: samples are normalized to zero mean
//! and unit variance before entering the network. Scores are softmax
//! probabilities ranked from most to least likely.

use crate::classifier::{ClassifierError, EmotionClassifier, EmotionScore};
use anyhow::{anyhow, bail, Result};
use candle_core::{Device, Module, Tensor};
use candle_nn::{GroupNorm, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;
use std::collections::HashMap;

/// Epsilon used by the convolutional feature encoder norms.
const CONV_NORM_EPS: f64 = 1e-5;

/// Epsilon used when normalizing raw input to zero mean / unit variance.
const INPUT_NORM_EPS: f32 = 1e-7;

/// Model hyperparameters as found in a checkpoint's `config.json`.
///
/// ## Defaults:
/// Missing fields fall back to the values of `facebook/wav2vec2-base`, which is
/// what HuggingFace does when instantiating the config class.
#[derive(Debug, Clone, Deserialize)]
pub struct Wav2Vec2Config {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,

    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,

    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,

    #[serde(default = "default_conv_dim")]
    pub conv_dim: Vec<usize>,

    #[serde(default = "default_conv_kernel")]
    pub conv_kernel: Vec<usize>,

    #[serde(default = "default_conv_stride")]
    pub conv_stride: Vec<usize>,

    #[serde(default)]
    pub conv_bias: bool,

    #[serde(default = "default_feat_extract_norm")]
    pub feat_extract_norm: String,

    #[serde(default)]
    pub do_stable_layer_norm: bool,

    #[serde(default = "default_num_conv_pos_embeddings")]
    pub num_conv_pos_embeddings: usize,

    #[serde(default = "default_num_conv_pos_embedding_groups")]
    pub num_conv_pos_embedding_groups: usize,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    #[serde(default = "default_classifier_proj_size")]
    pub classifier_proj_size: usize,

    #[serde(default)]
    pub use_weighted_layer_sum: bool,

    /// Label names keyed by class index (as a string, the way HF stores them)
    #[serde(default)]
    pub id2label: HashMap<String, String>,
}

fn default_hidden_size() -> usize { 768 }
fn default_num_hidden_layers() -> usize { 12 }
fn default_num_attention_heads() -> usize { 12 }
fn default_intermediate_size() -> usize { 3072 }
fn default_conv_dim() -> Vec<usize> { vec![512; 7] }
fn default_conv_kernel() -> Vec<usize> { vec![10, 3, 3, 3, 3, 2, 2] }
fn default_conv_stride() -> Vec<usize> { vec![5, 2, 2, 2, 2, 2, 2] }
fn default_feat_extract_norm() -> String { "group".to_string() }
fn default_num_conv_pos_embeddings() -> usize { 128 }
fn default_num_conv_pos_embedding_groups() -> usize { 16 }
fn default_layer_norm_eps() -> f64 { 1e-5 }
fn default_classifier_proj_size() -> usize { 256 }

impl Wav2Vec2Config {
    /// Label names ordered by class index.
    ///
    /// ## Errors:
    /// - No `id2label` mapping (not a classification checkpoint)
    /// - Non-numeric or non-contiguous class indices
    pub fn labels(&self) -> Result<Vec<String>> {
        if self.id2label.is_empty() {
            bail!("config.json has no id2label mapping; not an audio classification checkpoint");
        }

        let mut indexed = self
            .id2label
            .iter()
            .map(|(id, label)| {
                id.parse::<usize>()
                    .map(|idx| (idx, label.clone()))
                    .map_err(|_| anyhow!("invalid class index '{}' in id2label", id))
            })
            .collect::<Result<Vec<_>>>()?;
        indexed.sort_by_key(|(idx, _)| *idx);

        for (position, (idx, _)) in indexed.iter().enumerate() {
            if *idx != position {
                bail!("id2label indices must be contiguous from 0, missing class {}", position);
            }
        }

        Ok(indexed.into_iter().map(|(_, label)| label).collect())
    }

    /// Validate the parts of the config the implementation depends on.
    pub fn validate(&self) -> Result<()> {
        if self.conv_dim.is_empty()
            || self.conv_dim.len() != self.conv_kernel.len()
            || self.conv_dim.len() != self.conv_stride.len()
        {
            bail!("conv_dim, conv_kernel and conv_stride must be non-empty and the same length");
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            bail!("hidden_size {} is not divisible by {} heads", self.hidden_size, self.num_attention_heads);
        }
        if self.num_conv_pos_embedding_groups == 0 || self.hidden_size % self.num_conv_pos_embedding_groups != 0 {
            bail!("hidden_size {} is not divisible by {} positional conv groups", self.hidden_size, self.num_conv_pos_embedding_groups);
        }
        if self.use_weighted_layer_sum {
            bail!("use_weighted_layer_sum checkpoints are not supported");
        }
        Ok(())
    }

    /// Number of encoder frames produced for `num_samples` input samples.
    pub fn feature_frames(&self, num_samples: usize) -> usize {
        self.conv_kernel
            .iter()
            .zip(self.conv_stride.iter())
            .fold(num_samples, |len, (&kernel, &stride)| {
                if len < kernel { 0 } else { (len - kernel) / stride + 1 }
            })
    }
}

/// Normalization applied after a feature encoder convolution.
enum ConvNorm {
    None,
    Group(GroupNorm),
    Layer(LayerNorm),
}

/// One convolution of the feature encoder: conv1d, optional norm, GELU.
struct FeatureConvLayer {
    weight: Tensor,
    bias: Option<Tensor>,
    out_dim: usize,
    stride: usize,
    norm: ConvNorm,
}

impl FeatureConvLayer {
    fn load(cfg: &Wav2Vec2Config, idx: usize, vb: VarBuilder) -> Result<Self> {
        let in_dim = if idx == 0 { 1 } else { cfg.conv_dim[idx - 1] };
        let out_dim = cfg.conv_dim[idx];
        let kernel = cfg.conv_kernel[idx];

        let conv_vb = vb.pp("conv");
        let weight = conv_vb.get((out_dim, in_dim, kernel), "weight")?;
        let bias = if cfg.conv_bias {
            Some(conv_vb.get(out_dim, "bias")?)
        } else {
            None
        };

        // Only the first layer carries a GroupNorm in "group" mode; HF names it
        // `layer_norm` in both modes.
        let norm = match cfg.feat_extract_norm.as_str() {
            "layer" => ConvNorm::Layer(candle_nn::layer_norm(out_dim, CONV_NORM_EPS, vb.pp("layer_norm"))?),
            "group" if idx == 0 => {
                ConvNorm::Group(candle_nn::group_norm(out_dim, out_dim, CONV_NORM_EPS, vb.pp("layer_norm"))?)
            }
            "group" => ConvNorm::None,
            other => bail!("unsupported feat_extract_norm '{}'", other),
        };

        Ok(Self {
            weight,
            bias,
            out_dim,
            stride: cfg.conv_stride[idx],
            norm,
        })
    }

    /// `x`: (batch, channels, time)
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.contiguous()?.conv1d(&self.weight, 0, self.stride, 1, 1)?;
        if let Some(bias) = &self.bias {
            x = x.broadcast_add(&bias.reshape((1, self.out_dim, 1))?)?;
        }

        let x = match &self.norm {
            ConvNorm::None => x,
            ConvNorm::Group(norm) => norm.forward(&x)?,
            ConvNorm::Layer(norm) => x
                .transpose(1, 2)?
                .contiguous()?
                .apply(norm)?
                .transpose(1, 2)?,
        };

        Ok(x.gelu_erf()?)
    }
}

/// Layer norm + linear projection from conv channels to the hidden size.
struct FeatureProjection {
    layer_norm: LayerNorm,
    projection: Linear,
}

impl FeatureProjection {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> Result<Self> {
        let conv_out = *cfg.conv_dim.last().ok_or_else(|| anyhow!("empty conv_dim"))?;
        Ok(Self {
            layer_norm: candle_nn::layer_norm(conv_out, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            projection: candle_nn::linear(conv_out, cfg.hidden_size, vb.pp("projection"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.apply(&self.layer_norm)?.apply(&self.projection)?)
    }
}

/// Grouped convolution that injects relative position information.
struct PositionalConvEmbedding {
    weight: Tensor,
    bias: Tensor,
    hidden_size: usize,
    padding: usize,
    groups: usize,
    trim_last: bool,
}

impl PositionalConvEmbedding {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> Result<Self> {
        let kernel = cfg.num_conv_pos_embeddings;
        let groups = cfg.num_conv_pos_embedding_groups;
        let hidden = cfg.hidden_size;
        let conv_vb = vb.pp("conv");

        let (g, v) = if conv_vb.contains_tensor("weight_g") {
            (
                conv_vb.get((1, 1, kernel), "weight_g")?,
                conv_vb.get((hidden, hidden / groups, kernel), "weight_v")?,
            )
        } else {
            let param_vb = conv_vb.pp("parametrizations").pp("weight");
            (
                param_vb.get((1, 1, kernel), "original0")?,
                param_vb.get((hidden, hidden / groups, kernel), "original1")?,
            )
        };

        // Weight norm over dim=2: w = g * v / ||v|| with the norm taken across
        // the output and input channel dims for each kernel position.
        let norm = v.sqr()?.sum_keepdim(0)?.sum_keepdim(1)?.sqrt()?;
        let weight = v.broadcast_mul(&g.broadcast_div(&norm)?)?;

        Ok(Self {
            weight,
            bias: conv_vb.get(hidden, "bias")?,
            hidden_size: hidden,
            padding: kernel / 2,
            groups,
            trim_last: kernel % 2 == 0,
        })
    }

    /// `x`: (batch, time, hidden)
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.transpose(1, 2)?.contiguous()?;
        let mut y = x.conv1d(&self.weight, self.padding, 1, 1, self.groups)?;
        y = y.broadcast_add(&self.bias.reshape((1, self.hidden_size, 1))?)?;

        // An even kernel with symmetric padding yields one extra frame.
        if self.trim_last {
            let len = y.dim(2)?;
            y = y.narrow(2, 0, len - 1)?;
        }

        Ok(y.gelu_erf()?.transpose(1, 2)?)
    }
}

struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = hidden / cfg.num_attention_heads;
        Ok(Self {
            q_proj: candle_nn::linear(hidden, hidden, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(hidden, hidden, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(hidden, hidden, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(hidden, hidden, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn split_heads(&self, x: &Tensor, batch: usize, time: usize) -> Result<Tensor> {
        Ok(x
            .reshape((batch, time, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, time, hidden) = x.dims3()?;

        let q = self.q_proj.forward(x)?.affine(self.scale, 0.0)?;
        let q = self.split_heads(&q, batch, time)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, batch, time)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, batch, time)?;

        let weights = q.matmul(&k.t()?.contiguous()?)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, time, hidden))?;

        Ok(self.out_proj.forward(&context)?)
    }
}

struct FeedForward {
    intermediate_dense: Linear,
    output_dense: Linear,
}

impl FeedForward {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            intermediate_dense: candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("intermediate_dense"))?,
            output_dense: candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("output_dense"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.apply(&self.intermediate_dense)?.gelu_erf()?.apply(&self.output_dense)?)
    }
}

struct EncoderLayer {
    attention: SelfAttention,
    layer_norm: LayerNorm,
    feed_forward: FeedForward,
    final_layer_norm: LayerNorm,
    stable_layer_norm: bool,
}

impl EncoderLayer {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: SelfAttention::load(cfg, vb.pp("attention"))?,
            layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            feed_forward: FeedForward::load(cfg, vb.pp("feed_forward"))?,
            final_layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("final_layer_norm"))?,
            stable_layer_norm: cfg.do_stable_layer_norm,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.stable_layer_norm {
            // Pre-norm
            let attended = self.attention.forward(&x.apply(&self.layer_norm)?)?;
            let x = (x + attended)?;
            let fed = self.feed_forward.forward(&x.apply(&self.final_layer_norm)?)?;
            Ok((x + fed)?)
        } else {
            // Post-norm
            let attended = self.attention.forward(x)?;
            let x = (x + attended)?.apply(&self.layer_norm)?;
            let fed = self.feed_forward.forward(&x)?;
            Ok((x + fed)?.apply(&self.final_layer_norm)?)
        }
    }
}

struct Encoder {
    pos_conv_embed: PositionalConvEmbedding,
    layer_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    stable_layer_norm: bool,
}

impl Encoder {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> Result<Self> {
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::load(cfg, vb.pp("layers").pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pos_conv_embed: PositionalConvEmbedding::load(cfg, vb.pp("pos_conv_embed"))?,
            layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            layers,
            stable_layer_norm: cfg.do_stable_layer_norm,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let positions = self.pos_conv_embed.forward(x)?;
        let mut x = (x + positions)?;

        if !self.stable_layer_norm {
            x = x.apply(&self.layer_norm)?;
        }
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        if self.stable_layer_norm {
            x = x.apply(&self.layer_norm)?;
        }

        Ok(x)
    }
}

/// The full network: Wav2Vec2 backbone plus the sequence-classification head.
pub struct Wav2Vec2ForAudioClassification {
    feature_extractor: Vec<FeatureConvLayer>,
    feature_projection: FeatureProjection,
    encoder: Encoder,
    projector: Linear,
    classifier: Linear,
    config: Wav2Vec2Config,
}

impl Wav2Vec2ForAudioClassification {
    /// Build the network from checkpoint weights.
    ///
    /// ## Weight Layout:
    /// Backbone weights live under `wav2vec2.*`, the head under `projector.*`
    /// and `classifier.*`, matching `Wav2Vec2ForSequenceClassification`.
    pub fn load(config: &Wav2Vec2Config, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let num_labels = config.labels()?.len();

        let backbone = vb.pp("wav2vec2");
        let feature_extractor = (0..config.conv_dim.len())
            .map(|i| FeatureConvLayer::load(config, i, backbone.pp("feature_extractor").pp("conv_layers").pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            feature_extractor,
            feature_projection: FeatureProjection::load(config, backbone.pp("feature_projection"))?,
            encoder: Encoder::load(config, backbone.pp("encoder"))?,
            projector: candle_nn::linear(config.hidden_size, config.classifier_proj_size, vb.pp("projector"))?,
            classifier: candle_nn::linear(config.classifier_proj_size, num_labels, vb.pp("classifier"))?,
            config: config.clone(),
        })
    }

    /// Class probabilities for a batch of raw waveforms.
    ///
    /// `input`: (batch, samples) -> (batch, num_labels)
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (_, num_samples) = input.dims2()?;
        if self.config.feature_frames(num_samples) == 0 {
            bail!("audio too short: {} samples produce no encoder frames", num_samples);
        }

        let mut x = input.unsqueeze(1)?;
        for layer in &self.feature_extractor {
            x = layer.forward(&x)?;
        }

        let x = x.transpose(1, 2)?.contiguous()?;
        let x = self.feature_projection.forward(&x)?;
        let x = self.encoder.forward(&x)?;

        let pooled = self.projector.forward(&x)?.mean(1)?;
        let logits = self.classifier.forward(&pooled)?;
        Ok(candle_nn::ops::softmax_last_dim(&logits)?)
    }
}

/// Zero-mean, unit-variance normalization of a waveform.
pub fn zero_mean_unit_var(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    let n = samples.len() as f32;
    let mean = samples.iter().sum::<f32>() / n;
    let variance = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / n;
    let scale = 1.0 / (variance + INPUT_NORM_EPS).sqrt();

    samples.iter().map(|s| (s - mean) * scale).collect()
}

/// Pair labels with probabilities and rank them, most likely first.
///
/// Ties keep class-index order (the sort is stable), so the ranking is fully
/// deterministic. `top_k` truncates the ranked list when set.
pub fn rank_scores(labels: &[String], probabilities: &[f32], top_k: Option<usize>) -> Vec<EmotionScore> {
    let mut ranked: Vec<EmotionScore> = labels
        .iter()
        .zip(probabilities.iter())
        .map(|(label, &score)| EmotionScore::new(label.clone(), score))
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    if let Some(k) = top_k {
        ranked.truncate(k);
    }
    ranked
}

/// Emotion classifier backed by a loaded Wav2Vec2 checkpoint.
pub struct Wav2Vec2EmotionClassifier {
    model: Wav2Vec2ForAudioClassification,
    labels: Vec<String>,
    device: Device,
    /// Rate the checkpoint was trained at (from `preprocessor_config.json`)
    sampling_rate: u32,
    do_normalize: bool,
    top_k: Option<usize>,
}

impl Wav2Vec2EmotionClassifier {
    pub fn new(
        model: Wav2Vec2ForAudioClassification,
        device: Device,
        sampling_rate: u32,
        do_normalize: bool,
        top_k: Option<usize>,
    ) -> Result<Self> {
        let labels = model.config.labels()?;
        Ok(Self {
            model,
            labels,
            device,
            sampling_rate,
            do_normalize,
            top_k,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    fn run(&self, samples: &[f32]) -> Result<Vec<EmotionScore>> {
        let input = if self.do_normalize {
            zero_mean_unit_var(samples)
        } else {
            samples.to_vec()
        };

        let len = input.len();
        let tensor = Tensor::from_vec(input, (1, len), &self.device)?;
        let probabilities = self.model.forward(&tensor)?.squeeze(0)?.to_vec1::<f32>()?;

        Ok(rank_scores(&self.labels, &probabilities, self.top_k))
    }
}

impl EmotionClassifier for Wav2Vec2EmotionClassifier {
    fn classify(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<EmotionScore>, ClassifierError> {
        if samples.is_empty() {
            return Err(ClassifierError::Inference("empty audio window".to_string()));
        }
        if sample_rate != self.sampling_rate {
            return Err(ClassifierError::Inference(format!(
                "sample rate mismatch: model expects {} Hz, got {} Hz",
                self.sampling_rate, sample_rate
            )));
        }

        self.run(samples)
            .map_err(|e| ClassifierError::Inference(format!("{:#}", e)))
    }

    fn is_loaded(&self) -> bool {
        true
    }
}
