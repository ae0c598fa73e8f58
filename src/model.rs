use crate::checkpoint;
use crate::error::Error;
use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{
    init::Init, layer_norm, loss::cross_entropy, ops, Dropout, Embedding, LayerNorm, Linear,
    Module, VarBuilder, VarMap,
};
use candle_transformers::generation::LogitsProcessor;
use std::path::PathBuf;
use std::str::FromStr;

const INIT_STD: f64 = 0.02;

/// Named GPT sizes, as (n_layer, n_head, n_embd).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    OpenAiGpt,
    Gpt2,
    Gpt2Medium,
    Gpt2Large,
    Gpt2Xl,
    Gopher44m,
    GptMini,
    GptMicro,
    GptNano,
}

impl ModelType {
    pub fn dims(&self) -> (usize, usize, usize) {
        match self {
            ModelType::OpenAiGpt | ModelType::Gpt2 => (12, 12, 768),
            ModelType::Gpt2Medium => (24, 16, 1024),
            ModelType::Gpt2Large => (36, 20, 1280),
            ModelType::Gpt2Xl => (48, 25, 1600),
            ModelType::Gopher44m => (8, 16, 512),
            ModelType::GptMini => (6, 6, 192),
            ModelType::GptMicro => (4, 4, 128),
            ModelType::GptNano => (3, 3, 48),
        }
    }
}

impl FromStr for ModelType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let model_type = match s {
            "openai-gpt" => ModelType::OpenAiGpt,
            "gpt2" => ModelType::Gpt2,
            "gpt2-medium" => ModelType::Gpt2Medium,
            "gpt2-large" => ModelType::Gpt2Large,
            "gpt2-xl" => ModelType::Gpt2Xl,
            "gopher-44m" => ModelType::Gopher44m,
            "gpt-mini" => ModelType::GptMini,
            "gpt-micro" => ModelType::GptMicro,
            "gpt-nano" => ModelType::GptNano,
            other => return Err(Error::Config(format!("unknown model type {other:?}"))),
        };
        Ok(model_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Architecture {
    Named(ModelType),
    Custom {
        n_layer: usize,
        n_head: usize,
        n_embd: usize,
    },
}

impl Architecture {
    pub fn dims(&self) -> (usize, usize, usize) {
        match self {
            Architecture::Named(model_type) => model_type.dims(),
            Architecture::Custom {
                n_layer,
                n_head,
                n_embd,
            } => (*n_layer, *n_head, *n_embd),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub vocab_size: usize,
    pub block_size: usize,
    pub embd_pdrop: f32,
    pub resid_pdrop: f32,
    pub attn_pdrop: f32,
    /// Weights (and the iteration counter) to resume from.
    pub checkpoint: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::Named(ModelType::Gpt2),
            vocab_size: 50257,
            block_size: 1023,
            embd_pdrop: 0.1,
            resid_pdrop: 0.1,
            attn_pdrop: 0.1,
            checkpoint: None,
        }
    }
}

impl ModelConfig {
    pub fn new(model_type: ModelType, vocab_size: usize, block_size: usize) -> crate::Result<Self> {
        let cfg = Self {
            architecture: Architecture::Named(model_type),
            vocab_size,
            block_size,
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_checkpoint(mut self, checkpoint: Option<PathBuf>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        let (n_layer, n_head, n_embd) = self.architecture.dims();
        if self.vocab_size == 0 || self.block_size == 0 {
            return Err(Error::Config(
                "vocab_size and block_size must be positive".to_string(),
            ));
        }
        if n_layer == 0 || n_head == 0 || n_embd % n_head != 0 {
            return Err(Error::Config(format!(
                "n_embd ({n_embd}) must be a multiple of n_head ({n_head}) with at least one layer"
            )));
        }
        for (name, p) in [
            ("embd_pdrop", self.embd_pdrop),
            ("resid_pdrop", self.resid_pdrop),
            ("attn_pdrop", self.attn_pdrop),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }
}

fn normal_linear(in_dim: usize, out_dim: usize, std: f64, bias: bool, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.,
            stdev: std,
        },
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

fn normal_embedding(num: usize, dim: usize, vb: VarBuilder) -> Result<Embedding> {
    let embeddings = vb.get_with_hints(
        (num, dim),
        "weight",
        Init::Randn {
            mean: 0.,
            stdev: INIT_STD,
        },
    )?;
    Ok(Embedding::new(embeddings, dim))
}

fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_slice(&mask, (t, t), device)
}

struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    n_head: usize,
    n_embd: usize,
}

impl CausalSelfAttention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let (n_layer, n_head, n_embd) = cfg.architecture.dims();
        let proj_std = INIT_STD / ((2 * n_layer) as f64).sqrt();
        let c_attn = normal_linear(n_embd, 3 * n_embd, INIT_STD, true, vb.pp("c_attn"))?;
        let c_proj = normal_linear(n_embd, n_embd, proj_std, true, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            attn_dropout: Dropout::new(cfg.attn_pdrop),
            resid_dropout: Dropout::new(cfg.resid_pdrop),
            n_head,
            n_embd,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let head_size = self.n_embd / self.n_head;
        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            qkv.narrow(D::Minus1, i * c, c)?
                .reshape((b, t, self.n_head, head_size))?
                .transpose(1, 2)?
                .contiguous()
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);

        let att = q
            .matmul(&k.t()?)?
            .affine(1. / (head_size as f64).sqrt(), 0.)?;
        let mask = causal_mask(t, x.device())?.broadcast_as(att.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, x.device())?.broadcast_as(att.shape())?;
        let att = mask.where_cond(&neg_inf, &att)?;
        let att = ops::softmax(&att, D::Minus1)?;
        let att = self.attn_dropout.forward(&att, train)?;

        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, c))?;
        self.resid_dropout.forward(&self.c_proj.forward(&y)?, train)
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    dropout: Dropout,
}

impl Mlp {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let (n_layer, _, n_embd) = cfg.architecture.dims();
        let proj_std = INIT_STD / ((2 * n_layer) as f64).sqrt();
        let c_fc = normal_linear(n_embd, 4 * n_embd, INIT_STD, true, vb.pp("c_fc"))?;
        let c_proj = normal_linear(4 * n_embd, n_embd, proj_std, true, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            c_proj,
            dropout: Dropout::new(cfg.resid_pdrop),
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        // tanh approximation of GELU, as in GPT-2
        let out = self.c_fc.forward(x)?.gelu()?;
        self.dropout.forward(&self.c_proj.forward(&out)?, train)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let (_, _, n_embd) = cfg.architecture.dims();
        Ok(Self {
            ln_1: layer_norm(n_embd, 1e-5, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(n_embd, 1e-5, vb.pp("ln_2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.add(&self.attn.forward(&self.ln_1.forward(x)?, train)?)?;
        x.add(&self.mlp.forward(&self.ln_2.forward(&x)?, train)?)
    }
}

pub struct GPT {
    wte: Embedding,
    wpe: Embedding,
    drop: Dropout,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    block_size: usize,
    device: Device,
    /// Iterations already trained, non-zero when resumed from a checkpoint.
    pub iter_num: usize,
}

impl GPT {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let (n_layer, _, n_embd) = cfg.architecture.dims();
        let vt = vb.pp("transformer");
        let wte = normal_embedding(cfg.vocab_size, n_embd, vt.pp("wte"))?;
        let wpe = normal_embedding(cfg.block_size, n_embd, vt.pp("wpe"))?;
        let mut blocks = Vec::with_capacity(n_layer);
        for i in 0..n_layer {
            blocks.push(Block::new(cfg, vt.pp(format!("h.{i}")))?);
        }
        let ln_f = layer_norm(n_embd, 1e-5, vt.pp("ln_f"))?;
        let lm_head = normal_linear(n_embd, cfg.vocab_size, INIT_STD, false, vb.pp("lm_head"))?;
        Ok(Self {
            wte,
            wpe,
            drop: Dropout::new(cfg.embd_pdrop),
            blocks,
            ln_f,
            lm_head,
            block_size: cfg.block_size,
            device: vb.device().clone(),
            iter_num: 0,
        })
    }

    /// Builds the model into `varmap`, restoring weights and the iteration
    /// counter when the config names a checkpoint.
    pub fn load(cfg: &ModelConfig, varmap: &mut VarMap, device: &Device) -> crate::Result<Self> {
        cfg.validate()?;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let mut model = Self::new(cfg, vb)?;
        if let Some(path) = &cfg.checkpoint {
            let meta = checkpoint::load(varmap, path)?;
            model.iter_num = meta.iter_num;
            tracing::info!(path = %path.display(), iter_num = meta.iter_num, "resumed from checkpoint");
        }
        let n_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        tracing::info!("number of parameters: {:.2}M", n_params as f64 / 1e6);
        Ok(model)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the logits and, when `targets` are given, the mean
    /// cross-entropy over every position.
    pub fn forward(
        &self,
        idx: &Tensor,
        targets: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_, t) = idx.dims2()?;
        if t > self.block_size {
            candle_core::bail!(
                "cannot forward sequence of length {t}, block size is only {}",
                self.block_size
            );
        }
        let pos = Tensor::arange(0u32, t as u32, idx.device())?;
        let tok_emb = self.wte.forward(idx)?;
        let pos_emb = self.wpe.forward(&pos)?;
        let mut x = self.drop.forward(&tok_emb.broadcast_add(&pos_emb)?, train)?;
        for block in self.blocks.iter() {
            x = block.forward(&x, train)?;
        }
        let logits = self.lm_head.forward(&self.ln_f.forward(&x)?)?;

        let loss = match targets {
            None => None,
            Some(targets) => {
                let logits_flat = logits.reshape(((), logits.dim(D::Minus1)?))?;
                let targets_flat = targets.reshape(((),))?;
                Some(cross_entropy(&logits_flat, &targets_flat)?)
            }
        };
        Ok((logits, loss))
    }

    /// Extends `prompt` (shape `(1, t)`) by `max_new_tokens` sampled tokens,
    /// cropping the context to the block size as it grows.
    pub fn generate(
        &self,
        prompt: &Tensor,
        max_new_tokens: usize,
        sampler: &mut LogitsProcessor,
    ) -> Result<Tensor> {
        if prompt.dim(1)? == 0 {
            candle_core::bail!("cannot generate from an empty prompt");
        }
        let mut out = prompt.clone();
        for _ in 0..max_new_tokens {
            let t = out.dim(1)?;
            let context = if t > self.block_size {
                out.narrow(1, t - self.block_size, self.block_size)?
            } else {
                out.clone()
            };
            let (logits, _) = self.forward(&context, None, false)?;
            let last = logits.i((0, context.dim(1)? - 1))?;
            let next = sampler.sample(&last)?;
            let next = Tensor::new(&[[next]], out.device())?;
            out = Tensor::cat(&[&out, &next], 1)?;
        }
        Ok(out)
    }
}
