use crate::data::{self, Corpus, TokenizedCorpus};
use crate::error::Error;
use crate::model::{ModelConfig, ModelType, GPT};
use crate::report::{self, RemainderPolicy};
use crate::train::{set_seed, StepState, TrainConfig, Trainer, TrainerEvent};
use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use candle_transformers::generation::LogitsProcessor;
use clap::Parser;
use std::path::PathBuf;

/// Pretrain a GPT on a JSON-lines corpus and plot the loss curve.
#[derive(Parser, Debug, Clone)]
#[command(name = "mingpt-pile", version)]
pub struct Args {
    /// JSON-lines corpus with a `text` field per line, optionally gzipped
    #[arg(long, default_value = "data/pile_data_10.jsonl")]
    pub data: PathBuf,

    /// Local tokenizer.json, or a directory containing one
    #[arg(long, default_value = "gpt2_tokenizer")]
    pub tokenizer: PathBuf,

    /// Hub repository to fetch the tokenizer from when it is not found locally
    #[arg(long, default_value = "gpt2")]
    pub tokenizer_repo: String,

    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, default_value = "<|endoftext|>")]
    pub pad_token: String,

    /// Tokens per record; the model context is one less
    #[arg(long, default_value_t = 1024)]
    pub max_length: usize,

    #[arg(long, default_value = "gpt2")]
    pub model_type: String,

    /// safetensors weights to resume from
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 5e-4)]
    pub learning_rate: f64,

    /// Iterations on top of any already in the checkpoint
    #[arg(long, default_value_t = 50_000)]
    pub max_iters: usize,

    #[arg(long, default_value_t = 0)]
    pub num_workers: usize,

    #[arg(long, default_value_t = 10_000)]
    pub checkpoint_iters: usize,

    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 3407)]
    pub seed: u64,

    #[arg(long, default_value_t = 100)]
    pub log_every: usize,

    #[arg(long, default_value_t = report::LOSS_BUCKET)]
    pub loss_bucket: usize,

    /// Plot complete buckets only instead of failing on a partial one
    #[arg(long)]
    pub drop_partial_bucket: bool,

    #[arg(long, default_value = "mingpt_loss.png")]
    pub plot: PathBuf,

    /// Print a sample continuation of this prompt after training
    #[arg(long)]
    pub sample_prompt: Option<String>,

    #[arg(long, default_value_t = 50)]
    pub sample_tokens: usize,
}

impl Args {
    pub fn train_config(&self, resumed_iters: usize) -> TrainConfig {
        TrainConfig {
            learning_rate: self.learning_rate,
            max_iters: self.max_iters + resumed_iters,
            num_workers: self.num_workers,
            checkpoint_iters: Some(self.checkpoint_iters).filter(|&n| n > 0),
            checkpoint_dir: self.checkpoint_dir.clone(),
            batch_size: self.batch_size,
            ..TrainConfig::default()
        }
    }

    pub fn remainder_policy(&self) -> RemainderPolicy {
        if self.drop_partial_bucket {
            RemainderPolicy::Truncate
        } else {
            RemainderPolicy::Fail
        }
    }
}

fn sample(model: &GPT, dataset: &TokenizedCorpus, prompt: &str, args: &Args) -> Result<String> {
    let tokenizer = dataset.tokenizer();
    let ids = tokenizer
        .encode(prompt, true)
        .map_err(anyhow::Error::msg)?
        .get_ids()
        .to_vec();
    if ids.is_empty() {
        return Err(Error::Config(format!("sample prompt {prompt:?} encodes to no tokens")).into());
    }
    let prompt = Tensor::new(ids.as_slice(), model.device())?.unsqueeze(0)?;
    let mut sampler = LogitsProcessor::new(args.seed, Some(1.0), None);
    let out = model.generate(&prompt, args.sample_tokens, &mut sampler)?;
    let out: Vec<u32> = out.squeeze(0)?.to_vec1()?;
    tokenizer.decode(&out, true).map_err(anyhow::Error::msg)
}

/// load → adapt → configure model → configure and run trainer → plot → sample.
/// Returns the path of the written loss curve.
pub fn run(args: &Args) -> Result<PathBuf> {
    let device = Device::cuda_if_available(0)?;
    let rng = set_seed(args.seed, &device)?;

    let corpus = Corpus::from_jsonl(&args.data)
        .with_context(|| format!("loading corpus {}", args.data.display()))?;
    let tokenizer = data::load_tokenizer(&args.tokenizer, &args.tokenizer_repo, args.cache_dir.as_deref())?;
    let pad_id = data::pad_token_id(&tokenizer, &args.pad_token)?;
    let dataset = TokenizedCorpus::new(corpus, tokenizer, args.max_length, pad_id)?;
    tracing::info!(
        vocab_size = dataset.vocab_size(),
        max_length = args.max_length,
        pad_id = dataset.pad_id(),
        "dataset ready"
    );

    let model_type: ModelType = args.model_type.parse()?;
    let model_cfg = ModelConfig::new(model_type, dataset.vocab_size(), dataset.block_size())?
        .with_checkpoint(args.checkpoint.clone());
    let mut varmap = VarMap::new();
    let model = GPT::load(&model_cfg, &mut varmap, &device)?;
    tracing::info!(model_type = %args.model_type, block_size = model.block_size(), "model ready");

    let log_every = args.log_every.max(1);
    let mut trainer = Trainer::new(args.train_config(model.iter_num), &model, &varmap, &dataset, rng)?;
    trainer.set_callback(
        TrainerEvent::BatchEnd,
        Box::new(move |s: &StepState| {
            if s.iter_num % log_every == 0 {
                tracing::info!(
                    "iter_dt {:.2}ms; iter {}: train loss {:.5}",
                    s.iter_dt.as_secs_f64() * 1000.,
                    s.iter_num,
                    s.loss
                );
            }
        }),
    );
    trainer.run()?;
    let losses = trainer.into_losses();

    let means = report::bucket_means(&losses, args.loss_bucket, args.remainder_policy())?;
    report::plot_loss_curve(&means, &args.plot)?;

    // the loss curve is already on disk, a failed sample only warns
    if let Some(prompt) = &args.sample_prompt {
        match sample(&model, &dataset, prompt, args) {
            Ok(text) => tracing::info!("sample: {text}"),
            Err(e) => tracing::warn!("sampling failed: {e:#}"),
        }
    }
    Ok(args.plot.clone())
}
