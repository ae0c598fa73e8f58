use crate::checkpoint::{self, CheckpointMeta};
use crate::data::{Dataset, Example};
use crate::error::{Error, Result};
use crate::model::GPT;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Seeds every random source the run uses. Call once, before the model or
/// trainer is built. Candle's CPU backend cannot be seeded, so only
/// accelerator devices are.
pub fn set_seed(seed: u64, device: &Device) -> candle_core::Result<StdRng> {
    if !device.is_cpu() {
        device.set_seed(seed)?;
    }
    Ok(StdRng::seed_from_u64(seed))
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub learning_rate: f64,
    pub max_iters: usize,
    /// Threads fetching examples. 0 fetches them on the training thread.
    pub num_workers: usize,
    pub batch_size: usize,
    pub betas: (f64, f64),
    pub weight_decay: f64,
    pub grad_norm_clip: f64,
    pub checkpoint_iters: Option<usize>,
    pub checkpoint_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            max_iters: 50_000,
            num_workers: 4,
            batch_size: 64,
            betas: (0.9, 0.95),
            weight_decay: 0.1,
            grad_norm_clip: 1.0,
            checkpoint_iters: None,
            checkpoint_dir: PathBuf::from("checkpoints"),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(msg));
        if !(self.learning_rate > 0.) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if self.max_iters == 0 || self.batch_size == 0 {
            return invalid("max_iters and batch_size must be positive".to_string());
        }
        let (b1, b2) = self.betas;
        if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
            return invalid(format!("betas must be in [0, 1), got ({b1}, {b2})"));
        }
        if self.weight_decay < 0. || !(self.grad_norm_clip > 0.) {
            return invalid("weight_decay must be >= 0 and grad_norm_clip > 0".to_string());
        }
        if self.checkpoint_iters == Some(0) {
            return invalid("checkpoint_iters must be positive when set".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrainerEvent {
    BatchEnd,
}

/// What a callback sees at the end of a step.
#[derive(Debug, Clone, Copy)]
pub struct StepState {
    pub iter_num: usize,
    pub iter_dt: Duration,
    pub loss: f32,
}

pub type Callback = Box<dyn FnMut(&StepState)>;

// Only linear weight matrices are decayed; biases, norms and embeddings are not.
fn decays(name: &str) -> bool {
    ["c_attn", "c_proj", "c_fc", "lm_head"]
        .iter()
        .any(|m| name.ends_with(&format!("{m}.weight")))
}

/// Rescales `grads` in place so that their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> candle_core::Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            let scaled = match grads.get(var) {
                Some(g) => g.affine(scale, 0.)?,
                None => continue,
            };
            grads.insert(var, scaled);
        }
    }
    Ok(norm)
}

fn stack(examples: &[Example], device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
    let batch_size = examples.len();
    let seq_len = examples.first().map_or(0, |e| e.input.len());
    let mut inputs = Vec::with_capacity(batch_size * seq_len);
    let mut targets = Vec::with_capacity(batch_size * seq_len);
    for example in examples {
        inputs.extend_from_slice(&example.input);
        targets.extend_from_slice(&example.target);
    }
    Ok((
        Tensor::from_vec(inputs, (batch_size, seq_len), device)?,
        Tensor::from_vec(targets, (batch_size, seq_len), device)?,
    ))
}

pub struct Trainer<'a, D: Dataset + Sync> {
    config: TrainConfig,
    model: &'a GPT,
    varmap: &'a VarMap,
    dataset: &'a D,
    rng: StdRng,
    callbacks: HashMap<TrainerEvent, Vec<Callback>>,
    iter_num: usize,
    losses: Vec<f32>,
}

impl<'a, D: Dataset + Sync> Trainer<'a, D> {
    pub fn new(
        config: TrainConfig,
        model: &'a GPT,
        varmap: &'a VarMap,
        dataset: &'a D,
        rng: StdRng,
    ) -> Result<Self> {
        config.validate()?;
        if dataset.is_empty() {
            return Err(Error::Config("cannot train on an empty dataset".to_string()));
        }
        Ok(Self {
            config,
            model,
            varmap,
            dataset,
            rng,
            callbacks: HashMap::new(),
            iter_num: model.iter_num,
            losses: Vec::new(),
        })
    }

    /// Replaces every callback registered for `event`.
    pub fn set_callback(&mut self, event: TrainerEvent, callback: Callback) {
        self.callbacks.insert(event, vec![callback]);
    }

    pub fn add_callback(&mut self, event: TrainerEvent, callback: Callback) {
        self.callbacks.entry(event).or_default().push(callback);
    }

    fn trigger(&mut self, event: TrainerEvent, state: &StepState) {
        if let Some(callbacks) = self.callbacks.get_mut(&event) {
            for callback in callbacks.iter_mut() {
                callback(state);
            }
        }
    }

    pub fn iter_num(&self) -> usize {
        self.iter_num
    }

    /// One loss per completed step, in order.
    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    pub fn into_losses(self) -> Vec<f32> {
        self.losses
    }

    fn fetch(&mut self, pool: Option<&rayon::ThreadPool>) -> Result<Vec<Example>> {
        let len = self.dataset.len();
        let indices: Vec<usize> = (0..self.config.batch_size)
            .map(|_| self.rng.gen_range(0..len))
            .collect();
        let dataset = self.dataset;
        match pool {
            None => indices.iter().map(|&i| dataset.get(i)).collect(),
            Some(pool) => pool.install(|| indices.par_iter().map(|&i| dataset.get(i)).collect()),
        }
    }

    fn optimizers(&self) -> Result<(AdamW, AdamW)> {
        let params = |weight_decay: f64| ParamsAdamW {
            lr: self.config.learning_rate,
            beta1: self.config.betas.0,
            beta2: self.config.betas.1,
            weight_decay,
            ..ParamsAdamW::default()
        };
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Config("variable map lock poisoned".to_string()))?;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        let (decay, no_decay): (Vec<&String>, Vec<&String>) =
            names.into_iter().partition(|name| decays(name));
        let vars = |names: Vec<&String>| -> Vec<Var> { names.iter().map(|n| data[*n].clone()).collect() };
        let opt_decay = AdamW::new(vars(decay), params(self.config.weight_decay))?;
        let opt_no_decay = AdamW::new(vars(no_decay), params(0.))?;
        Ok((opt_decay, opt_no_decay))
    }

    /// Runs until `max_iters`, starting from the model's iteration counter.
    pub fn run(&mut self) -> Result<()> {
        let device = self.model.device().clone();
        let (mut opt_decay, mut opt_no_decay) = self.optimizers()?;
        let all_vars = self.varmap.all_vars();
        let pool = match self.config.num_workers {
            0 => None,
            n => Some(rayon::ThreadPoolBuilder::new().num_threads(n).build()?),
        };
        tracing::info!(
            start = self.iter_num,
            max_iters = self.config.max_iters,
            batch_size = self.config.batch_size,
            "training"
        );

        while self.iter_num < self.config.max_iters {
            let start = Instant::now();
            let examples = self.fetch(pool.as_ref())?;
            let (x, y) = stack(&examples, &device)?;

            let (_, loss) = self.model.forward(&x, Some(&y), true)?;
            let loss = loss.ok_or_else(|| Error::Config("model returned no loss".to_string()))?;
            let mut grads = loss.backward()?;
            clip_grad_norm(&mut grads, &all_vars, self.config.grad_norm_clip)?;
            opt_decay.step(&grads)?;
            opt_no_decay.step(&grads)?;

            let loss = loss.to_vec0::<f32>()?;
            self.losses.push(loss);
            let state = StepState {
                iter_num: self.iter_num,
                iter_dt: start.elapsed(),
                loss,
            };
            self.trigger(TrainerEvent::BatchEnd, &state);
            self.iter_num += 1;

            if let Some(every) = self.config.checkpoint_iters {
                if self.iter_num % every == 0 {
                    let meta = CheckpointMeta {
                        iter_num: self.iter_num,
                        loss: Some(loss),
                    };
                    checkpoint::save(self.varmap, &self.config.checkpoint_dir, &meta)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelConfig, ModelType};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Repeats the sequence 0, 1, 2, ... so the next token is always predictable.
    struct Counting {
        len: usize,
        seq_len: usize,
    }

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, idx: usize) -> Result<Example> {
            let tokens: Vec<u32> = (0..=self.seq_len).map(|i| ((idx + i) % 8) as u32).collect();
            Ok(crate::data::shift_pair(&tokens))
        }
    }

    fn small_config(max_iters: usize) -> TrainConfig {
        TrainConfig {
            learning_rate: 1e-2,
            max_iters,
            num_workers: 0,
            batch_size: 4,
            ..TrainConfig::default()
        }
    }

    fn nano() -> ModelConfig {
        ModelConfig::new(ModelType::GptNano, 8, 6).unwrap()
    }

    #[test]
    fn decays_only_linear_weights() {
        assert!(decays("transformer.h.0.attn.c_attn.weight"));
        assert!(decays("lm_head.weight"));
        assert!(!decays("transformer.h.0.attn.c_attn.bias"));
        assert!(!decays("transformer.wte.weight"));
        assert!(!decays("transformer.h.1.ln_2.weight"));
    }

    #[test]
    fn validates_config() {
        assert!(TrainConfig::default().validate().is_ok());
        assert!(small_config(0).validate().is_err());
        let cfg = TrainConfig {
            checkpoint_iters: Some(0),
            ..small_config(1)
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn clips_gradient_norm() -> anyhow::Result<()> {
        let var = Var::new(&[3f32, 4.], &Device::Cpu)?;
        let loss = var.as_tensor().sqr()?.sum_all()?.affine(0.5, 0.)?;
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&mut grads, &[var.clone()], 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5);
        let clipped: Vec<f32> = grads.get(&var).unwrap().to_vec1()?;
        assert!((clipped[0] - 0.6).abs() < 1e-4);
        assert!((clipped[1] - 0.8).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn records_one_loss_per_step_and_fires_callbacks() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let rng = set_seed(3407, &device)?;
        let mut varmap = VarMap::new();
        let model = GPT::load(&nano(), &mut varmap, &device)?;
        let dataset = Counting { len: 16, seq_len: 6 };
        let mut trainer = Trainer::new(small_config(30), &model, &varmap, &dataset, rng)?;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        trainer.set_callback(
            TrainerEvent::BatchEnd,
            Box::new(move |s: &StepState| sink.borrow_mut().push(s.iter_num)),
        );
        trainer.run()?;

        assert_eq!(trainer.iter_num(), 30);
        assert_eq!(*seen.borrow(), (0..30).collect::<Vec<_>>());
        let losses = trainer.into_losses();
        assert_eq!(losses.len(), 30);
        let head: f32 = losses[..5].iter().sum();
        let tail: f32 = losses[25..].iter().sum();
        assert!(tail < head, "loss did not decrease: {head} -> {tail}");
        Ok(())
    }

    #[test]
    fn add_callback_appends_and_set_callback_replaces() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let model = GPT::load(&nano(), &mut varmap, &device)?;
        let dataset = Counting { len: 8, seq_len: 6 };
        let counter = |count: &Rc<Cell<usize>>| -> Callback {
            let count = count.clone();
            Box::new(move |_: &StepState| count.set(count.get() + 1))
        };
        let (first, second, third) = (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));

        let rng = set_seed(3407, &device)?;
        let mut trainer = Trainer::new(small_config(3), &model, &varmap, &dataset, rng)?;
        trainer.add_callback(TrainerEvent::BatchEnd, counter(&first));
        trainer.add_callback(TrainerEvent::BatchEnd, counter(&second));
        trainer.run()?;
        assert_eq!((first.get(), second.get()), (3, 3));

        let rng = set_seed(3407, &device)?;
        let mut trainer = Trainer::new(small_config(2), &model, &varmap, &dataset, rng)?;
        trainer.add_callback(TrainerEvent::BatchEnd, counter(&first));
        trainer.add_callback(TrainerEvent::BatchEnd, counter(&second));
        trainer.set_callback(TrainerEvent::BatchEnd, counter(&third));
        trainer.run()?;
        assert_eq!((first.get(), second.get(), third.get()), (3, 3, 2));
        Ok(())
    }

    #[test]
    fn parallel_workers_fetch_full_batches() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let model = GPT::load(&nano(), &mut varmap, &device)?;
        let dataset = Counting { len: 16, seq_len: 6 };
        let cfg = TrainConfig {
            num_workers: 2,
            ..small_config(2)
        };
        let mut trainer = Trainer::new(cfg, &model, &varmap, &dataset, set_seed(1, &device)?)?;
        trainer.run()?;
        assert_eq!(trainer.losses().len(), 2);
        Ok(())
    }

    #[test]
    fn resumes_from_checkpoint() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let dataset = Counting { len: 4, seq_len: 6 };
        let cfg = TrainConfig {
            checkpoint_iters: Some(2),
            checkpoint_dir: dir.path().to_path_buf(),
            ..small_config(4)
        };

        let mut varmap = VarMap::new();
        let model = GPT::load(&nano(), &mut varmap, &device)?;
        Trainer::new(cfg.clone(), &model, &varmap, &dataset, set_seed(7, &device)?)?.run()?;
        let ckpt = dir.path().join("ckpt_4.safetensors");
        assert!(ckpt.is_file());
        assert!(dir.path().join("ckpt_2.safetensors").is_file());

        let mut resumed_map = VarMap::new();
        let resumed = GPT::load(&nano().with_checkpoint(Some(ckpt)), &mut resumed_map, &device)?;
        assert_eq!(resumed.iter_num, 4);
        let cfg = TrainConfig {
            max_iters: 3 + resumed.iter_num,
            checkpoint_iters: None,
            ..cfg
        };
        let mut trainer = Trainer::new(cfg, &resumed, &resumed_map, &dataset, set_seed(7, &device)?)?;
        trainer.run()?;
        assert_eq!(trainer.losses().len(), 3);
        assert_eq!(trainer.iter_num(), 7);
        Ok(())
    }

    #[test]
    fn rejects_empty_dataset() -> anyhow::Result<()> {
        let mut varmap = VarMap::new();
        let model = GPT::load(&nano(), &mut varmap, &Device::Cpu)?;
        let dataset = Counting { len: 0, seq_len: 6 };
        let result = Trainer::new(small_config(1), &model, &varmap, &dataset, set_seed(0, &Device::Cpu)?);
        assert!(matches!(result, Err(Error::Config(_))));
        Ok(())
    }
}
