use crate::error::Result;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Stored as JSON next to the safetensors weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub iter_num: usize,
    pub loss: Option<f32>,
}

fn meta_path(weights: &Path) -> PathBuf {
    weights.with_extension("json")
}

/// Writes `ckpt_{iter_num}.safetensors` and its metadata into `dir`.
pub fn save(varmap: &VarMap, dir: &Path, meta: &CheckpointMeta) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let weights = dir.join(format!("ckpt_{}.safetensors", meta.iter_num));
    varmap.save(&weights)?;
    fs::write(meta_path(&weights), serde_json::to_string_pretty(meta)?)?;
    tracing::info!(path = %weights.display(), iter_num = meta.iter_num, "checkpoint saved");
    Ok(weights)
}

/// Restores every variable of `varmap` from `weights`. A missing metadata
/// file means the weights came from elsewhere and training starts at 0.
pub fn load(varmap: &mut VarMap, weights: &Path) -> Result<CheckpointMeta> {
    varmap.load(weights)?;
    let meta = meta_path(weights);
    if !meta.is_file() {
        tracing::warn!(path = %meta.display(), "no checkpoint metadata, iteration counter reset");
        return Ok(CheckpointMeta {
            iter_num: 0,
            loss: None,
        });
    }
    Ok(serde_json::from_str(&fs::read_to_string(meta)?)?)
}
