use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed corpus record at {path}:{line}: {source}")]
    Corpus {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cannot bucket {len} losses into groups of {bucket}")]
    LossHistory { len: usize, bucket: usize },

    #[error("plot error: {0}")]
    Plot(String),

    #[error("worker pool error: {0}")]
    Workers(#[from] rayon::ThreadPoolBuildError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
