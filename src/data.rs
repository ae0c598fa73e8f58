use crate::error::{Error, Result};
use flate2::bufread::GzDecoder;
use hf_hub::api::sync::ApiBuilder;
use serde::Deserialize;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokenizers::{Tokenizer, TruncationParams};

/// One document of the corpus. Any other field on the JSON line is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct CorpusRecord {
    pub text: String,
}

pub struct Corpus {
    records: Vec<CorpusRecord>,
}

fn open_reader(filepath: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(filepath)?;
    let bufreader = BufReader::new(file);
    if filepath.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(bufreader))))
    } else {
        Ok(Box::new(bufreader))
    }
}

impl Corpus {
    /// Reads a JSON-lines corpus, one `{"text": ...}` object per line.
    /// Blank lines are skipped, a `.gz` suffix is decompressed on the fly.
    pub fn from_jsonl(filepath: impl AsRef<Path>) -> Result<Self> {
        let filepath = filepath.as_ref();
        let reader = open_reader(filepath)?;
        let mut records = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: CorpusRecord =
                serde_json::from_str(&line).map_err(|source| Error::Corpus {
                    path: filepath.to_path_buf(),
                    line: i + 1,
                    source,
                })?;
            records.push(record);
        }
        tracing::info!(
            path = %filepath.display(),
            records = records.len(),
            "loaded corpus"
        );
        Ok(Self { records })
    }

    pub fn from_records(records: Vec<CorpusRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&CorpusRecord> {
        self.records.get(idx)
    }
}

/// A next-token prediction pair. `target[i]` is the token following `input[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub input: Vec<u32>,
    pub target: Vec<u32>,
}

/// Length plus indexed lookup of (input, target) pairs, the only view of the
/// data the trainer needs.
pub trait Dataset {
    fn len(&self) -> usize;

    fn get(&self, idx: usize) -> Result<Example>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Truncates or right-pads `ids` to exactly `max_length` tokens.
pub fn fixed_length(mut ids: Vec<u32>, max_length: usize, pad_id: u32) -> Vec<u32> {
    ids.truncate(max_length);
    ids.resize(max_length, pad_id);
    ids
}

/// Splits a token window into the input and the input shifted left by one.
pub fn shift_pair(tokens: &[u32]) -> Example {
    let n = tokens.len();
    if n < 2 {
        return Example {
            input: Vec::new(),
            target: Vec::new(),
        };
    }
    Example {
        input: tokens[..n - 1].to_vec(),
        target: tokens[1..].to_vec(),
    }
}

/// Tokenizes corpus records on every lookup. Nothing is cached, each call to
/// `get` re-encodes the record. The tokenizer stops at `max_length` tokens, so
/// long documents are never encoded in full.
pub struct TokenizedCorpus {
    corpus: Corpus,
    tokenizer: Tokenizer,
    max_length: usize,
    pad_id: u32,
}

impl TokenizedCorpus {
    pub fn new(corpus: Corpus, mut tokenizer: Tokenizer, max_length: usize, pad_id: u32) -> Result<Self> {
        if max_length < 2 {
            return Err(Error::Config(format!(
                "max_length must be at least 2, got {max_length}"
            )));
        }
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..TruncationParams::default()
            }))
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self {
            corpus,
            tokenizer,
            max_length,
            pad_id,
        })
    }

    /// Context length a model must support to consume these examples.
    pub fn block_size(&self) -> usize {
        self.max_length - 1
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(false)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Token ids of record `idx`, at most `max_length` of them.
    pub fn encode(&self, idx: usize) -> Result<Vec<u32>> {
        let record = self.corpus.get(idx).ok_or(Error::IndexOutOfRange {
            index: idx,
            len: self.corpus.len(),
        })?;
        let encoding = self
            .tokenizer
            .encode(record.text.as_str(), true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl Dataset for TokenizedCorpus {
    fn len(&self) -> usize {
        self.corpus.len()
    }

    fn get(&self, idx: usize) -> Result<Example> {
        let tokens = fixed_length(self.encode(idx)?, self.max_length, self.pad_id);
        Ok(shift_pair(&tokens))
    }
}

/// Resolves `tokenizer.json` from a local file, a local directory holding one,
/// or the given hub repository.
pub fn load_tokenizer(local: &Path, repo: &str, cache_dir: Option<&Path>) -> Result<Tokenizer> {
    let file: PathBuf = if local.is_file() {
        local.to_path_buf()
    } else if local.join("tokenizer.json").is_file() {
        local.join("tokenizer.json")
    } else {
        tracing::info!(repo, "tokenizer not found locally, fetching from hub");
        let mut builder = ApiBuilder::new();
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        builder.build()?.model(repo.to_string()).get("tokenizer.json")?
    };
    tracing::info!(path = %file.display(), "loading tokenizer");
    Tokenizer::from_file(&file).map_err(|e| Error::Tokenizer(e.to_string()))
}

pub fn pad_token_id(tokenizer: &Tokenizer, pad_token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(pad_token)
        .ok_or_else(|| Error::Tokenizer(format!("pad token {pad_token:?} is not in the vocabulary")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture_tokenizer() -> Tokenizer {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/tokenizer.json");
        Tokenizer::from_file(path).unwrap()
    }

    fn corpus(texts: &[&str]) -> Corpus {
        Corpus::from_records(
            texts
                .iter()
                .map(|t| CorpusRecord {
                    text: t.to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn reads_jsonl_and_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"text": "hello world", "meta": {{"id": 1}}}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"text": "the dog"}}"#).unwrap();
        let corpus = Corpus::from_jsonl(file.path()).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.get(1).unwrap().text, "the dog");
    }

    #[test]
    fn reports_line_of_malformed_record() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"text": "ok"}}"#).unwrap();
        writeln!(file, r#"{{"body": "no text field"}}"#).unwrap();
        match Corpus::from_jsonl(file.path()) {
            Err(Error::Corpus { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn reads_gzipped_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.jsonl.gz");
        let mut gz = flate2::write::GzEncoder::new(
            File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        writeln!(gz, r#"{{"text": "a b"}}"#).unwrap();
        gz.finish().unwrap();
        let corpus = Corpus::from_jsonl(&path).unwrap();
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            Corpus::from_jsonl("/nonexistent/corpus.jsonl"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn target_is_input_shifted_by_one() {
        let text = "the quick brown fox jumps over the lazy dog the quick brown fox";
        let ds = TokenizedCorpus::new(corpus(&[text]), fixture_tokenizer(), 8, 1).unwrap();
        let stream = fixture_tokenizer().encode(text, true).unwrap().get_ids().to_vec();
        assert!(stream.len() > 8);
        assert_eq!(ds.encode(0).unwrap(), stream[..8]);

        let ex = ds.get(0).unwrap();
        assert_eq!(ex.input.len(), 7);
        assert_eq!(ex.target.len(), 7);
        for i in 0..ex.target.len() {
            assert_eq!(ex.input[i], stream[i]);
            assert_eq!(ex.target[i], stream[i + 1]);
        }
    }

    #[test]
    fn short_text_is_padded_to_fixed_length() {
        let ds = TokenizedCorpus::new(corpus(&["hello", ""]), fixture_tokenizer(), 6, 1).unwrap();
        let hello = ds.tokenizer().token_to_id("hello").unwrap();
        let ex = ds.get(0).unwrap();
        assert_eq!(ex.input, vec![hello, 1, 1, 1, 1]);
        assert_eq!(ex.target, vec![1; 5]);

        let empty = ds.get(1).unwrap();
        assert_eq!(empty.input.len(), 5);
        assert!(empty.input.iter().all(|&t| t == 1));
    }

    #[test]
    fn out_of_range_lookup_fails() {
        let ds = TokenizedCorpus::new(corpus(&["hello"]), fixture_tokenizer(), 4, 1).unwrap();
        assert!(matches!(
            ds.get(3),
            Err(Error::IndexOutOfRange { index: 3, len: 1 })
        ));
    }

    #[test]
    fn rejects_too_short_max_length() {
        assert!(TokenizedCorpus::new(corpus(&["hello"]), fixture_tokenizer(), 1, 1).is_err());
    }

    #[test]
    fn resolves_pad_token() {
        let tok = fixture_tokenizer();
        assert_eq!(pad_token_id(&tok, "<|endoftext|>").unwrap(), 1);
        assert!(pad_token_id(&tok, "<pad>").is_err());
    }

    #[test]
    fn loads_tokenizer_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/tokenizer.json");
        std::fs::copy(src, dir.path().join("tokenizer.json")).unwrap();
        let tok = load_tokenizer(dir.path(), "gpt2", None).unwrap();
        assert_eq!(tok.get_vocab_size(false), fixture_tokenizer().get_vocab_size(false));
    }
}
