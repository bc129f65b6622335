//! Dataset configuration for SFT example building.
//!
//! Serialised as JSON. Every field except `prompt_template` has a default, so a
//! minimal `{"prompt_template": "{text} {answer}"}` produces a working config.
//! Key lists (`context_keys`, `truncation_fields`) accept either a JSON array
//! or a comma-separated string and are normalised here, once.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;

/// Where tokens are removed from a field that must be shortened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TruncationMethod {
    /// Drop tokens from the start, keep a suffix.
    Left,
    /// Drop tokens from the end, keep a prefix.
    #[default]
    Right,
    /// Drop one contiguous block at a uniformly random offset.
    Random,
}

impl TruncationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Random => "random",
        }
    }
}

impl FromStr for TruncationMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "random" => Ok(Self::Random),
            other => Err(ConfigError::UnknownTruncationMethod(other.to_string())),
        }
    }
}

impl TryFrom<String> for TruncationMethod {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TruncationMethod> for String {
    fn from(m: TruncationMethod) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for TruncationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for turning records into SFT examples and batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftDatasetConfig {
    // ── Lengths ─────────────────────────────────────────────────────────────
    /// Hard upper bound on `input_ids` length.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    /// Examples shorter than this should be dropped by the caller.
    #[serde(default = "default_min_seq_length")]
    pub min_seq_length: usize,

    // ── Special tokens ──────────────────────────────────────────────────────
    #[serde(default)]
    pub add_bos: bool,
    #[serde(default = "default_true")]
    pub add_eos: bool,
    /// Insert `sep_id` between the prompt and the answer.
    #[serde(default)]
    pub add_sep: bool,
    #[serde(default)]
    pub sep_id: Option<u32>,
    /// Number of EOS placeholders reserved for injected virtual-token embeddings.
    #[serde(default)]
    pub virtual_tokens: usize,
    /// Inference only: tokens reserved for generation. Disables EOS when > 0.
    #[serde(default)]
    pub tokens_to_generate: usize,

    // ── Fields & template ───────────────────────────────────────────────────
    #[serde(
        default = "default_context_keys",
        deserialize_with = "deserialize_key_list"
    )]
    pub context_keys: Vec<String>,
    #[serde(default = "default_label_key")]
    pub label_key: String,
    /// Template such as `Q: {question}\n\nA: {answer}`; label placeholder last.
    pub prompt_template: String,

    // ── Truncation & loss ───────────────────────────────────────────────────
    #[serde(
        default = "default_truncation_fields",
        deserialize_with = "deserialize_key_list"
    )]
    pub truncation_fields: Vec<String>,
    #[serde(default)]
    pub truncation_method: TruncationMethod,
    /// Only answer tokens contribute to the loss.
    #[serde(default = "default_true")]
    pub answer_only_loss: bool,
    /// Pad every batch to `max_seq_length` instead of the batch maximum.
    #[serde(default)]
    pub pad_to_max_length: bool,

    // ── Sampling & storage ──────────────────────────────────────────────────
    /// Oversample / subsample to this many samples (None = one pass over records).
    #[serde(default)]
    pub max_num_samples: Option<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Directory for the JSONL line-index cache (None = next to the data file).
    #[serde(default)]
    pub index_mapping_dir: Option<PathBuf>,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_max_seq_length() -> usize {
    1024
}
fn default_min_seq_length() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_context_keys() -> Vec<String> {
    vec!["text".to_string()]
}
fn default_label_key() -> String {
    "answer".to_string()
}
fn default_truncation_fields() -> Vec<String> {
    vec!["text".to_string()]
}
fn default_seed() -> u64 {
    1234
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyListRepr {
    Joined(String),
    List(Vec<String>),
}

/// Accept `"a,b"` or `["a", "b"]`; trim entries and drop empty ones.
fn deserialize_key_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match KeyListRepr::deserialize(deserializer)? {
        KeyListRepr::Joined(s) => s.split(',').map(str::to_string).collect::<Vec<_>>(),
        KeyListRepr::List(v) => v,
    };
    Ok(raw
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for SftDatasetConfig {
    fn default() -> Self {
        Self {
            max_seq_length: 1024,
            min_seq_length: 1,
            add_bos: false,
            add_eos: true,
            add_sep: false,
            sep_id: None,
            virtual_tokens: 0,
            tokens_to_generate: 0,
            context_keys: default_context_keys(),
            label_key: default_label_key(),
            prompt_template: "{text} {answer}".to_string(),
            truncation_fields: default_truncation_fields(),
            truncation_method: TruncationMethod::Right,
            answer_only_loss: true,
            pad_to_max_length: false,
            max_num_samples: None,
            seed: 1234,
            index_mapping_dir: None,
        }
    }
}

impl SftDatasetConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// EOS is appended only when the generation length is not fixed externally.
    pub fn appends_eos(&self) -> bool {
        self.add_eos && self.tokens_to_generate == 0
    }

    /// Normalise and check the config. Consumes `self` so the template is
    /// escape-decoded exactly once.
    pub fn validate(mut self) -> Result<ValidatedConfig, ConfigError> {
        if self.max_seq_length == 0 {
            return Err(ConfigError::ZeroMaxSeqLength);
        }
        if self.context_keys.is_empty() {
            return Err(ConfigError::NoContextKeys);
        }
        if self.context_keys.contains(&self.label_key) {
            return Err(ConfigError::LabelIsContext(self.label_key.clone()));
        }
        if self.add_sep && self.sep_id.is_none() {
            return Err(ConfigError::MissingSepId);
        }

        // Legacy checkpoints stored truncation_fields = ["context"] with context_keys = ["input"].
        if self.truncation_fields == ["context"] && self.context_keys == ["input"] {
            self.truncation_fields = vec!["input".to_string()];
        }
        if let Some(field) = self
            .truncation_fields
            .iter()
            .find(|f| !self.context_keys.contains(*f))
        {
            return Err(ConfigError::TruncationFieldNotContext {
                field: field.clone(),
                context_keys: self.context_keys.clone(),
            });
        }

        self.prompt_template = unescape_template(&self.prompt_template);
        Ok(ValidatedConfig(self))
    }
}

/// A config that passed [`SftDatasetConfig::validate`]. Read-only.
#[derive(Debug, Clone)]
pub struct ValidatedConfig(SftDatasetConfig);

impl ValidatedConfig {
    pub fn into_inner(self) -> SftDatasetConfig {
        self.0
    }
}

impl Deref for ValidatedConfig {
    type Target = SftDatasetConfig;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Decode backslash escapes typed on a command line (`\n`, `\t`, `\uXXXX`, ...).
///
/// Unknown escapes are kept verbatim, backslash included.
pub fn unescape_template(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('n') => push_and_skip(&mut out, &mut chars, '\n'),
            Some('t') => push_and_skip(&mut out, &mut chars, '\t'),
            Some('r') => push_and_skip(&mut out, &mut chars, '\r'),
            Some('0') => push_and_skip(&mut out, &mut chars, '\0'),
            Some('\\') => push_and_skip(&mut out, &mut chars, '\\'),
            Some('\'') => push_and_skip(&mut out, &mut chars, '\''),
            Some('"') => push_and_skip(&mut out, &mut chars, '"'),
            Some(kind @ ('x' | 'u')) => {
                let width = if kind == 'x' { 2 } else { 4 };
                let digits: String = chars.clone().skip(1).take(width).collect();
                let decoded = (digits.len() == width)
                    .then(|| u32::from_str_radix(&digits, 16).ok())
                    .flatten()
                    .and_then(char::from_u32);
                match decoded {
                    Some(ch) => {
                        out.push(ch);
                        for _ in 0..=width {
                            chars.next();
                        }
                    }
                    None => out.push('\\'),
                }
            }
            _ => out.push('\\'),
        }
    }
    out
}

fn push_and_skip(
    out: &mut String,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    decoded: char,
) {
    out.push(decoded);
    chars.next();
}

// ── Tests ───────────────────────────────────────────────────────────────────
