//! Tokenizer adapter: the only way the pipeline touches a vocabulary.
//!
//! [`TokenizerAdapter`] is the contract; [`HfTokenizer`] implements it over a
//! Hugging Face `tokenizer.json`. Special tokens are never inserted by the
//! adapter itself; the example assembler owns BOS/SEP/EOS placement.

use std::path::Path;

use crate::error::{ConfigError, SftError, SftResult};

/// A field value as read from a record: raw text, or ids tokenized upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    RawText(String),
    TokenIds(Vec<u32>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::RawText(s) => s.is_empty(),
            Self::TokenIds(ids) => ids.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::RawText(s) => Some(s),
            Self::TokenIds(_) => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::RawText(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::RawText(s)
    }
}

impl From<Vec<u32>> for FieldValue {
    fn from(ids: Vec<u32>) -> Self {
        Self::TokenIds(ids)
    }
}

/// Tokenizer contract consumed by the pipeline.
///
/// Implementations must be pure with respect to `&self` so one instance can be
/// shared across worker threads.
pub trait TokenizerAdapter: Send + Sync {
    fn text_to_ids(&self, text: &str) -> SftResult<Vec<u32>>;
    fn ids_to_text(&self, ids: &[u32]) -> SftResult<String>;
    fn text_to_tokens(&self, text: &str) -> SftResult<Vec<String>>;
    fn tokens_to_text(&self, tokens: &[String]) -> SftResult<String>;
    fn ids_to_tokens(&self, ids: &[u32]) -> SftResult<Vec<String>>;
    fn bos_id(&self) -> u32;
    fn eos_id(&self) -> u32;
    /// Whether a leading space changes how text is tokenized (e.g. GPT-2 BPE).
    fn space_sensitive(&self) -> bool;

    /// Ids and token strings for `text`, index-aligned.
    fn encode_span(&self, text: &str) -> SftResult<(Vec<u32>, Vec<String>)> {
        Ok((self.text_to_ids(text)?, self.text_to_tokens(text)?))
    }

    /// Resolve a field value to ids and tokens at the tokenizer boundary.
    fn encode_value(&self, value: &FieldValue) -> SftResult<(Vec<u32>, Vec<String>)> {
        match value {
            FieldValue::RawText(text) => self.encode_span(text),
            FieldValue::TokenIds(ids) => Ok((ids.clone(), self.ids_to_tokens(ids)?)),
        }
    }
}

// ── Hugging Face tokenizers ─────────────────────────────────────────────────

/// Names of the special tokens looked up in the vocabulary at load time.
#[derive(Debug, Clone)]
pub struct SpecialTokenNames {
    pub bos: String,
    pub eos: String,
}

impl Default for SpecialTokenNames {
    fn default() -> Self {
        // GPT-2 uses one token for both ends.
        Self {
            bos: "<|endoftext|>".to_string(),
            eos: "<|endoftext|>".to_string(),
        }
    }
}

/// [`TokenizerAdapter`] over a Hugging Face `tokenizers::Tokenizer`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    bos_id: u32,
    eos_id: u32,
    space_sensitive: bool,
}

impl HfTokenizer {
    /// Load a `tokenizer.json`.
    pub fn from_file(
        path: &Path,
        specials: &SpecialTokenNames,
        space_sensitive: bool,
    ) -> SftResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| SftError::Tokenizer(format!("load {}: {e}", path.display())))?;
        Ok(Self::from_tokenizer(inner, specials, space_sensitive)?)
    }

    pub fn from_tokenizer(
        inner: tokenizers::Tokenizer,
        specials: &SpecialTokenNames,
        space_sensitive: bool,
    ) -> Result<Self, ConfigError> {
        let lookup = |name: &str| {
            inner
                .token_to_id(name)
                .ok_or_else(|| ConfigError::MissingSpecialToken(name.to_string()))
        };
        let bos_id = lookup(&specials.bos)?;
        let eos_id = lookup(&specials.eos)?;
        Ok(Self {
            inner,
            bos_id,
            eos_id,
            space_sensitive,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn encode(&self, text: &str) -> SftResult<tokenizers::Encoding> {
        self.inner
            .encode(text, false)
            .map_err(|e| SftError::Tokenizer(format!("encode: {e}")))
    }
}

impl TokenizerAdapter for HfTokenizer {
    fn text_to_ids(&self, text: &str) -> SftResult<Vec<u32>> {
        Ok(self.encode(text)?.get_ids().to_vec())
    }

    fn ids_to_text(&self, ids: &[u32]) -> SftResult<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| SftError::Tokenizer(format!("decode: {e}")))
    }

    fn text_to_tokens(&self, text: &str) -> SftResult<Vec<String>> {
        Ok(self.encode(text)?.get_tokens().to_vec())
    }

    fn tokens_to_text(&self, tokens: &[String]) -> SftResult<String> {
        let ids = tokens
            .iter()
            .map(|t| {
                self.inner
                    .token_to_id(t)
                    .ok_or_else(|| SftError::Tokenizer(format!("unknown token {t:?}")))
            })
            .collect::<SftResult<Vec<u32>>>()?;
        self.ids_to_text(&ids)
    }

    fn ids_to_tokens(&self, ids: &[u32]) -> SftResult<Vec<String>> {
        ids.iter()
            .map(|&id| {
                self.inner
                    .id_to_token(id)
                    .ok_or_else(|| SftError::Tokenizer(format!("unknown token id {id}")))
            })
            .collect()
    }

    fn bos_id(&self) -> u32 {
        self.bos_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }

    fn space_sensitive(&self) -> bool {
        self.space_sensitive
    }

    fn encode_span(&self, text: &str) -> SftResult<(Vec<u32>, Vec<String>)> {
        let enc = self.encode(text)?;
        Ok((enc.get_ids().to_vec(), enc.get_tokens().to_vec()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const WORD_LEVEL_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4},
            "unk_token": "[UNK]"
        }
    }"#;

    fn word_level() -> HfTokenizer {
        let inner = tokenizers::Tokenizer::from_str(WORD_LEVEL_JSON).unwrap();
        let specials = SpecialTokenNames {
            bos: "<s>".into(),
            eos: "</s>".into(),
        };
        HfTokenizer::from_tokenizer(inner, &specials, false).unwrap()
    }

    #[test]
    fn hf_special_ids_resolved() {
        let tok = word_level();
        assert_eq!(tok.bos_id(), 1);
        assert_eq!(tok.eos_id(), 2);
        assert!(!tok.space_sensitive());
    }

    #[test]
    fn hf_encode_span_aligns_ids_and_tokens() {
        let tok = word_level();
        let (ids, tokens) = tok.encode_span("hello world").unwrap();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(tokens, vec!["hello", "world"]);
        assert_eq!(tok.tokens_to_text(&tokens).unwrap(), "hello world");
    }

    #[test]
    fn hf_missing_special_token_is_config_error() {
        let inner = tokenizers::Tokenizer::from_str(WORD_LEVEL_JSON).unwrap();
        let err = HfTokenizer::from_tokenizer(inner, &SpecialTokenNames::default(), false)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingSpecialToken(_)));
    }

    #[test]
    fn token_id_values_bypass_encoding() {
        let tok = word_level();
        let (ids, tokens) = tok.encode_value(&FieldValue::TokenIds(vec![4, 3])).unwrap();
        assert_eq!(ids, vec![4, 3]);
        assert_eq!(tokens, vec!["world", "hello"]);
    }
}
