//! Length budgeting and context truncation.
//!
//! The budget counts every id the assembler will emit. When it exceeds
//! `max_seq_length`, the deficit is split across the truncatable context
//! fields and each field loses its share from the left, the right, or a
//! random interior block. Literals and the label are never cut.

use rand::Rng;
use sft_common::{SftDatasetConfig, SftError, SftResult, TokenizerAdapter, TruncationMethod};

use crate::template::{SegmentKey, TemplateSegment};

// ── Token spans ─────────────────────────────────────────────────────────────

/// Ids and token strings of one template segment. Truncation keeps the two
/// lists in lockstep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSpan {
    pub key: SegmentKey,
    pub ids: Vec<u32>,
    pub tokens: Vec<String>,
}

impl TokenSpan {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Remove `amount` tokens. Caller guarantees `amount <= self.len()`.
    fn cut<R: Rng + ?Sized>(&mut self, amount: usize, method: TruncationMethod, rng: &mut R) {
        if amount == 0 {
            return;
        }
        let len = self.ids.len();
        let aligned = self.tokens.len() == len;
        let range = match method {
            TruncationMethod::Left => 0..amount,
            TruncationMethod::Right => len - amount..len,
            TruncationMethod::Random => {
                let start = rng.gen_range(0..=len - amount);
                start..start + amount
            }
        };
        self.ids.drain(range.clone());
        if aligned {
            self.tokens.drain(range);
        }
    }
}

/// Tokenize split segments, one span per segment.
pub fn tokenize_segments<T: TokenizerAdapter + ?Sized>(
    tokenizer: &T,
    segments: &[TemplateSegment],
) -> SftResult<Vec<TokenSpan>> {
    segments
        .iter()
        .map(|seg| {
            let (ids, tokens) = tokenizer.encode_value(&seg.value)?;
            Ok(TokenSpan {
                key: seg.key.clone(),
                ids,
                tokens,
            })
        })
        .collect()
}

/// Concatenated ids of all spans, in order.
pub fn concat_ids(spans: &[TokenSpan]) -> Vec<u32> {
    spans.iter().flat_map(|s| s.ids.iter().copied()).collect()
}

// ── Budget ──────────────────────────────────────────────────────────────────

/// Everything besides the context that counts against `max_seq_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationBudget {
    pub max_seq_length: usize,
    pub virtual_tokens: usize,
    pub tokens_to_generate: usize,
    pub add_bos: bool,
    pub add_sep: bool,
    pub appends_eos: bool,
}

impl TruncationBudget {
    pub fn from_config(cfg: &SftDatasetConfig) -> Self {
        Self {
            max_seq_length: cfg.max_seq_length,
            virtual_tokens: cfg.virtual_tokens,
            tokens_to_generate: cfg.tokens_to_generate,
            add_bos: cfg.add_bos,
            add_sep: cfg.add_sep,
            appends_eos: cfg.appends_eos(),
        }
    }

    /// Length of the full sequence for the given context and label lengths.
    /// A fixed generation length reserves room even when the label is shorter.
    pub fn total_ids(&self, context_len: usize, label_len: usize) -> usize {
        self.virtual_tokens
            + context_len
            + label_len.max(self.tokens_to_generate)
            + usize::from(self.add_bos)
            + usize::from(self.add_sep)
            + usize::from(self.appends_eos)
    }

    /// Tokens over budget, zero if it fits.
    pub fn deficit(&self, context_len: usize, label_len: usize) -> usize {
        self.total_ids(context_len, label_len)
            .saturating_sub(self.max_seq_length)
    }
}

/// Split `deficit` across `n` fields. Shares differ by at most one; the
/// remainder goes to the later fields.
pub fn split_deficit(deficit: usize, n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let base = deficit / n;
    let rem = deficit % n;
    (0..n)
        .map(|j| if j >= n - rem { base + 1 } else { base })
        .collect()
}

// ── Plan ────────────────────────────────────────────────────────────────────

/// A single field's share of the deficit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCut {
    pub span_index: usize,
    pub field: String,
    pub remove: usize,
}

/// Per-field removal amounts, in template order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruncationPlan {
    cuts: Vec<PlannedCut>,
}

impl TruncationPlan {
    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    pub fn cuts(&self) -> &[PlannedCut] {
        &self.cuts
    }

    pub fn total(&self) -> usize {
        self.cuts.iter().map(|c| c.remove).sum()
    }

    /// Amount removed from `field`, if it was cut.
    pub fn get(&self, field: &str) -> Option<usize> {
        self.cuts.iter().find(|c| c.field == field).map(|c| c.remove)
    }
}

/// Decides and applies context truncation for one dataset config.
#[derive(Debug, Clone)]
pub struct Truncator {
    budget: TruncationBudget,
    fields: Vec<String>,
    method: TruncationMethod,
}

impl Truncator {
    pub fn new(cfg: &SftDatasetConfig) -> Self {
        Self {
            budget: TruncationBudget::from_config(cfg),
            fields: cfg.truncation_fields.clone(),
            method: cfg.truncation_method,
        }
    }

    pub fn budget(&self) -> &TruncationBudget {
        &self.budget
    }

    /// Work out how much each truncatable span must lose.
    ///
    /// `spans` are the context spans (everything before the label).
    pub fn plan(&self, spans: &[TokenSpan], label_len: usize) -> SftResult<TruncationPlan> {
        let context_len: usize = spans.iter().map(TokenSpan::len).sum();
        let deficit = self.budget.deficit(context_len, label_len);
        if deficit == 0 {
            return Ok(TruncationPlan::default());
        }

        let candidates: Vec<(usize, &str)> = spans
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.key
                    .context_field()
                    .filter(|k| self.fields.iter().any(|f| f.as_str() == *k))
                    .map(|k| (i, k))
            })
            .collect();
        if candidates.is_empty() {
            return Err(SftError::NoTruncatableField { deficit });
        }

        let shares = split_deficit(deficit, candidates.len());
        let mut cuts = Vec::with_capacity(candidates.len());
        for ((span_index, field), remove) in candidates.into_iter().zip(shares) {
            let available = spans[span_index].len();
            if available < remove {
                return Err(SftError::FieldTruncation {
                    field: field.to_string(),
                    available,
                    requested: remove,
                });
            }
            cuts.push(PlannedCut {
                span_index,
                field: field.to_string(),
                remove,
            });
        }

        tracing::debug!(
            deficit,
            fields = cuts.len(),
            method = %self.method,
            "Truncating context to fit max_seq_length"
        );
        Ok(TruncationPlan { cuts })
    }

    /// Plan and cut in place. On error `spans` is untouched.
    pub fn truncate<R: Rng + ?Sized>(
        &self,
        spans: &mut [TokenSpan],
        label_len: usize,
        rng: &mut R,
    ) -> SftResult<TruncationPlan> {
        let plan = self.plan(spans, label_len)?;
        for cut in &plan.cuts {
            spans[cut.span_index].cut(cut.remove, self.method, rng);
        }
        Ok(plan)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
