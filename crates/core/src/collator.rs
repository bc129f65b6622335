//! Batch collation: shift, pad and mask a batch of assembled examples.
//!
//! [`BatchCollator::collate`] produces plain vectors ([`CollatedBatch`]) so the
//! batch can be inspected or serialised; [`CollatedBatch::to_tensors`] turns
//! it into Candle tensors on any device.

use candle_core::{DType, Device, Result, Tensor};
use serde::Serialize;
use sft_common::{Record, SftDatasetConfig, SftError, SftResult};

use crate::assembler::AssembledExample;

/// Padding granularity when not padding to `max_seq_length`.
pub const PAD_MULTIPLE: usize = 8;

fn ceil_to_multiple(n: usize, m: usize) -> usize {
    n.div_ceil(m) * m
}

/// Right-pad `seq` with `pad` to exactly `len`, clipping longer input.
fn pad_to<T: Copy>(seq: &[T], len: usize, pad: T) -> Vec<T> {
    if seq.len() > len {
        tracing::warn!(len = seq.len(), max_length = len, "Clipping sequence to batch length");
        return seq[..len].to_vec();
    }
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(seq);
    out.resize(len, pad);
    out
}

#[derive(Debug, Clone)]
pub struct BatchCollator {
    max_seq_length: usize,
    tokens_to_generate: usize,
    pad_to_max_length: bool,
    answer_only_loss: bool,
    pad_id: u32,
}

impl BatchCollator {
    /// `pad_id` is the tokenizer's EOS id.
    pub fn new(cfg: &SftDatasetConfig, pad_id: u32) -> Self {
        Self {
            max_seq_length: cfg.max_seq_length,
            tokens_to_generate: cfg.tokens_to_generate,
            pad_to_max_length: cfg.pad_to_max_length,
            answer_only_loss: cfg.answer_only_loss,
            pad_id,
        }
    }

    /// Loss mask over `input_ids`, before the next-token shift.
    pub fn loss_mask(&self, example: &AssembledExample) -> Vec<f32> {
        (0..example.input_ids.len())
            .map(|i| {
                if !self.answer_only_loss || i >= example.answer_start_idx {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Common padded length for a batch.
    pub fn batch_length(&self, examples: &[AssembledExample]) -> SftResult<usize> {
        if examples.is_empty() {
            return Err(SftError::Collate("empty batch".to_string()));
        }
        let longest_input = examples
            .iter()
            .map(|e| e.input_ids.len().saturating_sub(1))
            .max()
            .unwrap_or(0);
        let longest_context = examples
            .iter()
            .map(|e| e.context_ids.len())
            .max()
            .unwrap_or(0);
        let needed = longest_input.max(longest_context + self.tokens_to_generate);

        let length = if self.pad_to_max_length {
            self.max_seq_length
        } else {
            self.max_seq_length.min(ceil_to_multiple(needed, PAD_MULTIPLE))
        };
        if length > self.max_seq_length {
            return Err(SftError::Collate(format!(
                "batch length {length} exceeds max_seq_length {}",
                self.max_seq_length
            )));
        }
        Ok(length)
    }

    pub fn collate(&self, examples: &[AssembledExample]) -> SftResult<CollatedBatch> {
        let length = self.batch_length(examples)?;
        let n = examples.len();

        let mut batch = CollatedBatch {
            length,
            tokens: Vec::with_capacity(n),
            labels: Vec::with_capacity(n),
            loss_mask: Vec::with_capacity(n),
            contexts: Vec::with_capacity(n),
            context_lengths: Vec::with_capacity(n),
            answers: Vec::with_capacity(n),
            metadata: Vec::with_capacity(n),
        };
        for ex in examples {
            let ids = &ex.input_ids;
            let (inputs, labels) = if ids.is_empty() {
                (&ids[..], &ids[..])
            } else {
                (&ids[..ids.len() - 1], &ids[1..])
            };
            let mask = self.loss_mask(ex);
            let shifted_mask = mask.get(1..).unwrap_or(&[]);

            batch.tokens.push(pad_to(inputs, length, self.pad_id));
            batch.labels.push(pad_to(labels, length, self.pad_id));
            batch.loss_mask.push(pad_to(shifted_mask, length, 0.0));
            batch.contexts.push(pad_to(&ex.context_ids, length, self.pad_id));
            batch.context_lengths.push(ex.context_length as u32);
            batch.answers.push(pad_to(&ex.answer_ids, length, self.pad_id));
            batch.metadata.push(ex.metadata.clone());
        }
        Ok(batch)
    }
}

/// A padded batch as plain vectors, all rows of length `length`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollatedBatch {
    pub length: usize,
    pub tokens: Vec<Vec<u32>>,
    pub labels: Vec<Vec<u32>>,
    pub loss_mask: Vec<Vec<f32>>,
    pub contexts: Vec<Vec<u32>>,
    pub context_lengths: Vec<u32>,
    pub answers: Vec<Vec<u32>>,
    pub metadata: Vec<Record>,
}

/// Batch tensors. `attention_mask` is `(B, 1, L, L)` u8 with 1 where
/// attention is blocked; everything else is `(B, L)` except `context_lengths`.
#[derive(Debug, Clone)]
pub struct BatchTensors {
    pub tokens: Tensor,
    pub labels: Tensor,
    pub attention_mask: Tensor,
    pub loss_mask: Tensor,
    pub position_ids: Tensor,
    pub contexts: Tensor,
    pub context_lengths: Tensor,
    pub answers: Tensor,
}

/// Causal mask of shape `(len, len)`: 1 strictly above the diagonal.
pub fn causal_attention_mask(len: usize, device: &Device) -> Result<Tensor> {
    Tensor::tril2(len, DType::F32, device)?.lt(0.5)
}

impl CollatedBatch {
    pub fn batch_size(&self) -> usize {
        self.tokens.len()
    }

    /// Positions `0..length` for every row; padding gets no offset.
    pub fn position_ids(&self) -> Vec<Vec<u32>> {
        vec![(0..self.length as u32).collect(); self.batch_size()]
    }

    pub fn to_tensors(&self, device: &Device) -> Result<BatchTensors> {
        let (b, l) = (self.batch_size(), self.length);
        let matrix_u32 = |rows: &[Vec<u32>]| {
            Tensor::from_vec(rows.concat(), (b, l), device)
        };

        // Shared causal structure; padding is not masked per example.
        let attention_mask = causal_attention_mask(l, device)?
            .reshape((1, 1, l, l))?
            .broadcast_as((b, 1, l, l))?
            .contiguous()?;

        Ok(BatchTensors {
            tokens: matrix_u32(&self.tokens)?,
            labels: matrix_u32(&self.labels)?,
            attention_mask,
            loss_mask: Tensor::from_vec(self.loss_mask.concat(), (b, l), device)?,
            position_ids: matrix_u32(&self.position_ids())?,
            contexts: matrix_u32(&self.contexts)?,
            context_lengths: Tensor::from_vec(self.context_lengths.clone(), b, device)?,
            answers: matrix_u32(&self.answers)?,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: u32 = 2;

    fn example(input_ids: Vec<u32>, context_len: usize, answer_start_idx: usize) -> AssembledExample {
        AssembledExample {
            answer_ids: input_ids[answer_start_idx.min(input_ids.len())..].to_vec(),
            context_ids: input_ids[..context_len].to_vec(),
            context_length: context_len,
            input_ids,
            answer_start_idx,
            metadata: Record::new(),
            overflow: None,
        }
    }

    fn collator(max: usize, answer_only_loss: bool, pad_to_max_length: bool) -> BatchCollator {
        let cfg = SftDatasetConfig {
            max_seq_length: max,
            answer_only_loss,
            pad_to_max_length,
            ..Default::default()
        };
        BatchCollator::new(&cfg, EOS)
    }

    #[test]
    fn shift_pad_and_mask() {
        let c = collator(64, true, false);
        let ex = example(vec![10, 11, 12, 13, 14], 3, 3);
        let batch = c.collate(&[ex]).unwrap();
        assert_eq!(batch.length, 8);
        assert_eq!(batch.tokens[0], vec![10, 11, 12, 13, EOS, EOS, EOS, EOS]);
        assert_eq!(batch.labels[0], vec![11, 12, 13, 14, EOS, EOS, EOS, EOS]);
        assert_eq!(batch.loss_mask[0], vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(batch.contexts[0], vec![10, 11, 12, EOS, EOS, EOS, EOS, EOS]);
        assert_eq!(batch.context_lengths, vec![3]);
        assert_eq!(batch.answers[0][..2], [13, 14]);
    }

    #[test]
    fn loss_mask_ones_count() {
        let c = collator(64, true, false);
        for a in 0..6 {
            let ex = example((0..6).collect(), a.min(6), a);
            let batch = c.collate(&[ex]).unwrap();
            let ones = batch.loss_mask[0].iter().filter(|&&v| v == 1.0).count();
            assert_eq!(ones, 6 - a.max(1), "answer_start_idx {a}");
        }
    }

    #[test]
    fn full_loss_when_not_answer_only() {
        let c = collator(64, false, false);
        let batch = c.collate(&[example(vec![1, 2, 3, 4], 2, 2)]).unwrap();
        assert_eq!(batch.loss_mask[0][..3], [1.0, 1.0, 1.0]);
        assert!(batch.loss_mask[0][3..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn batch_length_rules() {
        let c = collator(20, true, false);
        let short = example((0..5).collect(), 2, 2);
        let long = example((0..12).collect(), 4, 4);
        assert_eq!(c.batch_length(&[short.clone(), long.clone()]).unwrap(), 16);

        // Rounding never exceeds the max.
        let c = collator(13, true, false);
        assert_eq!(c.batch_length(&[long.clone()]).unwrap(), 13);

        let c = collator(32, true, true);
        assert_eq!(c.batch_length(&[short]).unwrap(), 32);

        let cfg = SftDatasetConfig {
            max_seq_length: 64,
            tokens_to_generate: 20,
            ..Default::default()
        };
        let c = BatchCollator::new(&cfg, EOS);
        assert_eq!(c.batch_length(&[long]).unwrap(), 24);
    }

    #[test]
    fn empty_batch_is_an_error() {
        let c = collator(16, true, false);
        assert!(matches!(c.collate(&[]), Err(SftError::Collate(_))));
    }

    #[test]
    fn tensors_have_expected_shapes() -> Result<()> {
        let c = collator(64, true, false);
        let batch = c
            .collate(&[example(vec![1, 2, 3], 1, 1), example((0..10).collect(), 5, 5)])
            .unwrap();
        let t = batch.to_tensors(&Device::Cpu)?;
        assert_eq!(t.tokens.dims(), &[2, 16]);
        assert_eq!(t.labels.dtype(), DType::U32);
        assert_eq!(t.loss_mask.dtype(), DType::F32);
        assert_eq!(t.attention_mask.dims(), &[2, 1, 16, 16]);
        assert_eq!(t.context_lengths.to_vec1::<u32>()?, vec![1, 5]);
        assert_eq!(t.position_ids.to_vec2::<u32>()?[1][..4], [0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn causal_mask_blocks_upper_triangle() -> Result<()> {
        let mask = causal_attention_mask(3, &Device::Cpu)?;
        assert_eq!(mask.dtype(), DType::U8);
        assert_eq!(
            mask.to_vec2::<u8>()?,
            vec![vec![0, 1, 1], vec![0, 0, 1], vec![0, 0, 0]]
        );
        Ok(())
    }
}
