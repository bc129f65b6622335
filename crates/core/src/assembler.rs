//! Example assembly: special tokens around the truncated context and label.
//!
//! Steps run in a fixed order: virtual-token placeholders, answer boundary,
//! BOS, SEP, label, EOS, then a last-resort right clamp to `max_seq_length`.

use serde::Serialize;
use sft_common::{LengthOverflowWarning, Record, SftDatasetConfig};

/// One tokenized training example.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledExample {
    pub input_ids: Vec<u32>,
    /// Context with virtual tokens, BOS and SEP; never contains the label.
    pub context_ids: Vec<u32>,
    pub answer_ids: Vec<u32>,
    /// First position of the answer in `input_ids`.
    pub answer_start_idx: usize,
    pub context_length: usize,
    pub metadata: Record,
    #[serde(skip)]
    pub overflow: Option<LengthOverflowWarning>,
}

impl AssembledExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Record fields other than the context fields and the label.
pub fn metadata_of(record: &Record, context_keys: &[String], label_key: &str) -> Record {
    record
        .iter()
        .filter(|(k, _)| k.as_str() != label_key && !context_keys.iter().any(|c| c == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ExampleAssembler {
    max_seq_length: usize,
    virtual_tokens: usize,
    bos: Option<u32>,
    sep: Option<u32>,
    appends_eos: bool,
    eos_id: u32,
}

impl ExampleAssembler {
    pub fn new(cfg: &SftDatasetConfig, bos_id: u32, eos_id: u32) -> Self {
        Self {
            max_seq_length: cfg.max_seq_length,
            virtual_tokens: cfg.virtual_tokens,
            bos: cfg.add_bos.then_some(bos_id),
            sep: if cfg.add_sep { cfg.sep_id } else { None },
            appends_eos: cfg.appends_eos(),
            eos_id,
        }
    }

    pub fn assemble(&self, context: Vec<u32>, answer_ids: Vec<u32>, metadata: Record) -> AssembledExample {
        let mut context_ids = Vec::with_capacity(self.virtual_tokens + context.len() + 2);
        context_ids.extend(std::iter::repeat(self.eos_id).take(self.virtual_tokens));
        context_ids.extend(context);

        let mut answer_start_idx = context_ids.len();
        if let Some(bos) = self.bos {
            context_ids.insert(0, bos);
            answer_start_idx += 1;
        }
        if let Some(sep) = self.sep {
            context_ids.push(sep);
            answer_start_idx += 1;
        }

        let mut input_ids = Vec::with_capacity(context_ids.len() + answer_ids.len() + 1);
        input_ids.extend_from_slice(&context_ids);
        input_ids.extend_from_slice(&answer_ids);
        if self.appends_eos {
            input_ids.push(self.eos_id);
        }

        let overflow = (input_ids.len() > self.max_seq_length).then(|| {
            let warning = LengthOverflowWarning {
                length: input_ids.len(),
                max_seq_length: self.max_seq_length,
            };
            tracing::warn!("{warning}");
            input_ids.truncate(self.max_seq_length);
            warning
        });

        AssembledExample {
            input_ids,
            context_length: context_ids.len(),
            context_ids,
            answer_ids,
            answer_start_idx,
            metadata,
            overflow,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BOS: u32 = 100;
    const EOS: u32 = 101;
    const SEP: u32 = 102;

    fn cfg(add_bos: bool, add_sep: bool, add_eos: bool, virtual_tokens: usize) -> SftDatasetConfig {
        SftDatasetConfig {
            max_seq_length: 64,
            add_bos,
            add_sep,
            add_eos,
            sep_id: Some(SEP),
            virtual_tokens,
            ..Default::default()
        }
    }

    #[test]
    fn full_assembly_order() {
        let a = ExampleAssembler::new(&cfg(true, true, true, 2), BOS, EOS);
        let ex = a.assemble(vec![5, 6, 7], vec![8, 9], Record::new());
        assert_eq!(ex.context_ids, vec![BOS, EOS, EOS, 5, 6, 7, SEP]);
        assert_eq!(ex.input_ids, vec![BOS, EOS, EOS, 5, 6, 7, SEP, 8, 9, EOS]);
        assert_eq!(ex.answer_start_idx, 7);
        assert_eq!(ex.context_length, 7);
        assert_eq!(ex.input_ids[ex.answer_start_idx], 8);
        assert!(ex.overflow.is_none());
    }

    #[test]
    fn answer_start_for_every_flag_combination() {
        for mask in 0..16u32 {
            let (bos, sep, eos) = (mask & 1 != 0, mask & 2 != 0, mask & 4 != 0);
            let virt = if mask & 8 != 0 { 3 } else { 0 };
            let a = ExampleAssembler::new(&cfg(bos, sep, eos, virt), BOS, EOS);
            let ex = a.assemble(vec![1, 2, 3, 4], vec![9], Record::new());
            assert_eq!(
                ex.answer_start_idx,
                virt + 4 + usize::from(bos) + usize::from(sep),
                "flags {mask:04b}"
            );
            assert_eq!(ex.context_length, ex.context_ids.len());
            assert_eq!(ex.input_ids[ex.answer_start_idx], 9);
        }
    }

    #[test]
    fn fixed_generation_length_suppresses_eos() {
        let mut c = cfg(false, false, true, 0);
        c.tokens_to_generate = 4;
        let ex = ExampleAssembler::new(&c, BOS, EOS).assemble(vec![1], vec![2], Record::new());
        assert_eq!(ex.input_ids, vec![1, 2]);
    }

    #[test]
    fn overflow_clamps_from_the_right() {
        let mut c = cfg(true, false, true, 0);
        c.max_seq_length = 4;
        let ex = ExampleAssembler::new(&c, BOS, EOS).assemble(vec![1, 2], vec![3, 4], Record::new());
        assert_eq!(ex.input_ids, vec![BOS, 1, 2, 3]);
        assert_eq!(
            ex.overflow,
            Some(LengthOverflowWarning {
                length: 6,
                max_seq_length: 4
            })
        );
        assert_eq!(ex.answer_ids, vec![3, 4]);
    }

    #[test]
    fn metadata_excludes_context_and_label() {
        let record = json!({"context": "c", "question": "q", "answer": "a", "id": 7, "source": "wiki"});
        let meta = metadata_of(
            record.as_object().unwrap(),
            &["context".to_string(), "question".to_string()],
            "answer",
        );
        assert_eq!(meta.len(), 2);
        assert_eq!(meta["id"], json!(7));
        assert_eq!(meta["source"], json!("wiki"));
    }
}
