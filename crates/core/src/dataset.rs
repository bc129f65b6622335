//! The SFT dataset: record source + tokenizer + config, one example per index.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sft_common::{
    JsonlMemMapDataset, Record, RecordSource, SamplesMapping, SftDatasetConfig, SftError,
    SftResult, TokenizerAdapter, ValidatedConfig,
};

use crate::assembler::{metadata_of, AssembledExample, ExampleAssembler};
use crate::collator::{BatchCollator, CollatedBatch};
use crate::template::{FieldSet, PromptTemplate};
use crate::truncation::{concat_ids, tokenize_segments, Truncator};

/// Mixes the sample index into the dataset seed.
const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

pub struct SftDataset<S, T> {
    config: ValidatedConfig,
    template: PromptTemplate,
    records: S,
    tokenizer: T,
    samples: Option<SamplesMapping>,
    truncator: Truncator,
    assembler: ExampleAssembler,
    collator: BatchCollator,
}

impl<T: TokenizerAdapter> SftDataset<JsonlMemMapDataset, T> {
    /// Open a JSONL file, caching its line index in `index_mapping_dir`.
    pub fn open(path: &Path, config: SftDatasetConfig, tokenizer: T) -> SftResult<Self> {
        let records = JsonlMemMapDataset::open(path, config.index_mapping_dir.as_deref())?;
        Self::new(config, records, tokenizer)
    }
}

impl<S: RecordSource, T: TokenizerAdapter> SftDataset<S, T> {
    pub fn new(config: SftDatasetConfig, records: S, tokenizer: T) -> SftResult<Self> {
        let config = config.validate()?;
        let template =
            PromptTemplate::parse(&config.prompt_template, &config.context_keys, &config.label_key)?;
        let samples = config
            .max_num_samples
            .map(|n| SamplesMapping::build(records.len(), n, config.seed));
        if let Some(mapping) = &samples {
            tracing::info!(
                records = records.len(),
                samples = mapping.len(),
                seed = config.seed,
                "Built samples mapping"
            );
        }

        Ok(Self {
            truncator: Truncator::new(&config),
            assembler: ExampleAssembler::new(&config, tokenizer.bos_id(), tokenizer.eos_id()),
            collator: BatchCollator::new(&config, tokenizer.eos_id()),
            config,
            template,
            records,
            tokenizer,
            samples,
        })
    }

    pub fn len(&self) -> usize {
        match &self.samples {
            Some(mapping) => mapping.len(),
            None => self.records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &SftDatasetConfig {
        &self.config
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn records(&self) -> &S {
        &self.records
    }

    /// Record behind sample `idx`.
    pub fn record_index(&self, idx: usize) -> SftResult<usize> {
        let out_of_range = || SftError::RecordAccess {
            index: idx,
            reason: format!("sample index out of range (len {})", self.len()),
        };
        match &self.samples {
            Some(mapping) => mapping.record_index(idx).ok_or_else(out_of_range),
            None if idx < self.records.len() => Ok(idx),
            None => Err(out_of_range()),
        }
    }

    /// Load and process sample `idx`. Random truncation is seeded per sample,
    /// so repeated calls return the same example.
    pub fn get(&self, idx: usize) -> SftResult<AssembledExample> {
        let record = self
            .record_index(idx)
            .and_then(|i| self.records.get(i))
            .map_err(|e| {
                tracing::error!(index = idx, error = %e, "Error while loading example");
                e
            })?;
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ (idx as u64).wrapping_mul(SEED_MIX));
        self.process_record(&record, &mut rng)
    }

    /// Like [`get`](Self::get), but negative indices count from the end.
    pub fn get_wrapped(&self, idx: i64) -> SftResult<AssembledExample> {
        if idx >= 0 {
            return self.get(idx as usize);
        }
        let len = self.len();
        match usize::try_from(len as i64 + idx) {
            Ok(resolved) => self.get(resolved),
            Err(_) => {
                let err = SftError::RecordAccess {
                    index: len,
                    reason: format!("sample index {idx} out of range (len {len})"),
                };
                tracing::error!(index = idx, error = %err, "Error while loading example");
                Err(err)
            }
        }
    }

    /// Split, tokenize, truncate and assemble one record.
    pub fn process_record<R: Rng + ?Sized>(
        &self,
        record: &Record,
        rng: &mut R,
    ) -> SftResult<AssembledExample> {
        let cfg = &self.config;
        let fields = FieldSet::from_record(record, &cfg.context_keys, &cfg.label_key)?;
        let segments = self.template.split(&fields, self.tokenizer.space_sensitive())?;
        let mut spans = tokenize_segments(&self.tokenizer, &segments)?;

        // The splitter always ends with the label.
        let label = spans
            .pop()
            .ok_or_else(|| SftError::MissingField(cfg.label_key.clone()))?;
        self.truncator.truncate(&mut spans, label.len(), rng)?;

        let metadata = metadata_of(record, &cfg.context_keys, &cfg.label_key);
        Ok(self.assembler.assemble(concat_ids(&spans), label.ids, metadata))
    }

    pub fn collate(&self, examples: &[AssembledExample]) -> SftResult<CollatedBatch> {
        self.collator.collate(examples)
    }

    /// Whether `example` is long enough to keep. Filtering is the caller's call.
    pub fn meets_min_length(&self, example: &AssembledExample) -> bool {
        example.len() >= self.config.min_seq_length
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sft_common::testing::{SpacePrefixTokenizer, TEST_BOS_ID, TEST_EOS_ID};
    use sft_common::{InMemoryRecords, TruncationMethod};
    use std::io::Write;

    fn qa_config() -> SftDatasetConfig {
        SftDatasetConfig {
            max_seq_length: 64,
            add_bos: true,
            add_eos: true,
            context_keys: vec!["context".into(), "question".into()],
            label_key: "answer".into(),
            prompt_template: "Context: {context} Question: {question} Answer: {answer}".into(),
            truncation_fields: vec!["context".into()],
            ..Default::default()
        }
    }

    fn paris() -> serde_json::Value {
        json!({
            "context": "Paris is the capital.",
            "question": "What is the capital?",
            "answer": "Paris",
            "id": 1
        })
    }

    fn dataset(
        config: SftDatasetConfig,
        values: Vec<serde_json::Value>,
    ) -> SftDataset<InMemoryRecords, SpacePrefixTokenizer> {
        let records = InMemoryRecords::from_values(values).unwrap();
        SftDataset::new(config, records, SpacePrefixTokenizer::new(true)).unwrap()
    }

    #[test]
    fn paris_end_to_end() {
        let ds = dataset(qa_config(), vec![paris()]);
        let ex = ds.get(0).unwrap();

        // BOS + 11 context pieces + " Paris" + EOS
        assert_eq!(ex.input_ids.len(), 14);
        assert_eq!(ex.input_ids[0], TEST_BOS_ID);
        assert_eq!(*ex.input_ids.last().unwrap(), TEST_EOS_ID);
        assert_eq!(ex.answer_start_idx, 12);
        assert_eq!(ex.context_length, 12);
        assert_eq!(ex.answer_ids.len(), 1);
        // " Paris" in the answer is the same token as " Paris" in the context.
        assert_eq!(ex.input_ids[12], ex.input_ids[2]);

        let tok = ds.tokenizer();
        assert_eq!(
            tok.ids_to_text(&ex.context_ids[1..]).unwrap(),
            "Context: Paris is the capital. Question: What is the capital? Answer:"
        );
        assert_eq!(tok.ids_to_text(&ex.answer_ids).unwrap(), " Paris");
        assert_eq!(ex.metadata.get("id"), Some(&json!(1)));
        assert!(ex.overflow.is_none());
    }

    #[test]
    fn deficit_split_evenly_between_fields() {
        let config = SftDatasetConfig {
            max_seq_length: 10,
            add_bos: true,
            add_eos: true,
            context_keys: vec!["a".into(), "b".into()],
            label_key: "answer".into(),
            prompt_template: "{a} {b} {answer}".into(),
            truncation_fields: vec!["a".into(), "b".into()],
            truncation_method: TruncationMethod::Right,
            ..Default::default()
        };
        let ds = dataset(
            config,
            vec![json!({"a": "a1 a2 a3 a4 a5 a6", "b": "b1 b2 b3 b4 b5", "answer": "x"})],
        );
        let ex = ds.get(0).unwrap();
        assert_eq!(ex.input_ids.len(), 10);
        assert!(ex.overflow.is_none());
        assert_eq!(
            ds.tokenizer().ids_to_text(&ex.context_ids[1..]).unwrap(),
            "a1 a2 a3 a4 b1 b2 b3"
        );
    }

    #[test]
    fn random_truncation_is_reproducible_per_index() {
        let mut config = qa_config();
        config.max_seq_length = 10;
        config.truncation_method = TruncationMethod::Random;
        let long = json!({
            "context": "one two three four five six seven eight nine ten",
            "question": "q?",
            "answer": "a"
        });
        let ds = dataset(config, vec![long]);
        let first = ds.get(0).unwrap();
        assert_eq!(first.input_ids.len(), 10);
        assert_eq!(ds.get(0).unwrap(), first);
    }

    #[test]
    fn field_too_short_to_truncate() {
        let mut config = qa_config();
        config.max_seq_length = 8;
        let ds = dataset(
            config,
            vec![json!({"context": "short", "question": "a much longer question than fits", "answer": "x"})],
        );
        assert!(matches!(ds.get(0), Err(SftError::FieldTruncation { .. })));
    }

    #[test]
    fn out_of_range_and_wrapped_indices() {
        let ds = dataset(qa_config(), vec![paris(), paris()]);
        assert!(matches!(ds.get(2), Err(SftError::RecordAccess { index: 2, .. })));
        assert_eq!(ds.get_wrapped(-1).unwrap(), ds.get(1).unwrap());
    }

    #[test]
    fn negative_index_past_start_is_an_error() {
        let ds = dataset(qa_config(), vec![paris(), paris()]);
        assert_eq!(ds.get_wrapped(-2).unwrap(), ds.get(0).unwrap());
        match ds.get_wrapped(-5) {
            Err(SftError::RecordAccess { reason, .. }) => assert!(reason.contains("-5")),
            other => panic!("expected RecordAccess, got {other:?}"),
        }
        assert!(ds.get_wrapped(2).is_err());
    }

    #[test]
    fn samples_mapping_oversamples() {
        let mut config = qa_config();
        config.max_num_samples = Some(5);
        let ds = dataset(config, vec![paris(), paris()]);
        assert_eq!(ds.len(), 5);
        for i in 0..5 {
            assert!(ds.record_index(i).unwrap() < 2);
            ds.get(i).unwrap();
        }
        assert!(ds.get(5).is_err());
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        let mut config = qa_config();
        config.prompt_template = "{answer} {context} {question}".into();
        let records = InMemoryRecords::from_values(vec![paris()]).unwrap();
        let err = SftDataset::new(config, records, SpacePrefixTokenizer::new(true))
            .err()
            .unwrap();
        assert!(matches!(err, SftError::Config(_)));
    }

    #[test]
    fn collate_and_min_length() {
        let mut config = qa_config();
        config.min_seq_length = 15;
        let ds = dataset(config, vec![paris()]);
        let ex = ds.get(0).unwrap();
        assert!(!ds.meets_min_length(&ex));
        let batch = ds.collate(&[ex]).unwrap();
        assert_eq!(batch.length, 16);
        assert_eq!(batch.context_lengths, vec![12]);
        assert_eq!(batch.metadata[0].get("id"), Some(&json!(1)));
    }

    #[test]
    fn open_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{}", paris()).unwrap();
        writeln!(f, "{}", json!({"context": "c", "question": "q", "answer": "a"})).unwrap();
        drop(f);

        let mut config = qa_config();
        config.index_mapping_dir = Some(dir.path().join("idx"));
        let ds = SftDataset::open(&path, config, SpacePrefixTokenizer::new(true)).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(0).unwrap().input_ids.len(), 14);
        assert!(dir.path().join("idx").join("train.jsonl.idx").exists());
    }
}
