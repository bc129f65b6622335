//! sftpack: build supervised fine-tuning batches from prompt templates.
//!
//! Re-exports the workspace crates so downstream users depend on one package:
//! [`sft_common`] holds config, errors, tokenizer and record sources;
//! [`sft_core`] holds the template, truncation, assembly and collation pipeline.

pub use sft_common;
pub use sft_core;

pub use sft_common::{
    HfTokenizer, InMemoryRecords, JsonlMemMapDataset, RecordSource, SftDatasetConfig, SftError,
    SftResult, TokenizerAdapter, TruncationMethod,
};
pub use sft_core::{AssembledExample, BatchCollator, CollatedBatch, PromptTemplate, SftDataset};
