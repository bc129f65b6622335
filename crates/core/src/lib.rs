//! # sft-core: Record to Training Batch
//!
//! Turns structured records into causal-LM fine-tuning batches:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`template`] | `PromptTemplate` parse/split, `FieldSet`, `SegmentKey` |
//! | [`truncation`] | `TokenSpan`, `TruncationBudget`, `split_deficit`, `Truncator` |
//! | [`assembler`] | `ExampleAssembler`, `AssembledExample` |
//! | [`collator`] | `BatchCollator`, `CollatedBatch`, `BatchTensors`, causal mask |
//! | [`dataset`] | `SftDataset`: the pipeline behind an index |
//!
//! ## Design principles
//!
//! 1. **Position-based templates.** Placeholders are resolved by byte offset,
//!    so field text is never re-scanned for placeholders.
//! 2. **Pure per record.** Processing reads only the immutable config; the
//!    random truncation method takes its RNG from the caller.
//! 3. **Tensors last.** Collation yields plain vectors; Candle is only touched
//!    in [`CollatedBatch::to_tensors`].

pub mod assembler;
pub mod collator;
pub mod dataset;
pub mod template;
pub mod truncation;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use assembler::{metadata_of, AssembledExample, ExampleAssembler};
pub use collator::{causal_attention_mask, BatchCollator, BatchTensors, CollatedBatch};
pub use dataset::SftDataset;
pub use sft_common::FieldValue;
pub use template::{FieldSet, PromptTemplate, Segment, SegmentKey, TemplateSegment, LITERAL_KEY};
pub use truncation::{
    concat_ids, split_deficit, tokenize_segments, TokenSpan, TruncationBudget, TruncationPlan,
    Truncator,
};
