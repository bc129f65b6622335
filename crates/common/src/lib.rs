//! # sft-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`SftDatasetConfig`]**: dataset knobs (serialised as JSON), validated
//!   into a [`ValidatedConfig`].
//! * **[`ConfigError`]** / **[`SftError`]**: error taxonomy.
//! * **[`TokenizerAdapter`]** / **[`HfTokenizer`]**: tokenizer contract.
//! * **[`RecordSource`]** / **[`JsonlMemMapDataset`]**: record access.
//! * **[`SamplesMapping`]**: seeded epoch oversampling.

pub mod config;
pub mod data;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tokenizer;

pub use config::{unescape_template, SftDatasetConfig, TruncationMethod, ValidatedConfig};
pub use data::{field_value, InMemoryRecords, JsonlMemMapDataset, Record, RecordSource, SamplesMapping};
pub use error::{ConfigError, LengthOverflowWarning, SftError, SftResult};
pub use tokenizer::{FieldValue, HfTokenizer, SpecialTokenNames, TokenizerAdapter};
