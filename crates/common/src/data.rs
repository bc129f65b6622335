//! Record sources: where raw JSON records come from.
//!
//! * **[`RecordSource`]**: indexable, length-known collection of records.
//! * **[`JsonlMemMapDataset`]**: zero-copy JSONL access via `memmap2`, with an
//!   on-disk line-offset index so reopening a large file does not rescan it.
//! * **[`InMemoryRecords`]**: records held in a `Vec`.
//! * **[`SamplesMapping`]**: seeded epoch shuffles for over/under-sampling.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{Map, Value};

use crate::error::{SftError, SftResult};
use crate::tokenizer::FieldValue;

/// One JSON object from the dataset.
pub type Record = Map<String, Value>;

/// Indexable collection of records.
pub trait RecordSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> SftResult<Record>;
}

// ── Field extraction ────────────────────────────────────────────────────────

/// Read `key` from a record as raw text or pre-tokenized ids.
pub fn field_value(record: &Record, key: &str) -> SftResult<FieldValue> {
    let value = record
        .get(key)
        .ok_or_else(|| SftError::MissingField(key.to_string()))?;
    let invalid = |found: &str| SftError::InvalidField {
        field: key.to_string(),
        found: found.to_string(),
    };
    match value {
        Value::String(s) => Ok(FieldValue::RawText(s.clone())),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| invalid("array with a non token id element"))
            })
            .collect::<SftResult<Vec<u32>>>()
            .map(FieldValue::TokenIds),
        Value::Null => Err(invalid("null")),
        Value::Bool(_) => Err(invalid("bool")),
        Value::Number(_) => Err(invalid("number")),
        Value::Object(_) => Err(invalid("object")),
    }
}

// ── InMemoryRecords ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct InMemoryRecords {
    records: Vec<Record>,
}

impl InMemoryRecords {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Build from JSON values; non-object values are rejected.
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> SftResult<Self> {
        let records = values
            .into_iter()
            .enumerate()
            .map(|(index, v)| match v {
                Value::Object(map) => Ok(map),
                other => Err(SftError::RecordAccess {
                    index,
                    reason: format!("expected a JSON object, got {other}"),
                }),
            })
            .collect::<SftResult<Vec<_>>>()?;
        Ok(Self { records })
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }
}

impl RecordSource for InMemoryRecords {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize) -> SftResult<Record> {
        self.records
            .get(index)
            .cloned()
            .ok_or_else(|| SftError::RecordAccess {
                index,
                reason: format!("index out of range (len {})", self.records.len()),
            })
    }
}

// ── Line-index file format ──────────────────────────────────────────────────

/// Magic bytes for the line-index cache (version 1).
const INDEX_MAGIC: &[u8; 4] = b"SIX1";
/// Header: magic (4) + source byte length (8) + number of lines (8).
const INDEX_HEADER_LEN: usize = 4 + 8 + 8;

/// Byte range `[start, end)` of one non-blank JSONL line.
pub type LineSpan = (u64, u64);

/// Scan `bytes` for non-blank lines.
pub fn scan_lines(bytes: &[u8]) -> Vec<LineSpan> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut push = |start: usize, end: usize| {
        if !bytes[start..end].iter().all(u8::is_ascii_whitespace) {
            spans.push((start as u64, end as u64));
        }
    };
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' {
            push(start, i);
            start = i + 1;
        }
    }
    if start < bytes.len() {
        push(start, bytes.len());
    }
    spans
}

/// Write a line index for a source of `source_len` bytes.
///
/// Format: magic "SIX1", source length as u64 LE, line count as u64 LE, then
/// `(start, end)` pairs as u64 LE.
pub fn write_line_index(path: &Path, source_len: u64, spans: &[LineSpan]) -> SftResult<()> {
    let mut f = BufWriter::new(File::create(path)?);
    f.write_all(INDEX_MAGIC)?;
    f.write_all(&source_len.to_le_bytes())?;
    f.write_all(&(spans.len() as u64).to_le_bytes())?;
    for &(start, end) in spans {
        f.write_all(&start.to_le_bytes())?;
        f.write_all(&end.to_le_bytes())?;
    }
    f.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

/// Read a line index. Returns `None` when the file is missing, malformed, or
/// was built for a source of a different length.
pub fn read_line_index(path: &Path, source_len: u64) -> Option<Vec<LineSpan>> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() < INDEX_HEADER_LEN || &bytes[0..4] != INDEX_MAGIC {
        return None;
    }
    let read_u64 = |at: usize| -> Option<u64> {
        bytes
            .get(at..at + 8)
            .and_then(|s| s.try_into().ok())
            .map(u64::from_le_bytes)
    };
    if read_u64(4)? != source_len {
        return None;
    }
    let count = usize::try_from(read_u64(12)?).ok()?;
    if bytes.len() != INDEX_HEADER_LEN + count.checked_mul(16)? {
        return None;
    }
    (0..count)
        .map(|i| {
            let at = INDEX_HEADER_LEN + i * 16;
            Some((read_u64(at)?, read_u64(at + 8)?))
        })
        .collect()
}

// ── JsonlMemMapDataset ──────────────────────────────────────────────────────

/// Zero-copy JSONL dataset. Each non-blank line is one record; lines are
/// parsed lazily in [`RecordSource::get`].
pub struct JsonlMemMapDataset {
    path: PathBuf,
    mmap: Mmap,
    spans: Vec<LineSpan>,
}

impl JsonlMemMapDataset {
    /// Open `path`, reusing (or creating) the index cache in `index_dir`, or
    /// next to the data file when `index_dir` is `None`.
    pub fn open(path: &Path, index_dir: Option<&Path>) -> SftResult<Self> {
        let file = File::open(path)?;
        let source_len = file.metadata()?.len();
        if source_len == 0 {
            return Err(SftError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("empty JSONL file: {}", path.display()),
            )));
        }
        // SAFETY: the file is opened read-only and is not expected to change
        // while mapped; a stale index is detected through the stored length.
        let mmap = unsafe { Mmap::map(&file)? };

        let index_path = Self::index_path(path, index_dir);
        let spans = match read_line_index(&index_path, source_len) {
            Some(spans) => {
                tracing::debug!(index = %index_path.display(), lines = spans.len(), "Reusing line index");
                spans
            }
            None => {
                let spans = scan_lines(&mmap);
                tracing::info!(
                    data = %path.display(),
                    lines = spans.len(),
                    index = %index_path.display(),
                    "Built line index"
                );
                if let Some(dir) = index_path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                write_line_index(&index_path, source_len, &spans)?;
                spans
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            spans,
        })
    }

    /// `<index_dir or data dir>/<file name>.idx`
    pub fn index_path(path: &Path, index_dir: Option<&Path>) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".idx");
        match index_dir {
            Some(dir) => dir.join(name),
            None => path.with_file_name(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw bytes of line `index`.
    pub fn line(&self, index: usize) -> Option<&[u8]> {
        let &(start, end) = self.spans.get(index)?;
        self.mmap.get(start as usize..end as usize)
    }
}

impl RecordSource for JsonlMemMapDataset {
    fn len(&self) -> usize {
        self.spans.len()
    }

    fn get(&self, index: usize) -> SftResult<Record> {
        let line = self.line(index).ok_or_else(|| SftError::RecordAccess {
            index,
            reason: format!("index out of range (len {})", self.spans.len()),
        })?;
        serde_json::from_slice::<Record>(line).map_err(|e| SftError::RecordAccess {
            index,
            reason: format!("{}: {e}", self.path.display()),
        })
    }
}

// ── SamplesMapping ──────────────────────────────────────────────────────────

/// One sample: `(record_index, epoch, position_in_epoch)`.
pub type SampleEntry = (u32, u32, u32);

/// Fixed-length list of samples drawn as consecutive seeded shuffles of all
/// record indices. Longer than the dataset means oversampling.
#[derive(Debug, Clone)]
pub struct SamplesMapping {
    entries: Vec<SampleEntry>,
}

impl SamplesMapping {
    pub fn build(num_records: usize, max_num_samples: usize, seed: u64) -> Self {
        let mut entries = Vec::with_capacity(max_num_samples);
        if num_records == 0 {
            return Self { entries };
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<u32> = (0..num_records as u32).collect();
        let mut epoch = 0u32;
        while entries.len() < max_num_samples {
            order.shuffle(&mut rng);
            let take = (max_num_samples - entries.len()).min(num_records);
            entries.extend(
                order[..take]
                    .iter()
                    .enumerate()
                    .map(|(pos, &idx)| (idx, epoch, pos as u32)),
            );
            epoch += 1;
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<SampleEntry> {
        self.entries.get(index).copied()
    }

    pub fn record_index(&self, index: usize) -> Option<usize> {
        self.get(index).map(|(idx, _, _)| idx as usize)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_jsonl(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("train.jsonl");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn scan_skips_blank_lines() {
        let spans = scan_lines(b"{\"a\":1}\n\n  \n{\"a\":2}");
        assert_eq!(spans, vec![(0, 7), (12, 19)]);
    }

    #[test]
    fn jsonl_reads_records_and_writes_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jsonl(
            dir.path(),
            "{\"input\": \"a\", \"output\": \"b\"}\n\n{\"input\": \"c\", \"output\": \"d\"}\n",
        );
        let ds = JsonlMemMapDataset::open(&path, None).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1).unwrap()["input"], json!("c"));
        assert!(JsonlMemMapDataset::index_path(&path, None).exists());

        // Second open goes through the cached index.
        let again = JsonlMemMapDataset::open(&path, None).unwrap();
        assert_eq!(again.get(0).unwrap()["output"], json!("b"));
    }

    #[test]
    fn stale_index_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let idx_dir = dir.path().join("idx");
        let path = write_jsonl(dir.path(), "{\"x\": \"1\"}\n");
        assert_eq!(JsonlMemMapDataset::open(&path, Some(&idx_dir)).unwrap().len(), 1);

        std::fs::write(&path, "{\"x\": \"1\"}\n{\"x\": \"2\"}\n").unwrap();
        let ds = JsonlMemMapDataset::open(&path, Some(&idx_dir)).unwrap();
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn malformed_line_is_record_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_jsonl(dir.path(), "{\"x\": \"1\"}\nnot json\n");
        let ds = JsonlMemMapDataset::open(&path, None).unwrap();
        assert!(matches!(
            ds.get(1),
            Err(SftError::RecordAccess { index: 1, .. })
        ));
        assert!(matches!(
            ds.get(5),
            Err(SftError::RecordAccess { index: 5, .. })
        ));
    }

    #[test]
    fn field_value_variants() {
        let record = json!({"t": "hi", "ids": [3, 4], "n": 5, "bad": [1, -2]});
        let record = record.as_object().unwrap();
        assert_eq!(field_value(record, "t").unwrap(), FieldValue::RawText("hi".into()));
        assert_eq!(field_value(record, "ids").unwrap(), FieldValue::TokenIds(vec![3, 4]));
        assert!(matches!(field_value(record, "n"), Err(SftError::InvalidField { .. })));
        assert!(matches!(field_value(record, "bad"), Err(SftError::InvalidField { .. })));
        assert!(matches!(field_value(record, "zzz"), Err(SftError::MissingField(_))));
    }

    #[test]
    fn samples_mapping_oversamples_whole_epochs() {
        let m = SamplesMapping::build(4, 10, 7);
        assert_eq!(m.len(), 10);
        let mut first_epoch: Vec<usize> = (0..4).map(|i| m.record_index(i).unwrap()).collect();
        first_epoch.sort();
        assert_eq!(first_epoch, vec![0, 1, 2, 3]);
        assert_eq!(m.get(9).unwrap().1, 2);
        assert_eq!(m.get(9).unwrap().2, 1);
    }

    #[test]
    fn samples_mapping_is_seeded() {
        let a = SamplesMapping::build(50, 50, 1);
        let b = SamplesMapping::build(50, 50, 1);
        assert_eq!(a.entries, b.entries);
        assert!(SamplesMapping::build(0, 10, 1).is_empty());
    }
}
