//! Prompt templates: parse once, split every record around the placeholders.
//!
//! A template such as `Context: {context} Question: {question} Answer: {answer}`
//! is cut at placeholder boundaries into buckets. Buckets are resolved by
//! position, never by string replacement, so a field value that happens to
//! contain `{question}` is left alone.

use std::collections::HashMap;
use std::fmt;

use sft_common::{field_value, ConfigError, FieldValue, Record, SftError, SftResult};

/// Key reported for template text that is not a field.
pub const LITERAL_KEY: &str = "<literal>";

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Where a split segment's text came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SegmentKey {
    Literal,
    Context(String),
    Label(String),
}

impl SegmentKey {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal => LITERAL_KEY,
            Self::Context(k) | Self::Label(k) => k,
        }
    }

    /// Name of the context field, if this segment is one.
    pub fn context_field(&self) -> Option<&str> {
        match self {
            Self::Context(k) => Some(k),
            _ => None,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filled template segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSegment {
    pub key: SegmentKey,
    pub value: FieldValue,
}

/// Field values of one record: every context field plus the label.
#[derive(Debug, Clone, Default)]
pub struct FieldSet {
    values: HashMap<String, FieldValue>,
}

impl FieldSet {
    /// Read the named fields. Context text is stripped of ASCII spaces; the
    /// label is taken as-is.
    pub fn from_record(record: &Record, context_keys: &[String], label_key: &str) -> SftResult<Self> {
        let mut values = HashMap::with_capacity(context_keys.len() + 1);
        for key in context_keys {
            let value = match field_value(record, key)? {
                FieldValue::RawText(s) => FieldValue::RawText(s.trim_matches(' ').to_string()),
                ids => ids,
            };
            values.insert(key.clone(), value);
        }
        values.insert(label_key.to_string(), field_value(record, label_key)?);
        Ok(Self { values })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> SftResult<&FieldValue> {
        self.values
            .get(key)
            .ok_or_else(|| SftError::MissingField(key.to_string()))
    }
}

/// Byte range of the template plus what fills it.
#[derive(Debug, Clone)]
struct Bucket {
    start: usize,
    end: usize,
    key: SegmentKey,
}

/// A validated prompt template.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
    buckets: Vec<Bucket>,
    label_key: String,
    label_start: usize,
}

fn placeholder(key: &str) -> String {
    format!("{{{key}}}")
}

/// Start offset of the only occurrence of `ph` in `template`.
fn find_unique(template: &str, ph: &str) -> Result<usize, ConfigError> {
    let mut hits = template.match_indices(ph).map(|(i, _)| i);
    let first = hits.next().ok_or_else(|| ConfigError::MissingPlaceholder {
        placeholder: ph.to_string(),
        template: template.to_string(),
    })?;
    if hits.next().is_some() {
        return Err(ConfigError::DuplicatePlaceholder {
            placeholder: ph.to_string(),
        });
    }
    Ok(first)
}

impl PromptTemplate {
    /// Check placeholders and precompute the bucket layout.
    pub fn parse(
        template: &str,
        context_keys: &[String],
        label_key: &str,
    ) -> Result<Self, ConfigError> {
        let label_ph = placeholder(label_key);
        let label_start = find_unique(template, &label_ph)?;
        if label_start + label_ph.len() != template.len() {
            return Err(ConfigError::LabelNotLast {
                placeholder: label_ph,
            });
        }

        let mut ranges: Vec<(usize, usize, &str)> = Vec::with_capacity(context_keys.len());
        for key in context_keys {
            let ph = placeholder(key);
            let start = find_unique(template, &ph)?;
            ranges.push((start, start + ph.len(), key.as_str()));
        }

        let mut positions: Vec<usize> = Vec::with_capacity(ranges.len() * 2 + 2);
        positions.push(0);
        positions.extend(ranges.iter().flat_map(|&(s, e, _)| [s, e]));
        positions.push(label_start);
        positions.sort_unstable();

        let buckets = positions
            .windows(2)
            .map(|w| {
                let (start, end) = (w[0], w[1]);
                let key = ranges
                    .iter()
                    .find(|&&(s, e, _)| s == start && e == end)
                    .map(|&(_, _, k)| SegmentKey::Context(k.to_string()))
                    .unwrap_or(SegmentKey::Literal);
                Bucket { start, end, key }
            })
            .collect();

        Ok(Self {
            template: template.to_string(),
            buckets,
            label_key: label_key.to_string(),
            label_start,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn label_key(&self) -> &str {
        &self.label_key
    }

    /// Template structure: non-empty literals and placeholders, label last.
    pub fn segments(&self) -> Vec<Segment> {
        let mut out: Vec<Segment> = self
            .buckets
            .iter()
            .filter_map(|b| match &b.key {
                SegmentKey::Context(k) => Some(Segment::Placeholder(k.clone())),
                _ if b.start < b.end => {
                    Some(Segment::Literal(self.template[b.start..b.end].to_string()))
                }
                _ => None,
            })
            .collect();
        out.push(Segment::Placeholder(self.label_key.clone()));
        out
    }

    fn byte_is_space(&self, i: usize) -> bool {
        self.template.as_bytes().get(i) == Some(&b' ')
    }

    /// Fill the template with `fields`, in template order, ending with the label.
    ///
    /// Text is stripped of ASCII spaces per bucket. For space-sensitive
    /// tokenizers a single leading space is restored on every bucket but the
    /// first when the template has a space right before or at the bucket start.
    pub fn split(&self, fields: &FieldSet, space_sensitive: bool) -> SftResult<Vec<TemplateSegment>> {
        let mut out = Vec::with_capacity(self.buckets.len() + 1);

        for (i, bucket) in self.buckets.iter().enumerate() {
            let leading_space = i != 0
                && space_sensitive
                && ((bucket.start > 0 && self.byte_is_space(bucket.start - 1))
                    || self.byte_is_space(bucket.start));

            let value = match &bucket.key {
                SegmentKey::Context(k) => fields.get(k)?.clone(),
                _ => FieldValue::RawText(self.template[bucket.start..bucket.end].to_string()),
            };
            let value = match value {
                FieldValue::RawText(text) => {
                    let text = text.trim_matches(' ');
                    if text.is_empty() {
                        continue;
                    }
                    FieldValue::RawText(if leading_space {
                        format!(" {text}")
                    } else {
                        text.to_string()
                    })
                }
                FieldValue::TokenIds(ids) if ids.is_empty() => continue,
                ids => ids,
            };
            out.push(TemplateSegment {
                key: bucket.key.clone(),
                value,
            });
        }

        let label_space =
            space_sensitive && self.label_start > 0 && self.byte_is_space(self.label_start - 1);
        let label = match fields.get(&self.label_key)? {
            FieldValue::RawText(text) if label_space => FieldValue::RawText(format!(" {text}")),
            other => other.clone(),
        };
        out.push(TemplateSegment {
            key: SegmentKey::Label(self.label_key.clone()),
            value: label,
        });
        Ok(out)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
