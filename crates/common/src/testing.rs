//! Deterministic tokenizer for tests and examples.
//!
//! Splits text GPT-2 style: every run of whitespace sticks to the word that
//! follows it, so `" Paris"` and `"Paris"` are different tokens. Pieces are
//! interned on first sight; ids 0 and 1 are reserved for BOS and EOS.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{SftError, SftResult};
use crate::tokenizer::TokenizerAdapter;

pub const TEST_BOS_ID: u32 = 0;
pub const TEST_EOS_ID: u32 = 1;

#[derive(Default)]
struct Interner {
    by_piece: HashMap<String, u32>,
    pieces: Vec<String>,
}

pub struct SpacePrefixTokenizer {
    interner: RwLock<Interner>,
    space_sensitive: bool,
}

impl SpacePrefixTokenizer {
    pub fn new(space_sensitive: bool) -> Self {
        let mut interner = Interner::default();
        for special in ["<s>", "</s>"] {
            interner.by_piece.insert(special.to_string(), interner.pieces.len() as u32);
            interner.pieces.push(special.to_string());
        }
        Self {
            interner: RwLock::new(interner),
            space_sensitive,
        }
    }

    /// Split into whitespace-prefixed pieces.
    pub fn pieces(text: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut prev_ws = true;
        for c in text.chars() {
            if c.is_whitespace() && !prev_ws && !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            current.push(c);
            prev_ws = c.is_whitespace();
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }

    fn intern(&self, piece: &str) -> u32 {
        if let Some(&id) = self.read().by_piece.get(piece) {
            return id;
        }
        let mut guard = self
            .interner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(&id) = guard.by_piece.get(piece) {
            return id;
        }
        let id = guard.pieces.len() as u32;
        guard.by_piece.insert(piece.to_string(), id);
        guard.pieces.push(piece.to_string());
        id
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Interner> {
        self.interner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TokenizerAdapter for SpacePrefixTokenizer {
    fn text_to_ids(&self, text: &str) -> SftResult<Vec<u32>> {
        Ok(Self::pieces(text).iter().map(|p| self.intern(p)).collect())
    }

    fn ids_to_text(&self, ids: &[u32]) -> SftResult<String> {
        Ok(self.ids_to_tokens(ids)?.concat())
    }

    fn text_to_tokens(&self, text: &str) -> SftResult<Vec<String>> {
        Ok(Self::pieces(text))
    }

    fn tokens_to_text(&self, tokens: &[String]) -> SftResult<String> {
        Ok(tokens.concat())
    }

    fn ids_to_tokens(&self, ids: &[u32]) -> SftResult<Vec<String>> {
        let interner = self.read();
        ids.iter()
            .map(|&id| {
                interner
                    .pieces
                    .get(id as usize)
                    .cloned()
                    .ok_or_else(|| SftError::Tokenizer(format!("unknown token id {id}")))
            })
            .collect()
    }

    fn bos_id(&self) -> u32 {
        TEST_BOS_ID
    }

    fn eos_id(&self) -> u32 {
        TEST_EOS_ID
    }

    fn space_sensitive(&self) -> bool {
        self.space_sensitive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pieces_keep_leading_space() {
        assert_eq!(
            SpacePrefixTokenizer::pieces("Paris is  big"),
            vec!["Paris", " is", "  big"]
        );
        assert_eq!(SpacePrefixTokenizer::pieces(" Paris"), vec![" Paris"]);
        assert!(SpacePrefixTokenizer::pieces("").is_empty());
    }

    #[test]
    fn ids_round_trip() {
        let tok = SpacePrefixTokenizer::new(true);
        let ids = tok.text_to_ids("What is the capital?").unwrap();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|&id| id > TEST_EOS_ID));
        assert_eq!(tok.ids_to_text(&ids).unwrap(), "What is the capital?");
        assert_ne!(
            tok.text_to_ids("Paris").unwrap(),
            tok.text_to_ids(" Paris").unwrap()
        );
    }
}
