//! # Identifier Normalization
//!
//! Speech transcription mangles alphanumeric identifiers in predictable ways.
//! A member reading "M1001" over the phone can come back from STT as any of:
//!
//! - `"M 1 0 0 1"` (spelled out)
//! - `"m one zero zero one"` (spoken digits)
//! - `"M as in Mike one zero zero one"` (phonetic spelling)
//! - `"M1002 no sorry M1001"` (self-correction mid-utterance)
//!
//! This module collapses all of those onto the canonical uppercase,
//! separator-free token the store indexes by. Normalization is pure and
//! deterministic, so the whole equivalence class can be unit tested without
//! the rest of the pipeline.

use std::fmt;

/// Returned when no usable identifier content survives normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationError {
    /// The raw input that failed to normalize
    pub raw: String,
}

impl fmt::Display for NormalizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "No identifier content found in '{}'", self.raw)
    }
}

impl std::error::Error for NormalizationError {}

/// Spoken digit words recognized as single tokens.
const DIGIT_WORDS: [(&str, &str); 10] = [
    ("ZERO", "0"),
    ("ONE", "1"),
    ("TWO", "2"),
    ("THREE", "3"),
    ("FOUR", "4"),
    ("FIVE", "5"),
    ("SIX", "6"),
    ("SEVEN", "7"),
    ("EIGHT", "8"),
    ("NINE", "9"),
];

/// Phrases that mark a mid-utterance self-correction. Everything before the
/// last marker is discarded, keeping the longest trailing well-formed token.
const CORRECTION_MARKERS: [&str; 5] = ["NO", "SORRY", "ACTUALLY", "WAIT", "MEAN"];

/// Normalize a raw transcribed identifier to its canonical form.
///
/// ## Canonical form:
/// Uppercase, no whitespace or separators, spoken digits collapsed to
/// numerals. Normalizing an already-canonical token returns it unchanged.
///
/// ## Errors:
/// Fails with [`NormalizationError`] when no digit or letter content survives
/// (empty input, pure punctuation, filler words only).
pub fn normalize_id(raw: &str) -> Result<String, NormalizationError> {
    // Tokenize on whitespace and strip punctuation inside each token, so
    // "ORD-001", "ord 001" and "ORD001" all agree while "X-ray" stays a
    // single anchor word.
    let tokens: Vec<String> = raw
        .to_uppercase()
        .split_whitespace()
        .map(|t| t.chars().filter(|c| c.is_ascii_alphanumeric()).collect())
        .filter(|t: &String| !t.is_empty())
        .collect();

    // Keep only the utterance after the last self-correction marker.
    let start = tokens
        .iter()
        .rposition(|t| CORRECTION_MARKERS.contains(&t.as_str()))
        .map(|i| i + 1)
        .unwrap_or(0);
    let tokens = &tokens[start..];

    let mut result = String::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];

        // "M as in Mike" keeps the letter, drops the phonetic anchor.
        if i + 2 < tokens.len()
            && token.len() == 1
            && token.chars().all(|c| c.is_ascii_alphabetic())
            && tokens[i + 1] == "AS"
            && tokens[i + 2] == "IN"
        {
            result.push_str(token);
            i += 4; // letter + "AS" + "IN" + anchor word
            continue;
        }

        if let Some((_, digit)) = DIGIT_WORDS.iter().find(|(word, _)| *word == token.as_str()) {
            result.push_str(digit);
        } else {
            result.push_str(token);
        }
        i += 1;
    }

    if result.is_empty() {
        return Err(NormalizationError {
            raw: raw.to_string(),
        });
    }

    Ok(result)
}
