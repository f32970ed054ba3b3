//! Recovery phrases: BIP-39 generation, normalization, and strength checks
//! for user-chosen phrases

use bip39::{Language, Mnemonic};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keys::fill_random;

/// Bits credited to a word from the BIP-39 English list.
const BIP39_WORD_BITS: f64 = 11.0;
/// Bits credited per character of any other word.
const BITS_PER_CHAR: f64 = 2.5;
/// Cap per non-wordlist word.
const MAX_WORD_BITS: f64 = 20.0;

/// Strength rules for user-chosen phrases
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhraseRules {
    pub min_words: usize,
    pub min_distinct_words: usize,
    pub min_entropy_bits: f64,
}

impl Default for PhraseRules {
    fn default() -> Self {
        Self {
            min_words: 6,
            min_distinct_words: 5,
            min_entropy_bits: 55.0,
        }
    }
}

impl From<&pvault_core::config::RecoveryConfig> for PhraseRules {
    fn from(cfg: &pvault_core::config::RecoveryConfig) -> Self {
        Self {
            min_words: cfg.min_custom_words,
            min_distinct_words: cfg.min_distinct_words,
            min_entropy_bits: cfg.min_entropy_bits,
        }
    }
}

/// Generate a fresh BIP-39 phrase of 12 or 24 words.
pub fn generate_phrase(words: usize) -> Result<Zeroizing<String>, CryptoError> {
    let mut entropy = Zeroizing::new([0u8; 32]);
    let len = match words {
        12 => 16,
        24 => 32,
        n => return Err(CryptoError::Kdf(format!("unsupported phrase length: {n} words"))),
    };
    fill_random(&mut entropy[..len])?;

    let mnemonic = Mnemonic::from_entropy(&entropy[..len])
        .map_err(|e| CryptoError::Kdf(format!("BIP-39 mnemonic generation failed: {e}")))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Canonical phrase form: trimmed, lowercased, single spaces.
pub fn normalize_phrase(phrase: &str) -> Zeroizing<String> {
    let lowered = Zeroizing::new(phrase.to_lowercase());
    Zeroizing::new(lowered.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Rough entropy estimate of a normalized phrase, in bits.
pub fn estimate_entropy_bits(normalized: &str) -> f64 {
    let wordlist = Language::English.word_list();
    normalized
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            if wordlist.binary_search(&w).is_ok() {
                BIP39_WORD_BITS
            } else {
                (w.chars().count() as f64 * BITS_PER_CHAR).min(MAX_WORD_BITS)
            }
        })
        .sum()
}

/// Check a user-chosen phrase. The error string names the failed rule and
/// nothing about the phrase contents.
pub fn validate_custom_phrase(phrase: &str, rules: &PhraseRules) -> Result<(), String> {
    let normalized = normalize_phrase(phrase);
    let words: Vec<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();

    if words.len() < rules.min_words {
        return Err(format!(
            "phrase has {} words, at least {} required",
            words.len(),
            rules.min_words
        ));
    }

    let mut distinct = words.clone();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() < rules.min_distinct_words {
        return Err(format!(
            "phrase has {} distinct words, at least {} required",
            distinct.len(),
            rules.min_distinct_words
        ));
    }

    let bits = estimate_entropy_bits(&normalized);
    if bits < rules.min_entropy_bits {
        return Err(format!(
            "phrase is too guessable (~{bits:.0} bits, {:.0} required)",
            rules.min_entropy_bits
        ));
    }
    Ok(())
}
