//! Full-text tokenization shared by indexing and querying

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

pub const MIN_TOKEN_CHARS: usize = 3;

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "the", "and", "but", "for", "with", "are", "was", "were", "been", "being",
        "have", "has", "had", "does", "did", "will", "would", "shall", "should",
        "may", "might", "must", "can", "could", "you", "she", "they", "him", "her",
        "them", "your", "his", "its", "our", "their", "mine", "yours", "hers",
        "ours", "theirs", "this", "that", "these", "those", "from", "into", "then",
        "than", "not", "all", "any", "about", "just", "also", "there", "here",
    ]
    .into_iter()
    .collect();
    static ref PUNCTUATION: Regex = Regex::new(r"[^\p{L}\p{N}\s]+").unwrap();
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(token)
}

/// Lowercase, strip punctuation, split on whitespace, and drop short tokens and
/// stop words. Each token appears once, in first-seen order.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let cleaned = PUNCTUATION.replace_all(&lowered, "");
    let mut seen = HashSet::new();
    cleaned
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS && !is_stop_word(t))
        .filter(|t| seen.insert(*t))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tokenize_basic() {
        assert_eq!(
            tokenize("The Rust storage-engine, and THE rust cache!"),
            vec!["rust", "storageengine", "cache"]
        );
    }

    #[test]
    fn test_short_tokens_and_stop_words_dropped() {
        assert!(tokenize("a an to of is it we").is_empty());
        assert_eq!(tokenize("go api db sql"), vec!["api", "sql"]);
    }

    #[test]
    fn test_unicode_letters_survive() {
        assert_eq!(tokenize("Café résumé"), vec!["café", "résumé"]);
    }

    proptest! {
        #[test]
        fn prop_tokens_are_normalized(text in "\\PC{0,200}") {
            for token in tokenize(&text) {
                prop_assert!(token.chars().count() >= MIN_TOKEN_CHARS);
                prop_assert!(!is_stop_word(&token));
                prop_assert!(!token.chars().any(char::is_whitespace));
            }
        }
    }
}
