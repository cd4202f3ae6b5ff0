//! Text normalization shared by the lexical rules and the similarity heuristic.

use std::collections::{BTreeMap, BTreeSet};

/// Words that carry no subject matter.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "as", "at", "be", "by", "can", "could", "do", "does", "for",
    "from", "has", "have", "in", "into", "is", "it", "its", "may", "must", "of", "on", "or",
    "shall", "should", "so", "that", "the", "their", "then", "there", "these", "this", "to",
    "via", "was", "we", "will", "with", "would", "all", "each", "every", "also", "only", "been",
    "being", "user", "users", "system", "app", "application",
];

/// Words that flip a statement's polarity.
pub const NEGATION_WORDS: &[&str] = &["not", "no", "never", "without", "cannot", "none", "nor"];

/// Default synonym table applied to every token.
pub fn default_synonyms() -> BTreeMap<String, String> {
    [
        ("db", "database"),
        ("databases", "database"),
        ("sessions", "session"),
        ("multitenant", "multi tenant"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Lowercase, expand `n't`, turn punctuation into spaces and squash runs.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase().replace("can't", "cannot").replace("n't", " not");
    let spaced: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize then map each token through `synonyms`. A synonym may expand to
/// several words (`multitenant` → `multi tenant`).
pub fn tokenize(text: &str, synonyms: &BTreeMap<String, String>) -> Vec<String> {
    normalize_text(text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .flat_map(|tok| {
            let mapped = synonyms.get(tok).map(String::as_str).unwrap_or(tok);
            mapped
                .split(' ')
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Crude plural folding: `emails` → `email`, leaves `class`, `ms` alone.
pub fn stem(token: &str) -> &str {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        &token[..token.len() - 1]
    } else {
        token
    }
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

pub fn is_negation(token: &str) -> bool {
    NEGATION_WORDS.contains(&token)
}

/// Subject-bearing tokens: no stop words, no negations, no bare numbers.
pub fn content_tokens(tokens: &[String]) -> BTreeSet<String> {
    tokens
        .iter()
        .map(String::as_str)
        .filter(|t| !is_stop_word(t) && !is_negation(t))
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .map(|t| stem(t).to_string())
        .collect()
}

/// Whether `phrase` occurs in the space-joined token string on word boundaries.
pub fn contains_phrase(joined: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    format!(" {joined} ").contains(&format!(" {phrase} "))
}

/// Token-set Jaccard similarity. Two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Share of `part` found in `whole`. An empty `part` scores 0.
pub fn coverage(part: &BTreeSet<String>, whole: &BTreeSet<String>) -> f64 {
    if part.is_empty() {
        return 0.0;
    }
    part.intersection(whole).count() as f64 / part.len() as f64
}
