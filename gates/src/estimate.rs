//! Pre-flight token estimates.
//!
//! The gateway sizes every request before it reaches the network so the
//! budget guard can refuse it early; the semantic pass uses the same
//! estimate to cut requirement text down to its per-pair allowance.

/// Token count of a text, without calling a tokenizer.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;
}

/// `ceil(chars / chars_per_token)`. Counts chars, not bytes, so non-ASCII
/// text is not overcharged.
#[derive(Debug, Clone)]
pub struct CharCountEstimator {
    pub chars_per_token: f64,
}

impl Default for CharCountEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl CharCountEstimator {
    /// Longest prefix of `text` whose estimate stays within `max_tokens`.
    pub fn truncate_to_tokens<'a>(&self, text: &'a str, max_tokens: u64) -> &'a str {
        let max_chars = (max_tokens as f64 * self.chars_per_token).floor() as usize;
        text.char_indices()
            .nth(max_chars)
            .map_or(text, |(cut, _)| &text[..cut])
    }
}

impl TokenEstimator for CharCountEstimator {
    fn estimate(&self, text: &str) -> u64 {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as u64
    }
}
