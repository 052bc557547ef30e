//! Token estimation for request sizing.
//!
//! Estimates are character-count based: fast, deterministic and deliberately
//! approximate. The chunker relies on one property only: a longer text never
//! gets a smaller estimate.

/// Approximates the token count of a text.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

    /// A ratio of 0 is clamped to 1.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_partial_tokens() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let est = CharRatioEstimator::new(1);
        assert_eq!(est.estimate("Zölle"), 5);
    }

    #[test]
    fn zero_ratio_is_clamped() {
        assert_eq!(CharRatioEstimator::new(0).chars_per_token(), 1);
    }

    #[test]
    fn monotonic_in_length() {
        let est = CharRatioEstimator::default();
        let mut text = String::new();
        let mut prev = 0;
        for _ in 0..64 {
            text.push('x');
            let cur = est.estimate(&text);
            assert!(cur >= prev);
            prev = cur;
        }
    }
}
