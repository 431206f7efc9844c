//! Token counting
//!
//! Uses the cl100k_base encoding. Very large payloads short-circuit to a
//! byte-length estimate: exact tokenization of multi-hundred-KB prompts
//! stalls the event loop for longer than the answer is worth.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

/// Above this many characters, byte length stands in for the token count
pub const SHORT_CIRCUIT_CHARS: usize = 20_000;

fn encoding() -> Option<&'static CoreBPE> {
    static ENCODING: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODING
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!("cl100k_base unavailable, token counts will be 0: {}", e);
                None
            }
        })
        .as_ref()
}

/// Count tokens in a text.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let Some(bpe) = encoding() else {
        return 0;
    };
    bpe.encode_with_special_tokens(text).len()
}

/// Budget estimate used for limit checks: token count, or raw length for
/// oversized text.
pub fn budget_estimate(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    if text.len() >= SHORT_CIRCUIT_CHARS {
        return text.len();
    }
    count_tokens(text)
}

/// Count tokens and apply the configured reporting multiplier.
pub fn count_tokens_scaled(text: &str, multiplier: f64) -> usize {
    let count = count_tokens(text);
    (count as f64 * multiplier) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_counts_zero() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(budget_estimate(""), 0);
    }

    #[test]
    fn test_short_text_counts_tokens() {
        let n = count_tokens("hello world");
        assert!(n >= 1 && n <= 4);
    }

    #[test]
    fn test_budget_short_circuits_large_text() {
        let big = "a".repeat(SHORT_CIRCUIT_CHARS);
        assert_eq!(budget_estimate(&big), big.len());

        let small = "a".repeat(100);
        assert!(budget_estimate(&small) < 100);
    }

    #[test]
    fn test_multiplier_scales_count() {
        let base = count_tokens("one two three four five");
        assert_eq!(count_tokens_scaled("one two three four five", 2.0), base * 2);
        assert_eq!(count_tokens_scaled("one two three four five", 1.0), base);
    }
}
