//! Streaming content deduplication
//!
//! Upstream occasionally re-sends cumulative assistant content instead of an
//! increment. `delta_by_prefix` computes the genuinely-new suffix so the
//! client never sees repeated text.

/// Overlap scan cap; beyond this the strings are treated as unrelated
const MAX_OVERLAP_CHECK: usize = 4096;

/// Fragments shorter than this are assumed to already be deltas; dropping
/// their overlap would remove intentional repetition
const SMALL_FRAGMENT_LEN: usize = 32;

/// Calculate the delta between the accumulated content and a new fragment.
///
/// Returns `(new_previous, delta)`:
/// - `new_previous` is the complete content after incorporating `current`
/// - `delta` is the new part to emit (empty if `current` adds nothing)
///
/// Cases, in precedence order:
/// 1. `current` empty -> no delta
/// 2. `current` starts with `previous` -> suffix
/// 3. `previous` found inside `current` at index > 0 -> text after it
/// 4. longest overlap where `previous` ends with a prefix of `current`
///    (skipped for fragments < 32 chars)
/// 5. no relationship -> concatenate
pub fn delta_by_prefix(previous: &str, current: &str) -> (String, String) {
    if current.is_empty() {
        return (previous.to_string(), String::new());
    }
    if previous.is_empty() {
        return (current.to_string(), current.to_string());
    }

    // Case 2: cumulative re-send
    if let Some(delta) = current.strip_prefix(previous) {
        if delta.is_empty() {
            return (previous.to_string(), String::new());
        }
        return (current.to_string(), delta.to_string());
    }

    // Case 3: previous embedded later in current with trailing new content
    if previous.len() < current.len() {
        if let Some(idx) = current.find(previous) {
            if idx > 0 {
                let delta = &current[idx + previous.len()..];
                if !delta.is_empty() {
                    return (format!("{}{}", previous, delta), delta.to_string());
                }
            }
        }
    }

    // Small fragments are taken as-is; they are usually already deltas
    if current.len() < SMALL_FRAGMENT_LEN {
        return (format!("{}{}", previous, current), current.to_string());
    }

    // Case 4: suffix of previous overlaps a prefix of current
    let max_check = previous.len().min(current.len()).min(MAX_OVERLAP_CHECK);
    for length in (1..=max_check).rev() {
        if !current.is_char_boundary(length) {
            continue;
        }
        if previous.ends_with(&current[..length]) {
            let delta = &current[length..];
            return (format!("{}{}", previous, delta), delta.to_string());
        }
    }

    // Case 5: independent addition
    (format!("{}{}", previous, current), current.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_prefix() {
        assert_eq!(
            delta_by_prefix("Hello", "Hello world"),
            ("Hello world".to_string(), " world".to_string())
        );
    }

    #[test]
    fn test_identical_emits_empty() {
        assert_eq!(
            delta_by_prefix("Hello world", "Hello world"),
            ("Hello world".to_string(), String::new())
        );
    }

    #[test]
    fn test_empty_current() {
        assert_eq!(delta_by_prefix("abc", ""), ("abc".to_string(), String::new()));
    }

    #[test]
    fn test_empty_previous() {
        assert_eq!(delta_by_prefix("", "abc"), ("abc".to_string(), "abc".to_string()));
    }

    #[test]
    fn test_substring_at_positive_index() {
        let prev = "the quick brown fox jumps over the lazy";
        let curr = format!("> {} dog and keeps running to the horizon", prev);
        let (merged, delta) = delta_by_prefix(prev, &curr);
        assert_eq!(delta, " dog and keeps running to the horizon");
        assert_eq!(merged, format!("{}{}", prev, delta));
    }

    #[test]
    fn test_partial_overlap() {
        let prev = "Hello wor";
        let curr = "wor".to_string() + &"ld of streaming responses today".repeat(2);
        let (merged, delta) = delta_by_prefix(prev, &curr);
        assert!(delta.starts_with("ld of streaming"));
        assert_eq!(merged, format!("{}{}", prev, delta));
    }

    #[test]
    fn test_small_fragment_is_additive() {
        // "ha" overlaps "haha" but small fragments must not be collapsed
        let (merged, delta) = delta_by_prefix("haha", "haha");
        assert_eq!(delta, "");
        assert_eq!(merged, "haha");

        let (merged, delta) = delta_by_prefix("lol ", "lol ");
        assert_eq!(delta, "");
        drop(merged);

        let (merged, delta) = delta_by_prefix("abc", "cab");
        assert_eq!(delta, "cab");
        assert_eq!(merged, "abccab");
    }

    #[test]
    fn test_no_overlap_concatenates() {
        let prev = "first sentence of the answer here";
        let curr = "totally different second sentence!!";
        let (merged, delta) = delta_by_prefix(prev, curr);
        assert_eq!(delta, curr);
        assert_eq!(merged, format!("{}{}", prev, curr));
    }

    #[test]
    fn test_idempotence_on_repeat() {
        let prev = "cumulative content that upstream re-sends verbatim in full";
        let (merged, delta) = delta_by_prefix(prev, prev);
        assert_eq!(merged, prev);
        assert_eq!(delta, "");
    }

    #[test]
    fn test_concat_law_over_sequence() {
        // concat of all deltas equals the final cumulative content
        let events = ["Hel", "Hello", "Hello wor", "Hello world!", "Hello world!"];
        let mut acc = String::new();
        let mut emitted = String::new();
        for c in events {
            let (merged, delta) = delta_by_prefix(&acc, c);
            acc = merged;
            emitted.push_str(&delta);
        }
        assert_eq!(acc, "Hello world!");
        assert_eq!(emitted, "Hello world!");
    }

    #[test]
    fn test_delta_is_suffix_of_current() {
        let cases = [
            ("Hello", "Hello world"),
            ("abcdef", "defghi jklmnop qrstuv wxyz 0123456"),
            ("xyz", "completely unrelated long content 12345"),
        ];
        for (prev, curr) in cases {
            let (_, delta) = delta_by_prefix(prev, curr);
            assert!(curr.ends_with(&delta), "delta {:?} not a suffix of {:?}", delta, curr);
        }
    }

    #[test]
    fn test_multibyte_content() {
        let (merged, delta) = delta_by_prefix("你好", "你好，世界");
        assert_eq!(delta, "，世界");
        assert_eq!(merged, "你好，世界");
    }
}
