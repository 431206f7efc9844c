//! Model name normalization
//!
//! Maps the model ids clients send (canonical Anthropic ids, short names,
//! friendly labels) onto the four ids the upstream actually accepts.
//! Unknown names collapse to the configured default so requests never reach
//! upstream with an id that triggers a ValidationException.

/// Models the upstream accepts
pub const VALID_AMAZONQ_MODELS: &[&str] = &[
    "claude-sonnet-4",
    "claude-sonnet-4.5",
    "claude-haiku-4.5",
    "claude-opus-4.5",
];

/// Canonical Anthropic ids with an exact mapping
const CANONICAL_TO_SHORT: &[(&str, &str)] = &[
    ("claude-sonnet-4-20250514", "claude-sonnet-4"),
    ("claude-sonnet-4-5-20250929", "claude-sonnet-4.5"),
    ("claude-haiku-4-5-20251001", "claude-haiku-4.5"),
    ("claude-opus-4-5-20251101", "claude-opus-4.5"),
    ("claude-3-5-sonnet-20241022", "claude-sonnet-4.5"),
    ("claude-3-5-sonnet-20240620", "claude-sonnet-4.5"),
    ("claude-3-5-haiku-20241022", "claude-haiku-4.5"),
];

/// Clients often send friendly labels like "opus (claude-opus-4-5-20251101)".
/// Retain only the substring starting from the claude- prefix and strip
/// wrapping punctuation.
fn normalize_model_id(model: Option<&str>) -> String {
    let raw = model.unwrap_or("").trim().to_lowercase();
    if raw.is_empty() {
        return raw;
    }
    let raw = match raw.find("claude-") {
        Some(idx) if idx > 0 => raw[idx..].to_string(),
        _ => raw,
    };
    raw.trim_matches(|c| "()[]{} ".contains(c)).to_string()
}

fn heuristic_map(model_lower: &str) -> Option<&'static str> {
    if model_lower.starts_with("claude-sonnet-4-5") || model_lower.starts_with("claude-sonnet-4.5")
    {
        return Some("claude-sonnet-4.5");
    }
    if model_lower.starts_with("claude-sonnet-4") {
        return Some("claude-sonnet-4");
    }
    if model_lower.contains("opus-4-5") || model_lower.contains("opus-4.5") {
        return Some("claude-opus-4.5");
    }
    if model_lower.contains("haiku-4-5") || model_lower.contains("haiku-4.5") {
        return Some("claude-haiku-4.5");
    }
    if model_lower.contains("opus") {
        return Some("claude-opus-4.5");
    }
    if model_lower.contains("haiku") {
        return Some("claude-haiku-4.5");
    }
    if model_lower.contains("1m") || model_lower.contains("1000k") {
        return Some("claude-sonnet-4.5");
    }
    None
}

fn resolve_model_id(model_lower: &str) -> Option<String> {
    if model_lower.is_empty() {
        return None;
    }
    if VALID_AMAZONQ_MODELS.contains(&model_lower) {
        return Some(model_lower.to_string());
    }
    if let Some((_, short)) = CANONICAL_TO_SHORT.iter().find(|(c, _)| *c == model_lower) {
        return Some(short.to_string());
    }
    heuristic_map(model_lower).map(|s| s.to_string())
}

fn ensure_default(default_model: &str) -> String {
    let normalized = normalize_model_id(Some(default_model));
    resolve_model_id(&normalized).unwrap_or_else(|| "claude-sonnet-4".to_string())
}

/// Map a requested model id to an Amazon Q model id.
pub fn map_model_to_amazonq(model: Option<&str>, default_model: &str) -> String {
    let default = ensure_default(default_model);
    let model_lower = normalize_model_id(model);
    if model_lower.is_empty() || model_lower == "auto" {
        return default;
    }

    match resolve_model_id(&model_lower) {
        Some(resolved) if VALID_AMAZONQ_MODELS.contains(&resolved.as_str()) => {
            if resolved != model_lower {
                tracing::debug!("Mapped model '{}' to '{}'", model_lower, resolved);
            }
            resolved
        }
        _ => {
            tracing::warn!(
                "Unable to normalize model '{}', using default '{}'",
                model_lower,
                default
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_ids() {
        assert_eq!(
            map_model_to_amazonq(Some("claude-sonnet-4-5-20250929"), "auto"),
            "claude-sonnet-4.5"
        );
        assert_eq!(
            map_model_to_amazonq(Some("claude-3-5-haiku-20241022"), "auto"),
            "claude-haiku-4.5"
        );
    }

    #[test]
    fn test_heuristic_opus_dated_id() {
        assert_eq!(
            map_model_to_amazonq(Some("claude-opus-4-1-20250805"), "auto"),
            "claude-opus-4.5"
        );
    }

    #[test]
    fn test_already_valid_passes_through() {
        assert_eq!(
            map_model_to_amazonq(Some("claude-sonnet-4"), "auto"),
            "claude-sonnet-4"
        );
    }

    #[test]
    fn test_friendly_label_normalized() {
        assert_eq!(
            map_model_to_amazonq(Some("opus (claude-opus-4-5-20251101)"), "auto"),
            "claude-opus-4.5"
        );
    }

    #[test]
    fn test_unknown_falls_back_to_default() {
        assert_eq!(map_model_to_amazonq(Some("gpt-4o"), "auto"), "claude-sonnet-4");
        assert_eq!(
            map_model_to_amazonq(Some("gpt-4o"), "claude-haiku-4.5"),
            "claude-haiku-4.5"
        );
    }

    #[test]
    fn test_empty_and_auto_use_default() {
        assert_eq!(map_model_to_amazonq(None, "auto"), "claude-sonnet-4");
        assert_eq!(map_model_to_amazonq(Some("auto"), "claude-opus-4.5"), "claude-opus-4.5");
    }

    #[test]
    fn test_bad_default_falls_back_to_sonnet() {
        assert_eq!(map_model_to_amazonq(Some("mystery"), "also-unknown"), "claude-sonnet-4");
    }
}
