//! Input validation and normalization

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{MycelicError, Result};
use crate::types::{MAX_CONTENT_BYTES, MAX_DOMAIN_LENGTH, MAX_TAGS, MAX_TAG_LENGTH};

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[a-z0-9][a-z0-9_-]*[a-z0-9]|[a-z0-9])$").unwrap());

static DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[a-z0-9][a-z0-9_-]*[a-z0-9]|[a-z0-9])$").unwrap());

/// Validate memory content: non-empty, bounded, no embedded NULs
pub fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(MycelicError::invalid("content", "must not be empty"));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(MycelicError::invalid(
            "content",
            format!("exceeds {} bytes", MAX_CONTENT_BYTES),
        ));
    }
    if content.contains('\0') {
        return Err(MycelicError::invalid("content", "contains NUL byte"));
    }
    Ok(())
}

/// Clamp importance into [1, 10], defaulting to 5
pub fn clamp_importance(importance: Option<i32>) -> i32 {
    importance.unwrap_or(5).clamp(1, 10)
}

/// Normalize a single tag: trim, lowercase, check shape and length
pub fn normalize_tag(tag: &str) -> Result<String> {
    let normalized = tag.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(MycelicError::invalid("tags", "tag must not be empty"));
    }
    if normalized.len() > MAX_TAG_LENGTH {
        return Err(MycelicError::invalid(
            "tags",
            format!("tag '{}' exceeds {} characters", normalized, MAX_TAG_LENGTH),
        ));
    }
    if !TAG_RE.is_match(&normalized) {
        return Err(MycelicError::invalid(
            "tags",
            format!("tag '{}' has invalid characters", normalized),
        ));
    }
    Ok(normalized)
}

/// Normalize a tag list: per-tag rules plus dedup and count bound.
/// Order of first occurrence is preserved.
pub fn normalize_tags(tags: &[String]) -> Result<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut normalized = Vec::new();
    for tag in tags {
        let tag = normalize_tag(tag)?;
        if seen.insert(tag.clone()) {
            normalized.push(tag);
        }
    }
    if normalized.len() > MAX_TAGS {
        return Err(MycelicError::invalid(
            "tags",
            format!("at most {} tags allowed", MAX_TAGS),
        ));
    }
    Ok(normalized)
}

/// Normalize a domain name
pub fn normalize_domain(domain: &str) -> Result<String> {
    let normalized = domain.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(MycelicError::invalid("domain", "must not be empty"));
    }
    if normalized.len() > MAX_DOMAIN_LENGTH {
        return Err(MycelicError::invalid(
            "domain",
            format!("exceeds {} characters", MAX_DOMAIN_LENGTH),
        ));
    }
    if !DOMAIN_RE.is_match(&normalized) {
        return Err(MycelicError::invalid(
            "domain",
            format!("'{}' has invalid characters", normalized),
        ));
    }
    Ok(normalized)
}

/// Validate a slug: same shape as tags but longer
pub fn validate_slug(slug: &str) -> Result<String> {
    let normalized = slug.trim().to_lowercase();
    if normalized.is_empty() || normalized.len() > 128 || !TAG_RE.is_match(&normalized) {
        return Err(MycelicError::invalid(
            "slug",
            format!("'{}' is not a valid slug", slug),
        ));
    }
    Ok(normalized)
}

/// Validate relationship strength
pub fn validate_strength(strength: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&strength) || strength.is_nan() {
        return Err(MycelicError::invalid(
            "strength",
            "must be within [0.0, 1.0]",
        ));
    }
    Ok(strength)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_bounds() {
        assert!(validate_content("hello").is_ok());
        assert!(validate_content("").is_err());
        assert!(validate_content("   ").is_err());
        assert!(validate_content("nul\0byte").is_err());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_BYTES + 1)).is_err());
    }

    #[test]
    fn test_importance_clamped() {
        assert_eq!(clamp_importance(None), 5);
        assert_eq!(clamp_importance(Some(0)), 1);
        assert_eq!(clamp_importance(Some(11)), 10);
        assert_eq!(clamp_importance(Some(7)), 7);
    }

    #[test]
    fn test_tag_shapes() {
        assert_eq!(normalize_tag(" Rust ").unwrap(), "rust");
        assert_eq!(normalize_tag("a").unwrap(), "a");
        assert_eq!(normalize_tag("go-lang_2").unwrap(), "go-lang_2");
        assert!(normalize_tag("-leading").is_err());
        assert!(normalize_tag("trailing-").is_err());
        assert!(normalize_tag("has space").is_err());
        assert!(normalize_tag("").is_err());
        assert!(normalize_tag(&"t".repeat(MAX_TAG_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_tags_deduplicated_in_order() {
        let tags = vec!["Go".into(), "go".into(), "interfaces".into()];
        assert_eq!(normalize_tags(&tags).unwrap(), vec!["go", "interfaces"]);
    }

    #[test]
    fn test_tag_count_bound() {
        let tags: Vec<String> = (0..MAX_TAGS + 1).map(|i| format!("tag{}", i)).collect();
        assert!(normalize_tags(&tags).is_err());
    }

    #[test]
    fn test_domain_length_bound() {
        assert!(normalize_domain(&"d".repeat(MAX_DOMAIN_LENGTH)).is_ok());
        assert!(normalize_domain(&"d".repeat(MAX_DOMAIN_LENGTH + 1)).is_err());
    }
}
