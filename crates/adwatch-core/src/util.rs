use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Collapse runs of whitespace to single spaces and lowercase the text.
///
/// Cross-posts of the same listing routinely differ only in spacing, line
/// breaks or letter case; normalizing first makes the hash catch them.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 hex digest of the normalized text.
pub fn content_hash(text: &str) -> String {
    let normalized = normalize_text(text);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Phone-number candidates found in free text, kept as written.
///
/// Fallback for listings where the model returns no contacts even though
/// the message plainly carries a number.
pub fn extract_phone_numbers(text: &str) -> Vec<String> {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    let re = PHONE.get_or_init(|| Regex::new(r"\+?\d[\d\s\-()]{7,14}\d").expect("phone regex"));

    let mut out = Vec::new();
    for m in re.find_iter(text) {
        let candidate = m.as_str().trim().to_string();
        let digits = candidate.chars().filter(|c| c.is_ascii_digit()).count();
        if digits >= 8 && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}
