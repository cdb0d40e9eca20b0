//! Passport number extraction from OCR text.

use regex::Regex;
use std::sync::OnceLock;

/// One uppercase letter followed by seven digits, on word boundaries.
const PASSPORT_NUMBER_PATTERN: &str = r"\b[A-Z][0-9]{7}\b";

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PASSPORT_NUMBER_PATTERN).expect("passport number pattern is valid"))
}

/// First passport number in `text`, if any.
pub fn extract_passport_number(text: &str) -> Option<&str> {
    pattern().find(text).map(|m| m.as_str())
}
