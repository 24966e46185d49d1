//! Text keys for identity lookup.
//!
//! [`strip_code`] removes separators from scanned codes and serials.
//! [`normalize_text`] produces the accent/case/whitespace-insensitive key used
//! by the fuzzy steps of the lookup cascade.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Remove whitespace and hyphens: `"BRC-003 A"` → `"BRC003A"`.
#[must_use]
pub fn strip_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

/// Fuzzy-match key: decompose, drop diacritics, lowercase, turn punctuation
/// into spaces and collapse runs of whitespace.
///
/// `"Laptop  Núm. 7"`, `"laptop num 7"` and `"LAPTOP NUM 7"` all map to
/// `"laptop num 7"`.
#[must_use]
pub fn normalize_text(raw: &str) -> String {
    let folded: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized `brand + model` key; empty when both parts are blank.
#[must_use]
pub fn brand_model_key(brand: &str, model: &str) -> String {
    normalize_text(&format!("{brand} {model}"))
}
