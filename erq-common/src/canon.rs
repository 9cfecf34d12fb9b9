//! Name canonicalization
//!
//! Produces the comparison key used to match facility, region and column
//! names across extracts: accents removed, lowercase, punctuation replaced
//! by spaces, whitespace collapsed. The key is never displayed.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonical comparison key for a name
///
/// Deterministic and idempotent: `canonicalize(&canonicalize(x)) == canonicalize(x)`.
pub fn canonicalize(name: &str) -> String {
    let mut folded = String::with_capacity(name.len());

    for c in name.nfkd() {
        if is_combining_mark(c) {
            continue;
        }
        for lower in c.to_lowercase() {
            if is_combining_mark(lower) {
                continue;
            }
            match fold_ligature(lower) {
                Some(expansion) => folded.push_str(expansion),
                None if lower.is_alphanumeric() => folded.push(lower),
                None => folded.push(' '),
            }
        }
    }

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Letters NFKD leaves intact but readers treat as plain ASCII
fn fold_ligature(c: char) -> Option<&'static str> {
    match c {
        'œ' => Some("oe"),
        'æ' => Some("ae"),
        'ß' => Some("ss"),
        'ø' => Some("o"),
        'đ' => Some("d"),
        'ł' => Some("l"),
        'ı' => Some("i"),
        _ => None,
    }
}
