//! Encoding Normalizer
//!
//! The upstream extract has been published in UTF-8, in windows-1252, and in
//! a mix of both where some fields were UTF-8 bytes decoded as Latin-1
//! ("HÃ´pital" for "Hôpital"). Decoding happens once per buffer; repair
//! happens per text field, because a single buffer may mix both cases.
//!
//! Repair is conservative. A field is rewritten only when re-encoding it as
//! windows-1252 yields valid UTF-8 that scores better on legibility, so
//! correctly encoded text is never altered.

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

/// Mojibake layers undone at most (double and triple encoding seen upstream)
const MAX_REPAIR_PASSES: usize = 3;

/// Confidence assigned when the detector had to guess
const GUESSED_CONFIDENCE: f64 = 0.9;

/// Decoded buffer with detection metadata
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedText {
    pub text: String,
    /// WHATWG encoding name, e.g. "UTF-8" or "windows-1252"
    pub encoding: &'static str,
    pub confidence: f64,
    pub low_confidence: bool,
    pub had_bom: bool,
}

/// Detect the buffer encoding and decode it
///
/// Never fails: undecodable bytes become U+FFFD and lower the confidence.
pub fn detect_and_decode(bytes: &[u8], threshold: f64) -> DecodedText {
    let (encoding, text, confidence, had_bom) = if let Some((enc, bom_len)) = Encoding::for_bom(bytes) {
        let (text, had_errors) = enc.decode_without_bom_handling(&bytes[bom_len..]);
        let confidence = if had_errors { clean_fraction(&text) } else { 1.0 };
        (enc, text.into_owned(), confidence, true)
    } else if let Ok(text) = std::str::from_utf8(bytes) {
        (UTF_8, text.to_string(), 1.0, false)
    } else {
        let mut detector = EncodingDetector::new();
        detector.feed(bytes, true);
        let enc = detector.guess(None, true);
        let (text, had_errors) = enc.decode_without_bom_handling(bytes);
        let base = if had_errors { GUESSED_CONFIDENCE / 2.0 } else { GUESSED_CONFIDENCE };
        let confidence = base * clean_fraction(&text);
        (enc, text.into_owned(), confidence, false)
    };

    let low_confidence = confidence < threshold;
    if low_confidence {
        tracing::warn!(
            encoding = encoding.name(),
            confidence,
            threshold,
            "Low-confidence encoding detection"
        );
    } else {
        tracing::debug!(encoding = encoding.name(), confidence, "Detected extract encoding");
    }

    DecodedText {
        text,
        encoding: encoding.name(),
        confidence,
        low_confidence,
        had_bom,
    }
}

/// Result of a repair attempt on one field
#[derive(Debug, Clone, PartialEq)]
pub struct Repair {
    pub text: String,
    pub applied: bool,
}

/// Undo UTF-8-read-as-windows-1252 mojibake in a single field
pub fn repair_mojibake(text: &str) -> Repair {
    let mut current = text.to_string();
    let mut applied = false;

    for _ in 0..MAX_REPAIR_PASSES {
        let before = Legibility::of(&current);
        if before.garbled == 0 {
            break;
        }

        let (bytes, _, unmappable) = WINDOWS_1252.encode(&current);
        if unmappable {
            break;
        }
        let Ok(candidate) = std::str::from_utf8(&bytes) else {
            break;
        };

        if Legibility::of(candidate).score() > before.score() {
            current = candidate.to_string();
            applied = true;
        } else {
            break;
        }
    }

    Repair { text: current, applied }
}

/// True when the text still shows replacement characters or mojibake pairs
pub fn looks_garbled(text: &str) -> bool {
    Legibility::of(text).garbled > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Legibility {
    accented: usize,
    garbled: usize,
}

impl Legibility {
    fn of(text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let mut accented = 0;
        let mut garbled = 0;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c == char::REPLACEMENT_CHARACTER {
                garbled += 1;
                i += 1;
                continue;
            }
            if is_utf8_lead_as_latin1(c) && chars.get(i + 1).is_some_and(|&next| is_continuation(next)) {
                garbled += 1;
                i += 2;
                continue;
            }
            if is_accented_letter(c) {
                accented += 1;
            }
            i += 1;
        }

        Self { accented, garbled }
    }

    fn score(&self) -> f64 {
        (self.accented as f64 + 1.0) / (self.garbled as f64 + 1.0)
    }
}

/// Latin-1 rendering of a UTF-8 two-to-four byte lead (0xC2..=0xF4)
fn is_utf8_lead_as_latin1(c: char) -> bool {
    ('\u{C2}'..='\u{F4}').contains(&c)
}

/// Char whose windows-1252 byte is a UTF-8 continuation byte
fn is_continuation(c: char) -> bool {
    cp1252_byte(c).is_some_and(|b| (0x80..=0xBF).contains(&b))
}

fn cp1252_byte(c: char) -> Option<u8> {
    let mut buf = [0u8; 4];
    let (bytes, _, unmappable) = WINDOWS_1252.encode(c.encode_utf8(&mut buf));
    if unmappable || bytes.len() != 1 {
        None
    } else {
        Some(bytes[0])
    }
}

fn is_accented_letter(c: char) -> bool {
    c.is_alphabetic() && ('\u{C0}'..='\u{17F}').contains(&c) && c != '\u{D7}' && c != '\u{F7}'
}

/// Share of characters that are not damage: U+FFFD, mojibake pairs, C1 controls
fn clean_fraction(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 1.0;
    }
    let bad = text.chars().filter(|c| ('\u{80}'..='\u{9F}').contains(c)).count();
    let garbled = Legibility::of(text).garbled;
    (1.0 - (bad + garbled) as f64 / total as f64).clamp(0.0, 1.0)
}
