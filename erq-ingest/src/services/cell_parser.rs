//! Cell parsing for numeric and timestamp columns
//!
//! The extract writes decimals with a comma, leaves blanks or "N/D" for
//! unknown values, and gives the extraction time either as a full timestamp
//! or as a bare "HH:MM" whose date comes from the `Mise_a_jour` column.

use crate::models::{NumericCell, TimestampCell};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};

const DATETIME_FORMATS: [&str; 8] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %Hh%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];

const TIME_FORMATS: [&str; 3] = ["%H:%M", "%H:%M:%S", "%Hh%M"];

/// Placeholders the publisher uses for "no value"
fn is_placeholder(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "" | "-" | "--" | "n/d" | "nd" | "n/a" | "na" | "null" | "nan"
    )
}

/// Parse a count or decimal cell
pub fn parse_number(cell: Option<&str>) -> NumericCell {
    let Some(raw) = cell else {
        return NumericCell::Missing;
    };
    let trimmed = raw.trim();
    if is_placeholder(trimmed) {
        return NumericCell::Missing;
    }

    let cleaned: String = trimmed
        .trim_end_matches('%')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{A0}' && *c != '\u{202F}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();

    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => NumericCell::Number(v),
        _ => NumericCell::Invalid(raw.to_string()),
    }
}

/// Parse a length-of-stay cell, accepting "hh:mm" as well as decimal hours
pub fn parse_duration_hours(cell: Option<&str>) -> NumericCell {
    let Some(raw) = cell else {
        return NumericCell::Missing;
    };
    let trimmed = raw.trim();
    if let Some((hours, minutes)) = trimmed.split_once(':') {
        let negative = hours.trim_start().starts_with('-');
        return match (hours.trim().trim_start_matches('-').parse::<u32>(), minutes.trim().parse::<u32>()) {
            (Ok(h), Ok(m)) if m < 60 => {
                let value = h as f64 + m as f64 / 60.0;
                NumericCell::Number(if negative { -value } else { value })
            }
            _ => NumericCell::Invalid(raw.to_string()),
        };
    }
    parse_number(Some(trimmed))
}

/// Parse the `Mise_a_jour` cell
pub fn parse_update_time(cell: Option<&str>, offset: FixedOffset) -> TimestampCell {
    let Some(raw) = cell.map(str::trim).filter(|v| !is_placeholder(v)) else {
        return TimestampCell::Missing;
    };
    if let Some(ts) = parse_full(raw, offset) {
        return TimestampCell::At(ts);
    }
    if let Some(date) = parse_date(raw) {
        return local_to_utc(date.and_time(NaiveTime::MIN), offset)
            .map(TimestampCell::At)
            .unwrap_or_else(|| TimestampCell::Invalid(raw.to_string()));
    }
    TimestampCell::Invalid(raw.to_string())
}

/// Parse the extraction time; a bare time takes its date from `updated`
///
/// A bare time later than `updated` by more than twelve hours belongs to the
/// previous day (extraction just before midnight, publication just after).
pub fn parse_extraction_time(cell: Option<&str>, updated: &TimestampCell, offset: FixedOffset) -> TimestampCell {
    let Some(raw) = cell.map(str::trim).filter(|v| !is_placeholder(v)) else {
        return TimestampCell::Missing;
    };
    if let Some(ts) = parse_full(raw, offset) {
        return TimestampCell::At(ts);
    }
    if let Some(date) = parse_date(raw) {
        return local_to_utc(date.and_time(NaiveTime::MIN), offset)
            .map(TimestampCell::At)
            .unwrap_or_else(|| TimestampCell::Invalid(raw.to_string()));
    }

    let Some(time) = TIME_FORMATS
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(raw, f).ok())
    else {
        return TimestampCell::Invalid(raw.to_string());
    };

    let TimestampCell::At(updated_at) = updated else {
        return TimestampCell::Invalid(raw.to_string());
    };
    let local_update = updated_at.with_timezone(&offset);
    let Some(mut combined) = local_to_utc(local_update.date_naive().and_time(time), offset) else {
        return TimestampCell::Invalid(raw.to_string());
    };
    if combined - *updated_at > Duration::hours(12) {
        combined -= Duration::days(1);
    }
    TimestampCell::At(combined)
}

fn parse_full(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .and_then(|naive| local_to_utc(naive, offset))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
}

fn local_to_utc(naive: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Fixed offset from minutes east of UTC; out-of-range values fall back to UTC
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| {
        tracing::warn!(minutes, "UTC offset out of range, using UTC");
        Utc.fix()
    })
}
