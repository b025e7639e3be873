//! Pure text-to-value conversions for portal cell content. No I/O here;
//! every function tolerates junk input and returns a well-defined absent
//! value instead of an error, because a single missing field must never
//! sink the rest of the record.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static RECORD_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:order|invoice|po|ref)?\s*(?:id|no|number|num|#)\s*[.:#]?\s*#?(\d+)")
        .expect("record number pattern")
});

static LEADING_DIGITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*#?(\d+)").expect("leading digits pattern"));

static DECIMAL_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").expect("decimal shape pattern"));

/// Extracts the portal-assigned record number. Tries the labeled form
/// first ("Order ID: #12345"), then a bare leading digit run. `None`
/// means the row has no usable natural key and should be skipped.
pub fn extract_natural_key(text: &str) -> Option<String> {
    first_match(text, &[&RECORD_NUMBER, &LEADING_DIGITS])
}

/// Applies an ordered list of regex patterns, returning the first capture.
pub fn first_match(text: &str, patterns: &[&Regex]) -> Option<String> {
    patterns.iter().find_map(|pattern| {
        pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    })
}

/// Strips locale formatting from a money amount and returns it as a
/// fixed-precision decimal string. `"$1,234.56"` becomes `"1234.56"`;
/// empty or unparseable input becomes `"0"`.
pub fn parse_currency(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.' || *ch == '-')
        .collect();
    let cleaned = cleaned.trim_start_matches("--").to_string();
    if DECIMAL_SHAPE.is_match(&cleaned) {
        cleaned
    } else {
        "0".to_string()
    }
}

/// Parses a quantity cell, keeping digits and one decimal point, with a
/// zero default on failure.
pub fn parse_quantity(text: &str) -> f64 {
    let cleaned: String = text
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    cleaned.parse().unwrap_or(0.0)
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y", "%d %b %Y", "%b %d, %Y"];

/// Tries the portal date formats in order, midnight UTC on success.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(trimmed, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .and_then(|naive| Utc.from_local_datetime(&naive).single())
    })
}

/// Derives a stable sku from a portal item identifier, or from the item
/// name when the portal exposes none: uppercased, runs of non-alphanumeric
/// characters collapsed to single dashes.
pub fn normalize_sku(identifier: &str, fallback_name: &str) -> String {
    let source = if identifier.trim().is_empty() {
        fallback_name
    } else {
        identifier
    };
    let mut sku = String::with_capacity(source.len());
    let mut last_dash = true;
    for ch in source.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            sku.push(ch.to_ascii_uppercase());
            last_dash = false;
        } else if !last_dash {
            sku.push('-');
            last_dash = true;
        }
    }
    while sku.ends_with('-') {
        sku.pop();
    }
    sku
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn natural_key_labeled_form() {
        assert_eq!(
            extract_natural_key("Order ID: #12345").as_deref(),
            Some("12345")
        );
        assert_eq!(
            extract_natural_key("Invoice No. 887").as_deref(),
            Some("887")
        );
    }

    #[test]
    fn natural_key_leading_digits_fallback() {
        assert_eq!(extract_natural_key("4521 - pending").as_deref(), Some("4521"));
        assert_eq!(extract_natural_key("#300").as_deref(), Some("300"));
    }

    #[test]
    fn natural_key_absent_when_no_digits() {
        assert_eq!(extract_natural_key("draft entry"), None);
        assert_eq!(extract_natural_key(""), None);
    }

    #[test]
    fn currency_strips_locale_formatting() {
        assert_eq!(parse_currency("$1,234.56"), "1234.56");
        assert_eq!(parse_currency("1,000"), "1000");
        assert_eq!(parse_currency("1234"), "1234");
        assert_eq!(parse_currency("-$10.50"), "-10.50");
    }

    #[test]
    fn currency_defaults_to_zero() {
        assert_eq!(parse_currency(""), "0");
        assert_eq!(parse_currency("n/a"), "0");
        assert_eq!(parse_currency("..."), "0");
    }

    #[test]
    fn quantity_strips_noise() {
        assert_eq!(parse_quantity("12 pcs"), 12.0);
        assert_eq!(parse_quantity("x3.5"), 3.5);
        assert_eq!(parse_quantity(""), 0.0);
        assert_eq!(parse_quantity("none"), 0.0);
    }

    #[test]
    fn date_tries_formats_in_order() {
        let iso = parse_date("2026-03-14").expect("iso");
        assert_eq!((iso.year(), iso.month(), iso.day()), (2026, 3, 14));
        let slashed = parse_date("14/03/2026").expect("slashed");
        assert_eq!(slashed.day(), 14);
        assert!(parse_date("someday").is_none());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn sku_normalization() {
        assert_eq!(normalize_sku("ab-123", "ignored"), "AB-123");
        assert_eq!(normalize_sku("", "Blue Widget (large)"), "BLUE-WIDGET-LARGE");
        assert_eq!(normalize_sku("  sku 9 ", ""), "SKU-9");
    }

    #[test]
    fn first_match_walks_fallbacks() {
        let primary = Regex::new(r"total:\s*(\d+)").unwrap();
        let fallback = Regex::new(r"(\d+)").unwrap();
        assert_eq!(
            first_match("total: 42", &[&primary, &fallback]).as_deref(),
            Some("42")
        );
        assert_eq!(
            first_match("abc 7 def", &[&primary, &fallback]).as_deref(),
            Some("7")
        );
        assert_eq!(first_match("nothing", &[&primary, &fallback]), None);
    }
}
