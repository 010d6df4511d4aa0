//! Conversions from raw CSV cell text into typed values.
//!
//! Everything here is pure: no I/O, no clock reads except in [`parse_date`],
//! which resolves two-digit years against the current calendar year.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use rust_decimal::Decimal;

/// Default two-digit-year pivot: `YY` maps to the current century unless that
/// lands more than this many years in the future.
pub const DEFAULT_PIVOT: i32 = 20;

/// Layouts with an unambiguous four-digit year, tried first.
const FOUR_DIGIT_DATE_LAYOUTS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%Y/%m/%d",
    "%m-%d-%Y",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%Y%m%d",
];

const FOUR_DIGIT_DATETIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

/// Two-digit-year layouts; the century is fixed up by [`apply_pivot`].
const TWO_DIGIT_DATE_LAYOUTS: &[&str] = &["%m/%d/%y", "%m-%d-%y", "%d-%b-%y"];

const TWO_DIGIT_DATETIME_LAYOUTS: &[&str] = &["%m/%d/%y %H:%M:%S", "%m/%d/%y %H:%M"];

const NUMERIC_PATTERN: &str = r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$";

static NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(NUMERIC_PATTERN).expect("valid numeric regex"));

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£'];

// ---------------------------------------------------------------------------
// Cell cleaning
// ---------------------------------------------------------------------------

/// Normalise a raw cell: trim, drop a spreadsheet formula wrapper (`="..."` or
/// a bare leading `=`), strip one layer of surrounding quotes and a literal
/// `netsuite:` prefix.
pub fn clean_cell(raw: &str) -> String {
    let mut s = raw.trim();

    if let Some(inner) = s.strip_prefix("=\"").and_then(|r| r.strip_suffix('"')) {
        s = inner;
    } else if let Some(rest) = s.strip_prefix('=') {
        s = rest;
    }

    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s = &s[1..s.len() - 1];
    }

    if let Some(rest) = s.strip_prefix("netsuite:") {
        s = rest;
    }

    s.trim().to_string()
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Parse a date using the default pivot and the current UTC year.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    parse_date_with_pivot(raw, DEFAULT_PIVOT, Utc::now().year())
}

/// Parse a date, resolving two-digit years relative to `current_year`.
///
/// A two-digit year is placed in the current century; if that is later than
/// `current_year + pivot` it moves to the previous century.
pub fn parse_date_with_pivot(raw: &str, pivot: i32, current_year: i32) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    // chrono's %Y accepts short years, so "01/15/25" would become year 25.
    // Only keep four-digit-layout matches that really carry four digits.
    let four_digit = FOUR_DIGIT_DATE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDate::parse_from_str(s, layout).ok())
        .or_else(|| {
            FOUR_DIGIT_DATETIME_LAYOUTS
                .iter()
                .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
                .map(|dt| dt.date())
        })
        .filter(|d| d.year() >= 1000);
    if four_digit.is_some() {
        return four_digit;
    }

    TWO_DIGIT_DATE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDate::parse_from_str(s, layout).ok())
        .or_else(|| {
            TWO_DIGIT_DATETIME_LAYOUTS
                .iter()
                .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
                .map(|dt| dt.date())
        })
        .and_then(|d| apply_pivot(d, pivot, current_year))
}

fn apply_pivot(date: NaiveDate, pivot: i32, current_year: i32) -> Option<NaiveDate> {
    let yy = date.year().rem_euclid(100);
    let century = current_year - current_year.rem_euclid(100);
    let mut year = century + yy;
    if year > current_year + pivot {
        year -= 100;
    }
    date.with_year(year)
}

// ---------------------------------------------------------------------------
// Numerics
// ---------------------------------------------------------------------------

/// Parse a numeric cell into a [`Decimal`].
///
/// Currency symbols and thousands separators are ignored and `(123.45)` is read
/// as an accounting negative. Exponent notation passes the shape check but is
/// refused before decoding, so `"1.5e10"` yields `None`.
pub fn parse_numeric(raw: &str) -> Option<Decimal> {
    let mut s = raw.trim();
    let mut negate = false;

    if let Some(inner) = s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        negate = true;
        s = inner.trim();
    }

    let cleaned: String = s
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c) && *c != ',' && !c.is_whitespace())
        .collect();

    if !NUMERIC_RE.is_match(&cleaned) {
        return None;
    }

    if cleaned.contains(['e', 'E']) {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negate { -value } else { value })
}

// ---------------------------------------------------------------------------
// Booleans
// ---------------------------------------------------------------------------

/// Parse a boolean cell. Anything outside the accepted spellings is `None`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
