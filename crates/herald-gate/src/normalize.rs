//! Input normalization for identifiers and comprehension answers.
//!
//! Answers are compared after accent, case and whitespace folding. Dates are
//! accepted in any day/month/year permutation, and durations by their digits.

use chrono::{Datelike, NaiveDate};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Identifiers longer than this are rejected before comparison.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Keep ASCII-folded alphanumerics, lowercased. Separators, dots and
/// whitespace in national identifiers are dropped.
pub fn normalize_identifier(value: &str) -> String {
    fold_accents(value)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Decompose and drop combining marks: "Suspensión" becomes "Suspension".
pub fn fold_accents(value: &str) -> String {
    value.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Accent-free, lowercase, punctuation-free text with single spaces.
pub fn normalize_text(value: &str) -> String {
    let folded: String = fold_accents(value)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(|c| c.to_lowercase())
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Every ASCII digit in order.
pub fn extract_digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn expand_year(year: i32) -> i32 {
    if year < 100 {
        2000 + year
    } else {
        year
    }
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(expand_year(year), month, day)
}

/// Every calendar date a free-form answer could mean. Numeric groups are
/// tried as Y-M-D, D-M-Y and M-D-Y; an unbroken run of eight digits as
/// YYYYMMDD or DDMMYYYY.
pub fn candidate_dates(value: &str) -> Vec<NaiveDate> {
    let groups: Vec<&str> = value
        .split(|c: char| !c.is_ascii_digit())
        .filter(|g| !g.is_empty())
        .collect();

    let mut out = Vec::new();
    match groups.as_slice() {
        [a, b, c] => {
            let (Ok(a), Ok(b), Ok(c)) = (a.parse::<u32>(), b.parse::<u32>(), c.parse::<u32>())
            else {
                return out;
            };
            out.extend(ymd(a as i32, b, c));
            out.extend(ymd(c as i32, b, a));
            out.extend(ymd(c as i32, a, b));
        }
        [run] if run.len() == 8 => {
            let n = |range: std::ops::Range<usize>| run[range].parse::<u32>().ok();
            if let (Some(y), Some(m), Some(d)) = (n(0..4), n(4..6), n(6..8)) {
                out.extend(ymd(y as i32, m, d));
            }
            if let (Some(d), Some(m), Some(y)) = (n(0..2), n(2..4), n(4..8)) {
                out.extend(ymd(y as i32, m, d));
            }
        }
        _ => {}
    }
    out.dedup();
    out
}

pub fn date_matches(expected: NaiveDate, answer: &str) -> bool {
    candidate_dates(answer).contains(&expected)
}

/// Day-first rendering used when a date is shown back to the accessor.
pub fn render_date(date: NaiveDate) -> String {
    format!("{:02}/{:02}/{:04}", date.day(), date.month(), date.year())
}
