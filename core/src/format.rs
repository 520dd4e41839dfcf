use std::sync::OnceLock;

use regex::Regex;
use reqwest::StatusCode;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Human readable size; `0` renders as `...` (unknown yet).
pub fn size_format(size: u64) -> String {
    if size == 0 {
        "...".to_string()
    } else if size < KB {
        format!("{} bytes", size)
    } else if size < MB {
        format!("{} KB", (size as f64 / KB as f64).round() as u64)
    } else if size < GB {
        format!("{:.1} MB", size as f64 / MB as f64)
    } else {
        format!("{:.2} GB", size as f64 / GB as f64)
    }
}

/// Human readable duration; `None` or a negative value renders as `...`.
pub fn time_format(seconds: Option<f64>) -> String {
    let Some(t) = seconds.filter(|t| *t >= 0.0) else {
        return "...".to_string();
    };
    if t <= 60.0 {
        format!("{} seconds", t.round() as u64)
    } else if t <= 3_600.0 {
        format!("{} minutes", (t / 60.0).round() as u64)
    } else if t <= 86_400.0 {
        format!("{:.1} hours", t / 3_600.0)
    } else if t <= 2_592_000.0 {
        format!("{:.1} days", t / 86_400.0)
    } else if t <= 31_536_000.0 {
        format!("{:.1} months", t / 2_592_000.0)
    } else {
        format!("{:.1} years", t / 31_536_000.0)
    }
}

fn bytes_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)([kmgtpezy]\S*)?$").expect("static byte pattern")
    })
}

/// Parses quantities such as `536.71KiB` or `31.5 mb` (binary multiples).
/// Returns 0 for anything it cannot read.
pub fn parse_bytes(text: &str) -> u64 {
    let text = text.replace(' ', "").to_lowercase();
    let Some(captures) = bytes_pattern().captures(&text) else {
        return 0;
    };
    let Ok(number) = captures[1].parse::<f64>() else {
        return 0;
    };
    let exponent = captures
        .get(2)
        .and_then(|unit| unit.as_str().chars().next())
        .and_then(|unit| "kmgtpezy".find(unit))
        .map(|index| index as i32 + 1)
        .unwrap_or(0);
    (number * 1024f64.powi(exponent)).round() as u64
}

/// snake_case name of an HTTP status code, e.g. `206` -> `partial_content`.
pub fn status_name(code: u16) -> String {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .map(|reason| {
            reason
                .to_lowercase()
                .replace('\'', "")
                .replace([' ', '-'], "_")
        })
        .unwrap_or_else(|| " ".to_string())
}
