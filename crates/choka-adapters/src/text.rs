//! Text normalization shared by the source parsers.

use std::sync::OnceLock;

use regex::Regex;

/// Upstream marker for a forecast slot without a value.
pub const NO_DATA: &str = "--";

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn wave_height_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(\d+(?:\s*\.\s*\d+)?)\s*メートル")
}

fn clock_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\d{1,2}:\d{2}")
}

fn parenthetical_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"[（(][^）)]*(?:[）)]|$)")
}

fn report_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日")
}

/// Map fullwidth digits, period, colon and space to their ASCII forms.
pub fn normalize_fullwidth(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            '．' => '.',
            '：' => ':',
            '　' => ' ',
            _ => c,
        })
        .collect()
}

pub fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// First number followed by the meters marker, e.g. `１．５メートル　後　１メートル` -> 1.5.
/// Text without a match yields 0.0.
pub fn parse_wave_height(text: &str) -> f64 {
    let normalized = normalize_fullwidth(text);
    wave_height_re()
        .captures(&normalized)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .and_then(|number| number.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Max of the numeric probabilities, skipping the no-data marker; 0.0 when nothing is numeric.
pub fn max_precipitation<S: AsRef<str>>(values: &[S]) -> f64 {
    values
        .iter()
        .map(|v| normalize_fullwidth(v.as_ref().trim()))
        .filter(|v| v != NO_DATA)
        .filter_map(|v| v.parse::<f64>().ok())
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
        .unwrap_or(0.0)
}

/// First `H:MM`/`HH:MM` found in a longer descriptive string.
pub fn first_clock_time(text: &str) -> Option<String> {
    let normalized = normalize_fullwidth(text);
    clock_time_re()
        .find(&normalized)
        .map(|m| m.as_str().to_string())
}

/// Remove parenthetical annotations (fullwidth or ASCII), e.g. `マダイ（良型）` -> `マダイ`.
pub fn strip_parenthetical(text: &str) -> String {
    let stripped = parenthetical_re().replace_all(text, "");
    text_or_none(&stripped).unwrap_or_default()
}

/// Year, month and day of the first `YYYY年MM月DD日` in `text`, not yet validated as a date.
pub fn find_report_date(text: &str) -> Option<(i32, u32, u32)> {
    let normalized = normalize_fullwidth(text);
    let caps = report_date_re().captures(&normalized)?;
    let year = caps.get(1)?.as_str().parse().ok()?;
    let month = caps.get(2)?.as_str().parse().ok()?;
    let day = caps.get(3)?.as_str().parse().ok()?;
    Some((year, month, day))
}

/// Bounded prefix of a raw body for log lines.
pub fn snippet(body: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(body);
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out
}
