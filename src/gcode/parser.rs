// src/gcode/parser.rs - Request line helpers: comments, keywords and parameters
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static QUOTED_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|\s)([A-Za-z_][A-Za-z0-9_]*)="((?:\\.|[^"\\])*)""#).expect("valid quoted parameter regex")
});
static UNQUOTED_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)([A-Za-z_][A-Za-z0-9_]*)=(\S*)").expect("valid parameter regex")
});
static ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\(.)").expect("valid escape regex"));

/// Drops a trailing `;` comment and surrounding whitespace.
pub fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => line[..idx].trim(),
        None => line.trim(),
    }
}

/// First whitespace-delimited token, uppercased.
pub fn keyword(line: &str) -> Option<String> {
    line.split_whitespace().next().map(|token| token.to_ascii_uppercase())
}

/// Everything after the keyword.
pub fn arguments(line: &str) -> &str {
    let line = line.trim_start();
    match line.find(char::is_whitespace) {
        Some(idx) => line[idx..].trim(),
        None => "",
    }
}

/// Parses `KEY=value` and `KEY="quoted value"` pairs. Quoted values are matched
/// first (with backslash escapes), unquoted ones only fill keys not already
/// captured. Keys are lower-cased.
pub fn parse_params(line: &str) -> BTreeMap<String, String> {
    let args = arguments(line);
    let mut params = BTreeMap::new();
    let mut remainder = args.to_string();

    for caps in QUOTED_PARAM_RE.captures_iter(args) {
        let key = caps[1].to_ascii_lowercase();
        let value = ESCAPE_RE.replace_all(&caps[2], "$1").into_owned();
        params.entry(key).or_insert(value);
        if let Some(whole) = caps.get(0) {
            let blank = " ".repeat(whole.len());
            remainder.replace_range(whole.range(), &blank);
        }
    }

    for caps in UNQUOTED_PARAM_RE.captures_iter(&remainder) {
        let key = caps[1].to_ascii_lowercase();
        params.entry(key).or_insert_with(|| caps[2].to_string());
    }
    params
}

/// Letter-prefixed numeric words after the keyword, e.g. `X10.5 F3000`.
pub fn letter_params(line: &str) -> BTreeMap<char, f64> {
    let mut params = BTreeMap::new();
    for token in strip_comment(line).split_whitespace().skip(1) {
        let mut chars = token.chars();
        let Some(letter) = chars.next() else { continue };
        if !letter.is_ascii_alphabetic() {
            continue;
        }
        if let Ok(value) = chars.as_str().parse::<f64>() {
            params.insert(letter.to_ascii_uppercase(), value);
        }
    }
    params
}

/// Letters present after the keyword, with or without a value (`G28 X Y`).
pub fn letter_flags(line: &str) -> Vec<char> {
    strip_comment(line)
        .split_whitespace()
        .skip(1)
        .filter_map(|token| token.chars().next())
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Formats a number without trailing zeros, as sent on the wire.
pub fn format_number(value: f64) -> String {
    let text = format!("{value:.4}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" { "0".to_string() } else { text.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_compile() {
        for pattern in [&QUOTED_PARAM_RE, &UNQUOTED_PARAM_RE, &ESCAPE_RE] {
            LazyLock::force(pattern);
        }
    }

    #[test]
    fn strips_comments_and_whitespace() {
        assert_eq!(strip_comment("  G1 X10 ; move\r"), "G1 X10");
        assert_eq!(strip_comment("; only a comment"), "");
        assert_eq!(strip_comment("M105"), "M105");
    }

    #[test]
    fn keyword_is_uppercased_first_token() {
        assert_eq!(keyword("pause now").as_deref(), Some("PAUSE"));
        assert_eq!(keyword("   "), None);
        assert_eq!(arguments("SET_GCODE_VARIABLE MACRO=a  VARIABLE=b"), "MACRO=a  VARIABLE=b");
        assert_eq!(arguments("G28"), "");
    }

    #[test]
    fn quoted_params_win_over_unquoted_scan() {
        let params = parse_params(r#"M117 MSG="hello B=2 \"there\"" B=3 Speed=50"#);
        assert_eq!(params["msg"], r#"hello B=2 "there""#);
        assert_eq!(params["b"], "3");
        assert_eq!(params["speed"], "50");
    }

    #[test]
    fn first_occurrence_of_a_key_is_kept() {
        let params = parse_params("FOO X=1 x=2");
        assert_eq!(params.len(), 1);
        assert_eq!(params["x"], "1");
    }

    #[test]
    fn letter_words_are_parsed() {
        let params = letter_params("G1 X10.5 y-2 F3000 ; comment E9");
        assert_eq!(params[&'X'], 10.5);
        assert_eq!(params[&'Y'], -2.0);
        assert_eq!(params[&'F'], 3000.0);
        assert!(!params.contains_key(&'E'));
        assert_eq!(letter_flags("G28 X Y"), vec!['X', 'Y']);
    }

    #[test]
    fn numbers_are_trimmed() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(1500.5), "1500.5");
        assert_eq!(format_number(-0.00001), "0");
        assert_eq!(format_number(0.12345), "0.1235");
    }
}
