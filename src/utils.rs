use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the uploaded document bytes.
///
/// This is the cache key for OCR results and the idempotency anchor for
/// re-uploads of the same file.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%d %b %Y",
    "%d %B %Y",
];

/// Parses a statement date in any of the formats banks commonly print.
///
/// ISO is tried first, then day-first, then month-first, so "15/01/2025"
/// resolves as 15 January. Returns `None` rather than an error; callers
/// decide whether a missing date fails the row or the whole statement.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

/// Lowercases, strips punctuation and collapses whitespace so that OCR
/// markdown and extracted descriptions compare on content, not layout.
pub fn canonicalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = true;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        } else if ch == '.' || ch == ',' {
            // Keep number punctuation so amounts survive canonicalization.
            out.push(ch);
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Tokens of a description worth corroborating: canonicalized, at least
/// three characters, number punctuation stripped.
pub fn significant_tokens(description: &str) -> Vec<String> {
    canonicalize_text(description)
        .split_whitespace()
        .map(|token| token.trim_matches(|c| c == '.' || c == ',').to_string())
        .filter(|token| token.len() >= 3)
        .collect()
}

/// Renders the formattings an amount plausibly appears under in OCR text:
/// two decimals, thousands-grouped, and bare integer when whole.
pub fn amount_variants(amount: f64) -> Vec<String> {
    let magnitude = amount.abs();
    let two_decimals = format!("{:.2}", magnitude);
    let mut variants = vec![two_decimals.clone()];

    if let Some((int_part, frac_part)) = two_decimals.split_once('.') {
        let grouped = group_thousands(int_part);
        if grouped != int_part {
            variants.push(format!("{}.{}", grouped, frac_part));
        }
        if frac_part == "00" {
            variants.push(int_part.to_string());
            if grouped != int_part {
                variants.push(grouped);
            }
        }
    }

    variants
}

fn group_thousands(digits: &str) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*ch);
    }
    grouped
}

/// Monetary equality with a sub-cent tolerance.
pub fn amounts_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.005
}

/// Caps provider error bodies before they land in logs or metadata.
pub fn truncate_diagnostic(body: &str) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        return body.to_string();
    }
    let cut = body
        .char_indices()
        .take_while(|(i, _)| *i < MAX)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}...", &body[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable_hex() {
        let first = content_hash(b"statement bytes");
        let second = content_hash(b"statement bytes");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_ne!(first, content_hash(b"other bytes"));
    }

    #[test]
    fn test_parse_flexible_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        assert_eq!(parse_flexible_date("2025-01-15"), Some(expected));
        assert_eq!(parse_flexible_date("15/01/2025"), Some(expected));
        assert_eq!(parse_flexible_date("15 Jan 2025"), Some(expected));
        assert_eq!(parse_flexible_date(" 2025/01/15 "), Some(expected));
        assert_eq!(parse_flexible_date("not a date"), None);
        assert_eq!(parse_flexible_date(""), None);
    }

    #[test]
    fn test_parse_flexible_date_prefers_day_first() {
        // 03/04/2025 is ambiguous; day-first wins.
        let parsed = parse_flexible_date("03/04/2025").unwrap();
        assert_eq!(parsed, NaiveDate::from_ymd_opt(2025, 4, 3).unwrap());
    }

    #[test]
    fn test_canonicalize_text() {
        assert_eq!(
            canonicalize_text("| COFFEE *SHOP*  #42 |"),
            "coffee shop 42"
        );
        assert_eq!(canonicalize_text("Total: 1,234.56"), "total 1,234.56");
    }

    #[test]
    fn test_significant_tokens_drop_short_words() {
        let tokens = significant_tokens("Payment to ACME Ltd of 42");
        assert_eq!(tokens, vec!["payment", "acme", "ltd"]);
    }

    #[test]
    fn test_amount_variants() {
        let variants = amount_variants(1234.5);
        assert!(variants.contains(&"1234.50".to_string()));
        assert!(variants.contains(&"1,234.50".to_string()));

        let variants = amount_variants(-500.0);
        assert!(variants.contains(&"500.00".to_string()));
        assert!(variants.contains(&"500".to_string()));
    }

    #[test]
    fn test_amounts_equal_tolerance() {
        assert!(amounts_equal(10.004, 10.0));
        assert!(!amounts_equal(10.01, 10.0));
    }

    #[test]
    fn test_truncate_diagnostic() {
        let long = "x".repeat(1000);
        let truncated = truncate_diagnostic(&long);
        assert!(truncated.len() < 320);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_diagnostic("short"), "short");
    }
}
