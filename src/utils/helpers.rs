//! Helper functions

/// Floor used to keep relative differences finite
pub const RELATIVE_EPSILON: f64 = 1e-6;

pub fn format_usd(amount: f64) -> String {
    if amount.abs() >= 1_000_000.0 {
        format!("${:.2}M", amount / 1_000_000.0)
    } else if amount.abs() >= 1_000.0 {
        format!("${:.2}K", amount / 1_000.0)
    } else {
        format!("${:.2}", amount)
    }
}

pub fn format_percentage(fraction: f64) -> String {
    format!("{:.2}%", fraction * 100.0)
}

/// `|a - b| / max(|a|, |b|, eps)`
pub fn relative_difference(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.abs().max(b.abs()).max(RELATIVE_EPSILON)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Truncate text to at most `max_chars` characters on a char boundary
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// First balanced `{ ... }` object embedded in free text. Braces inside
/// JSON strings are ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_difference() {
        assert!((relative_difference(66.0, 60.0) - 6.0 / 66.0).abs() < 1e-12);
        assert_eq!(relative_difference(0.0, 0.0), 0.0);
        assert!((relative_difference(-0.02, 0.02) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
    }

    #[test]
    fn test_excerpt_is_char_safe() {
        assert_eq!(excerpt("héllo", 2), "hé");
    }

    #[test]
    fn test_extract_json_object() {
        let text = "Sure! ```json\n{\"a\": {\"b\": \"}\"}, \"c\": 1}\n``` done {\"x\": 2}";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": \"}\"}, \"c\": 1}"));
        assert_eq!(extract_json_object("no object here"), None);
        assert_eq!(extract_json_object("{ unterminated"), None);
    }

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(1_500.0), "$1.50K");
        assert_eq!(format_usd(-12.5), "$-12.50");
    }
}
