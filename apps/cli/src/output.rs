//! Output formatting utilities

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable, 0 meaning unlimited
pub fn format_limit(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        return "unlimited".to_string();
    }
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Parse a byte count such as `65536`, `512K`, `1.5M` or `2G`
pub fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let (number, multiplier) = match trimmed.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'K' => 1024u64,
                'M' => 1024 * 1024,
                'G' => 1024 * 1024 * 1024,
                'B' => 1,
                _ => return Err(format!("unknown size suffix in '{}'", input)),
            };
            (&trimmed[..idx], multiplier)
        }
        _ => (trimmed, 1),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", input))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid size '{}'", input));
    }
    Ok((value * multiplier as f64).round() as u64)
}
