use chrono::{DateTime, Local, TimeZone, Utc};

/// Current wall-clock time as a UNIX timestamp in seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Render a UNIX timestamp for log lines and the inspection tool.
pub fn ts_to_string(ts: i64) -> String {
    match Local.timestamp_opt(ts, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => format!("@{ts}"),
    }
}

/// Timestamp fragment used in set ids and archive filenames.
pub fn timestamp_fragment(now: DateTime<Local>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// Human-readable byte size, `B` through `PB`.
pub fn format_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}

/// Parse a size string such as `"512k"`, `"64m"`, `"1g"` or a bare byte
/// count. Case-insensitive, trailing `b` tolerated (`"1gb"`).
pub fn parse_size_bytes(input: &str) -> Option<u64> {
    let cleaned = input.trim().to_ascii_lowercase();
    if cleaned.is_empty() {
        return None;
    }
    let stripped = cleaned.strip_suffix('b').unwrap_or(&cleaned);
    let (digits, multiplier) = match stripped.chars().last()? {
        'k' => (&stripped[..stripped.len() - 1], 1u64 << 10),
        'm' => (&stripped[..stripped.len() - 1], 1u64 << 20),
        'g' => (&stripped[..stripped.len() - 1], 1u64 << 30),
        't' => (&stripped[..stripped.len() - 1], 1u64 << 40),
        '0'..='9' => (stripped, 1u64),
        _ => return None,
    };
    let value: u64 = digits.trim().parse().ok()?;
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_ladder() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size_bytes("512k"), Some(512 * 1024));
        assert_eq!(parse_size_bytes("64M"), Some(64 * 1024 * 1024));
        assert_eq!(parse_size_bytes("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size_bytes("1GB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size_bytes("12345"), Some(12345));
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert_eq!(parse_size_bytes(""), None);
        assert_eq!(parse_size_bytes("abc"), None);
        assert_eq!(parse_size_bytes("g"), None);
    }
}
