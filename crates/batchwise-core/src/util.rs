use std::time::{SystemTime, UNIX_EPOCH};

/// Parse a boolean-like environment flag.
/// Accepts common values such as 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read an environment variable and parse it as a boolean flag using [`parse_bool_flag`].
pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| parse_bool_flag(&raw))
}

pub fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Parse a human byte size such as `4096`, `512kb`, `100MB` or `2 GiB`.
/// Returns `None` for malformed input and for zero.
pub fn parse_byte_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let split = trimmed
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '_'))
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    let (number_part, rest) = trimmed.split_at(split);
    let digits: String = number_part.chars().filter(|c| *c != '_').collect();
    if digits.is_empty() {
        return None;
    }
    let base = digits.parse::<u64>().ok()?;
    let multiplier: u64 = match rest.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024u64.pow(2),
        "g" | "gb" | "gib" => 1024u64.pow(3),
        "t" | "tb" | "tib" => 1024u64.pow(4),
        _ => return None,
    };
    base.checked_mul(multiplier).filter(|bytes| *bytes > 0)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
