use chrono::Utc;

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for records and logs).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Milliseconds since the unix epoch, the unit signal-cli timestamps use.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============== Text Helpers ==============

/// Shorten `s` to at most `max_chars` characters for log lines.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

/// Join labels for list replies ("alice, bob").
pub fn join_labels(labels: &[String]) -> String {
    labels.join(", ")
}
