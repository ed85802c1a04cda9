use chrono::{DateTime, TimeZone, Utc};

/// Filename handed to the snapshot sink, e.g. `EdgeViewer_1739871000000.jpg`.
pub fn snapshot_filename(captured_at_ms: i64) -> String {
    format!("EdgeViewer_{captured_at_ms}.jpg")
}

/// Human-readable form of a snapshot timestamp for log lines.
pub fn fmt_ts(ms: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
