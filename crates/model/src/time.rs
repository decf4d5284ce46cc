use chrono::{SecondsFormat, Utc};

/// Current UTC time as a sortable ISO-8601 string, second precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current UTC time as epoch seconds, for TTL attributes.
pub fn now_epoch() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
