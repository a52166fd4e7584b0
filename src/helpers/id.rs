use std::time::{SystemTime, UNIX_EPOCH};

pub fn time_id() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

/// Queue id for a request that did not bring its own.
pub fn item_id(spotify_id: &str) -> String {
    let base = if spotify_id.is_empty() { "track" } else { spotify_id };
    format!("{}-{}", base, time_id())
}
