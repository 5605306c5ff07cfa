use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time as fractional unix seconds.
pub fn current_timestamp_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

pub fn validate_url(url: &str) -> Result<(), String> {
    const SCHEMES: [&str; 4] = ["http://", "https://", "rtsp://", "rtsps://"];
    let has_host = SCHEMES
        .iter()
        .any(|s| url.strip_prefix(s).map_or(false, |rest| !rest.is_empty()));
    if has_host {
        Ok(())
    } else {
        Err("URL must start with http://, https://, rtsp:// or rtsps://".to_string())
    }
}

pub fn generate_unique_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
