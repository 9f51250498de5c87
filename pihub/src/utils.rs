use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

/// Returns the current time as milliseconds since Unix epoch.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Reads a millisecond value that may arrive as a JSON number or a numeric string.
pub fn json_ms(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|ms| ms.is_finite() && *ms >= 0.0 && ms.fract() == 0.0)
                .map(|ms| ms as u64)
        }),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

pub fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
