//! Display helpers for command output.

use chrono::Duration;

/// Human-readable time until a token expires, e.g. "in 12m" or "expired 3h ago".
pub fn format_expiry(remaining: Duration) -> String {
    let minutes = remaining.num_minutes();
    if remaining <= Duration::zero() {
        format!("expired {} ago", format_span(-minutes))
    } else if minutes < 1 {
        format!("in {}s", remaining.num_seconds())
    } else {
        format!("in {}", format_span(minutes))
    }
}

fn format_span(minutes: i64) -> String {
    if minutes < 1 {
        "moments".to_string()
    } else if minutes < 60 {
        format!("{}m", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        let remaining_mins = minutes % 60;
        if remaining_mins == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h {}m", hours, remaining_mins)
        }
    } else {
        format!("{}d", minutes / 1440)
    }
}

/// Pretty-print a JSON body, or return it unchanged if it is not JSON.
pub fn pretty_body(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_expiry() {
        assert_eq!(format_expiry(Duration::seconds(42)), "in 42s");
        assert_eq!(format_expiry(Duration::minutes(12)), "in 12m");
        assert_eq!(format_expiry(Duration::minutes(60)), "in 1h");
        assert_eq!(format_expiry(Duration::minutes(90)), "in 1h 30m");
        assert_eq!(format_expiry(Duration::days(3)), "in 3d");
        assert_eq!(format_expiry(Duration::minutes(-180)), "expired 3h ago");
        assert_eq!(format_expiry(Duration::seconds(-10)), "expired moments ago");
    }

    #[test]
    fn test_pretty_body() {
        assert_eq!(pretty_body(r#"{"a":1}"#), "{\n  \"a\": 1\n}");
        assert_eq!(pretty_body("plain text"), "plain text");
    }
}
