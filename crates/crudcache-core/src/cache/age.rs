use chrono::{DateTime, Utc};

/// Render how long ago `cached_at` was, e.g. "just now", "5m ago", "2h ago".
pub fn age_display(cached_at: DateTime<Utc>) -> String {
    format_age_minutes((Utc::now() - cached_at).num_minutes())
}

fn format_age_minutes(minutes: i64) -> String {
    if minutes < 1 {
        // Negative ages come from clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}
