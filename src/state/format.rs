// Human-readable duration and relative-time rendering

use chrono::{DateTime, Utc};

/// Render a millisecond duration as a compact human string.
///
/// Examples: `"45s"`, `"1m 30s"`, `"2h 5m"`.
pub fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Render a timestamp relative to now: `"just now"`, `"5 minutes ago"`,
/// `"3 hours ago"`, `"yesterday"`, `"4 days ago"`.
pub fn format_relative_time(ts: &DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(*ts);
    let secs = elapsed.num_seconds().max(0);

    if secs < 60 {
        "just now".to_string()
    } else if secs < 3600 {
        let minutes = secs / 60;
        if minutes == 1 {
            "1 minute ago".to_string()
        } else {
            format!("{} minutes ago", minutes)
        }
    } else if secs < 86_400 {
        let hours = secs / 3600;
        if hours == 1 {
            "1 hour ago".to_string()
        } else {
            format!("{} hours ago", hours)
        }
    } else {
        let days = secs / 86_400;
        if days == 1 {
            "yesterday".to_string()
        } else {
            format!("{} days ago", days)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(45_000), "45s");
    }

    #[test]
    fn test_format_duration_minutes() {
        assert_eq!(format_duration(90_000), "1m 30s");
        assert_eq!(format_duration(600_000), "10m 0s");
    }

    #[test]
    fn test_format_duration_hours() {
        assert_eq!(format_duration(7_500_000), "2h 5m");
    }

    #[test]
    fn test_relative_time_just_now() {
        assert_eq!(format_relative_time(&Utc::now()), "just now");
    }

    #[test]
    fn test_relative_time_minutes() {
        let ts = Utc::now() - Duration::minutes(5);
        assert_eq!(format_relative_time(&ts), "5 minutes ago");

        let ts = Utc::now() - Duration::minutes(1) - Duration::seconds(5);
        assert_eq!(format_relative_time(&ts), "1 minute ago");
    }

    #[test]
    fn test_relative_time_hours() {
        let ts = Utc::now() - Duration::hours(3);
        assert_eq!(format_relative_time(&ts), "3 hours ago");
    }

    #[test]
    fn test_relative_time_yesterday() {
        let ts = Utc::now() - Duration::days(1) - Duration::hours(2);
        assert_eq!(format_relative_time(&ts), "yesterday");
    }

    #[test]
    fn test_relative_time_days() {
        let ts = Utc::now() - Duration::days(4);
        assert_eq!(format_relative_time(&ts), "4 days ago");
    }
}
