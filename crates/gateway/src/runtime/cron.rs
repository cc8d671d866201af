//! 5-field cron evaluator (min hour dom month dow), UTC.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    // */N steps.
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Whether `expr` is a syntactically plausible 5-field expression.
pub fn cron_is_valid(expr: &str) -> bool {
    expr.split_whitespace().count() == 5
}

pub fn cron_matches(expr: &str, dt: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Next occurrence strictly after `after`, scanning at most one year of
/// minutes.
pub fn cron_next(expr: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !cron_is_valid(expr) {
        return None;
    }
    let mut candidate = (*after + Duration::seconds(60 - after.second() as i64))
        .with_second(0)
        .unwrap_or(*after);
    let max_checks = 366 * 24 * 60;
    for _ in 0..max_checks {
        if cron_matches(expr, &candidate) {
            return Some(candidate);
        }
        candidate += Duration::minutes(1);
    }
    None
}
