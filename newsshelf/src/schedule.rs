use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

/// Next wall-clock run strictly after `now`, given daily run times in UTC.
/// Returns `None` when no times are configured.
pub fn next_run_after(now: DateTime<Utc>, times: &[NaiveTime]) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let tomorrow = today + Duration::days(1);

    [today, tomorrow]
        .iter()
        .flat_map(|day| times.iter().map(move |t| day.and_time(*t)))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .filter(|candidate| *candidate > now)
        .min()
}

/// How long to sleep until the next run, never negative.
pub fn delay_until_next(now: DateTime<Utc>, times: &[NaiveTime]) -> Option<std::time::Duration> {
    next_run_after(now, times).map(|next| (next - now).to_std().unwrap_or_default())
}
