use chrono::{Datelike, NaiveDate, NaiveTime};

use crate::model::*;

/// Spacing between candidate starts, independent of session length.
/// Short sessions are under-sampled on purpose: a 30-minute class still
/// gets hourly candidates.
pub const SLOT_STEP_MINUTES: u32 = 60;

/// Sunday = 0 … Saturday = 6.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// `date@time` as a UTC instant. Rule timezones are labels only.
pub fn instant_at(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

/// `[00:00, 24:00)` of `date`.
pub fn day_span(date: NaiveDate) -> Span {
    let start = instant_at(date, NaiveTime::MIN);
    Span::new(start, start + 24 * 60 * MINUTE_MS)
}

/// Candidate start instants for `date`, in rule order.
///
/// For every rule on the date's weekday, emits `rule_start + k·step` while the
/// session still ends by `rule_end`. Candidates of different rules are
/// concatenated and may repeat; conflict filtering works on absolute instants
/// so repeats need no special handling.
pub fn compute_candidates(
    date: NaiveDate,
    rules: &[AvailabilityRule],
    duration_minutes: u32,
    step_minutes: u32,
) -> Vec<Ms> {
    if duration_minutes == 0 || step_minutes == 0 {
        return Vec::new();
    }
    let weekday = weekday_index(date);
    let duration = minutes(duration_minutes);
    let step = minutes(step_minutes);

    let mut candidates = Vec::new();
    for rule in rules.iter().filter(|r| r.day_of_week == weekday) {
        let rule_end = instant_at(date, rule.end_time);
        let mut t = instant_at(date, rule.start_time);
        while t + duration <= rule_end {
            candidates.push(t);
            t += step;
        }
    }
    candidates
}
