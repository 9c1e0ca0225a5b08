//! Slot selection for meeting requests.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};

use crate::capabilities::types::Slot;
use crate::config::SchedulingConfig;

/// The availability window to ask the calendar for.
pub fn availability_window(now: DateTime<Utc>, config: &SchedulingConfig) -> Slot {
    let notice = Duration::from_std(config.min_notice).unwrap_or_else(|_| Duration::zero());
    Slot {
        start: now + notice,
        end: now + Duration::days(config.days_ahead.max(1)),
    }
}

/// Round up to the next quarter hour.
fn align(t: DateTime<Utc>) -> DateTime<Utc> {
    let t = t.with_nanosecond(0).unwrap_or(t);
    let t = if t.second() > 0 {
        t + Duration::seconds(i64::from(60 - t.second()))
    } else {
        t
    };
    let rem = t.minute() % 15;
    if rem == 0 {
        t
    } else {
        t + Duration::minutes(i64::from(15 - rem))
    }
}

/// Earliest meeting of `length` inside `free` that starts no earlier than
/// `floor` and lies within weekday business hours.
fn first_fit(
    free: &Slot,
    floor: DateTime<Utc>,
    length: Duration,
    config: &SchedulingConfig,
) -> Option<Slot> {
    let floor = if floor > free.start { align(floor) } else { free.start };
    let mut day = floor.date_naive();
    while day <= free.end.date_naive() {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
            && let Some(open) = day.and_hms_opt(config.business_hours_start, 0, 0)
        {
            let open = open.and_utc();
            let hours_open = config.business_hours_end.saturating_sub(config.business_hours_start);
            let close = open + Duration::hours(i64::from(hours_open));
            let start = floor.max(open);
            if start + length <= close.min(free.end) {
                return Some(Slot {
                    start,
                    end: start + length,
                });
            }
        }
        day = day.succ_opt()?;
    }
    None
}

/// Pick the meeting slot from the calendar's free intervals.
///
/// A candidate lasts the configured meeting length, fits inside one free
/// interval, respects the minimum notice and lies within weekday business
/// hours; inside a long interval the earliest such start is used. The
/// earliest candidate at or after `preferred` wins; without a preference (or
/// when none qualifies) the earliest candidate wins.
pub fn pick_slot(
    free: &[Slot],
    now: DateTime<Utc>,
    preferred: Option<DateTime<Utc>>,
    config: &SchedulingConfig,
) -> Option<Slot> {
    let length = Duration::minutes(config.meeting_duration_minutes.max(1));
    let earliest = availability_window(now, config).start;

    let best_from = |floor: DateTime<Utc>| {
        free.iter()
            .filter_map(|f| first_fit(f, floor, length, config))
            .min_by_key(|s| s.start)
    };

    preferred
        .and_then(|p| best_from(p.max(earliest)))
        .or_else(|| best_from(earliest))
}
