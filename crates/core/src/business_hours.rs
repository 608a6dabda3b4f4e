//! Business-hour arithmetic for SLA deadlines and expiry windows.
//!
//! The work window runs 09:00–18:00 with a 12:00–13:00 lunch break, skipping
//! weekends and calendar-provided holidays. Each full working day therefore
//! contributes 8 × 3600 = 28 800 seconds. Deadlines are computed in the
//! business timezone on naive timestamps; the engine converts from UTC at the
//! boundary.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

/// Holiday feed, injected so the engine never blocks on an external calendar.
pub trait HolidayCalendar: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// Static holiday set loaded at startup.
#[derive(Clone, Debug, Default)]
pub struct FixedHolidayCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl FixedHolidayCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self { holidays: holidays.into_iter().collect() }
    }
}

impl HolidayCalendar for FixedHolidayCalendar {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }
}

pub const SECONDS_PER_WORK_DAY: i64 = 28_800;

fn work_start() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
}

fn work_end() -> NaiveTime {
    NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default()
}

fn lunch_start() -> NaiveTime {
    NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default()
}

fn lunch_end() -> NaiveTime {
    NaiveTime::from_hms_opt(13, 0, 0).unwrap_or_default()
}

pub fn is_work_day(calendar: &dyn HolidayCalendar, date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !calendar.is_holiday(date)
}

fn next_work_day(calendar: &dyn HolidayCalendar, mut date: NaiveDate) -> NaiveDate {
    loop {
        date += Duration::days(1);
        if is_work_day(calendar, date) {
            return date;
        }
    }
}

/// Moves the cursor to the next moment at which work can proceed.
fn align(calendar: &dyn HolidayCalendar, cursor: NaiveDateTime) -> NaiveDateTime {
    let date = cursor.date();
    if !is_work_day(calendar, date) || cursor.time() >= work_end() {
        return next_work_day(calendar, date).and_time(work_start());
    }
    if cursor.time() < work_start() {
        return date.and_time(work_start());
    }
    if cursor.time() >= lunch_start() && cursor.time() < lunch_end() {
        return date.and_time(lunch_end());
    }
    cursor
}

/// Working seconds left in the cursor's day, cursor already aligned.
fn available_today(cursor: NaiveDateTime) -> i64 {
    let time = cursor.time();
    if time < lunch_start() {
        (lunch_start() - time).num_seconds() + (work_end() - lunch_end()).num_seconds()
    } else {
        (work_end() - time).num_seconds()
    }
}

/// Advances within one day, jumping over lunch when crossed. `seconds` must
/// fit in the day.
fn advance_within_day(cursor: NaiveDateTime, seconds: i64) -> NaiveDateTime {
    let time = cursor.time();
    if time < lunch_start() {
        let until_lunch = (lunch_start() - time).num_seconds();
        if seconds <= until_lunch {
            return cursor + Duration::seconds(seconds);
        }
        return cursor.date().and_time(lunch_end()) + Duration::seconds(seconds - until_lunch);
    }
    cursor + Duration::seconds(seconds)
}

/// The deadline reached by consuming `seconds` of working time from `start`.
pub fn add_business_seconds(
    calendar: &dyn HolidayCalendar,
    start: NaiveDateTime,
    seconds: i64,
) -> NaiveDateTime {
    let mut cursor = align(calendar, start);
    let mut remaining = seconds.max(0);

    loop {
        let available = available_today(cursor);
        if remaining <= available {
            return advance_within_day(cursor, remaining);
        }
        remaining -= available;
        cursor = next_work_day(calendar, cursor.date()).and_time(work_start());
    }
}

/// Whole business days elapsed between two dates (exclusive of `from`,
/// inclusive of `to`). Drives the expiry window.
pub fn business_days_between(calendar: &dyn HolidayCalendar, from: NaiveDate, to: NaiveDate) -> i64 {
    if to <= from {
        return 0;
    }
    let mut days = 0;
    let mut cursor = from;
    while cursor < to {
        cursor += Duration::days(1);
        if is_work_day(calendar, cursor) {
            days += 1;
        }
    }
    days
}
