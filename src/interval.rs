//! Wall-clock helpers. Every comparison downstream of this module works on
//! absolute [`Span`]s, never on bare time-of-day values.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

use crate::model::{Ms, Span};

/// Interpret a naive club-local datetime as unix milliseconds.
pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn from_ms(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Anchor a slot on `date`. An end at or before the start rolls over to the
/// next day (23:00–00:30 ends on `date + 1`).
pub fn normalize(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Option<Span> {
    let start_dt = date.and_time(start);
    let end_date = if end <= start {
        date.checked_add_days(Days::new(1))?
    } else {
        date
    };
    let end_dt = end_date.and_time(end);
    Some(Span::new(to_ms(start_dt), to_ms(end_dt)))
}

/// Fixed-length slots from `open` to `close` on `date`. A close at or before
/// open means the day runs past midnight. A trailing remainder shorter than
/// `step_minutes` is dropped.
pub fn generate_slots(
    date: NaiveDate,
    open: NaiveTime,
    close: NaiveTime,
    step_minutes: u32,
) -> Vec<(NaiveTime, NaiveTime, Span)> {
    let Some(window) = normalize(date, open, close) else {
        return Vec::new();
    };
    if step_minutes == 0 {
        return Vec::new();
    }
    let step = Ms::from(step_minutes) * 60_000;
    let mut slots = Vec::new();
    let mut cursor = window.start;
    while cursor + step <= window.end {
        let span = Span::new(cursor, cursor + step);
        if let (Some(s), Some(e)) = (from_ms(span.start), from_ms(span.end)) {
            slots.push((s.time(), e.time(), span));
        }
        cursor += step;
    }
    slots
}

/// `HH:MM` rendering for wire output.
pub fn format_time(t: NaiveTime) -> String {
    format!("{:02}:{:02}", t.hour(), t.minute())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        parse_time(s).unwrap()
    }

    #[test]
    fn normalize_same_day() {
        let span = normalize(d(2024, 6, 1), t("14:00"), t("15:00")).unwrap();
        assert_eq!(span.duration_ms(), H);
        assert_eq!(from_ms(span.start).unwrap().date(), d(2024, 6, 1));
    }

    #[test]
    fn normalize_crosses_midnight() {
        let span = normalize(d(2024, 6, 1), t("23:00"), t("00:30")).unwrap();
        assert_eq!(span.duration_ms(), H + H / 2);
        let end = from_ms(span.end).unwrap();
        assert_eq!(end.date(), d(2024, 6, 2));
        assert_eq!(end.time(), t("00:30"));
    }

    #[test]
    fn midnight_slot_conflicts_with_next_day_booking() {
        let late = normalize(d(2024, 6, 1), t("23:00"), t("00:30")).unwrap();
        let next_day = normalize(d(2024, 6, 2), t("00:00"), t("01:00")).unwrap();
        assert!(late.overlaps(&next_day));
        let same_day_morning = normalize(d(2024, 6, 1), t("00:00"), t("01:00")).unwrap();
        assert!(!late.overlaps(&same_day_morning));
    }

    #[test]
    fn normalize_equal_times_is_full_day() {
        let span = normalize(d(2024, 6, 1), t("08:00"), t("08:00")).unwrap();
        assert_eq!(span.duration_ms(), 24 * H);
    }

    #[test]
    fn parse_time_formats() {
        assert_eq!(parse_time("09:30"), Some(t("09:30:00")));
        assert_eq!(parse_time(" 09:05 "), NaiveTime::from_hms_opt(9, 5, 0));
        assert!(parse_time("25:00").is_none());
        assert!(parse_time("noon").is_none());
    }

    #[test]
    fn generate_hourly_slots() {
        let slots = generate_slots(d(2024, 6, 1), t("08:00"), t("12:00"), 60);
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].0, t("08:00"));
        assert_eq!(slots[3].1, t("12:00"));
        for pair in slots.windows(2) {
            assert_eq!(pair[0].2.end, pair[1].2.start);
        }
    }

    #[test]
    fn generate_slots_past_midnight() {
        let slots = generate_slots(d(2024, 6, 1), t("22:00"), t("01:00"), 60);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[2].0, t("00:00"));
        assert_eq!(slots[2].1, t("01:00"));
    }

    #[test]
    fn generate_slots_drops_remainder() {
        let slots = generate_slots(d(2024, 6, 1), t("08:00"), t("09:45"), 30);
        assert_eq!(slots.len(), 3);
        assert!(generate_slots(d(2024, 6, 1), t("08:00"), t("09:00"), 0).is_empty());
    }

    #[test]
    fn format_time_pads() {
        assert_eq!(format_time(t("07:05")), "07:05");
    }
}
