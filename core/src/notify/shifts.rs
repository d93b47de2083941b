// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! On-duty shift resolution.
//!
//! Shifts carry a start/end local time and a fixed UTC offset. Membership
//! is closed-start, open-end; ranges may straddle midnight. A timestamp
//! belongs to at most one shift: day is checked first.

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use uuid::Uuid;

use crate::repository::models::{OnDutyConfig, Shift};

/// Which shift matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Day,
    Night,
}

impl ShiftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Night => "night",
        }
    }
}

/// Resolve the shift covering `now`, if any.
pub fn current_shift(config: &OnDutyConfig, now: DateTime<Utc>) -> Option<(ShiftKind, &Shift)> {
    if shift_contains(&config.day, now) {
        return Some((ShiftKind::Day, &config.day));
    }
    if shift_contains(&config.night, now) {
        return Some((ShiftKind::Night, &config.night));
    }
    None
}

/// Users on duty at `now`.
pub fn on_duty_users(config: &OnDutyConfig, now: DateTime<Utc>) -> Vec<Uuid> {
    current_shift(config, now)
        .map(|(_, shift)| shift.user_ids.clone())
        .unwrap_or_default()
}

/// Closed-start, open-end membership in the shift's own timezone.
pub fn shift_contains(shift: &Shift, now: DateTime<Utc>) -> bool {
    let Some(offset) = parse_offset(&shift.timezone) else {
        return false;
    };
    let local_time = now.with_timezone(&offset).time();
    contains(shift.start_time, shift.end_time, local_time)
}

fn contains(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        // Straddles midnight.
        t >= start || t < end
    }
}

/// Parse `"+02:00"`, `"-0530"`, `"Z"` or `"UTC"` into a fixed offset.
pub fn parse_offset(text: &str) -> Option<FixedOffset> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("z") || text.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = if let Some(rest) = text.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = text.strip_prefix('-') {
        (-1, rest)
    } else {
        return None;
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    let (hours, minutes): (i32, i32) = match digits.len() {
        2 => (digits.parse().ok()?, 0),
        4 => (digits[..2].parse().ok()?, digits[2..].parse().ok()?),
        _ => return None,
    };
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn shift(start: (u32, u32), end: (u32, u32), tz: &str, users: usize) -> Shift {
        Shift {
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            timezone: tz.to_string(),
            user_ids: (0..users).map(|_| Uuid::new_v4()).collect(),
        }
    }

    fn config() -> OnDutyConfig {
        OnDutyConfig {
            day: shift((8, 0), (20, 0), "UTC", 2),
            night: shift((20, 0), (8, 0), "UTC", 1),
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, h, m, 0).unwrap()
    }

    #[test]
    fn test_every_hour_belongs_to_exactly_one_shift() {
        let config = config();
        for hour in 0..24 {
            let now = at(hour, 30);
            let day = shift_contains(&config.day, now);
            let night = shift_contains(&config.night, now);
            assert!(day ^ night, "hour {hour}: day={day} night={night}");
        }
    }

    #[test]
    fn test_closed_start_open_end() {
        let config = config();
        // 08:00 exactly: day begins (closed start), night has ended (open end).
        let (kind, _) = current_shift(&config, at(8, 0)).unwrap();
        assert_eq!(kind, ShiftKind::Day);
        // 20:00 exactly: night begins.
        let (kind, _) = current_shift(&config, at(20, 0)).unwrap();
        assert_eq!(kind, ShiftKind::Night);
    }

    #[test]
    fn test_midnight_straddle() {
        let config = config();
        let (kind, _) = current_shift(&config, at(2, 0)).unwrap();
        assert_eq!(kind, ShiftKind::Night);
        let (kind, _) = current_shift(&config, at(23, 59)).unwrap();
        assert_eq!(kind, ShiftKind::Night);
    }

    #[test]
    fn test_timezone_offset_applies() {
        // 18:00 UTC is 20:00 at +02:00, so a +02:00 day shift ending at
        // 20:00 has just closed.
        let day = shift((8, 0), (20, 0), "+02:00", 1);
        assert!(!shift_contains(&day, at(18, 0)));
        assert!(shift_contains(&day, at(17, 59)));
    }

    #[test]
    fn test_parse_offset_forms() {
        assert_eq!(parse_offset("Z"), FixedOffset::east_opt(0));
        assert_eq!(parse_offset("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_offset("+02:00"), FixedOffset::east_opt(7200));
        assert_eq!(parse_offset("-0530"), FixedOffset::east_opt(-(5 * 3600 + 30 * 60)));
        assert_eq!(parse_offset("+02"), FixedOffset::east_opt(7200));
        assert!(parse_offset("sideways").is_none());
        assert!(parse_offset("+25:00").is_none());
    }

    #[test]
    fn test_on_duty_users() {
        let config = config();
        assert_eq!(on_duty_users(&config, at(12, 0)).len(), 2);
        assert_eq!(on_duty_users(&config, at(3, 0)).len(), 1);
    }
}
