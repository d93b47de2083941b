// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Status segment derivation.
//!
//! Segments are not stored: they are folded out of the event log on read.
//! Given a range, the result is an exact partition of it; time before the
//! first recorded event reads as `unknown`.

use chrono::{DateTime, Utc};

use crate::repository::models::{DeviceStatus, DeviceStatusEvent, StatusSegment};

/// Fold events into contiguous status segments covering [since, until].
///
/// `events` must be the device's full log up to `until`, oldest first --
/// events at or before `since` establish the status the range opens with.
pub fn derive_segments(
    events: &[DeviceStatusEvent],
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<StatusSegment> {
    if since >= until {
        return Vec::new();
    }

    let mut current_status = DeviceStatus::Unknown;
    let mut cursor = since;
    let mut segments = Vec::new();

    for event in events {
        if event.created_at <= since {
            current_status = event.new_status;
            continue;
        }
        if event.created_at > until {
            break;
        }
        if event.created_at > cursor {
            segments.push(StatusSegment {
                status: current_status,
                start: cursor,
                end: event.created_at,
            });
            cursor = event.created_at;
        }
        current_status = event.new_status;
    }

    if cursor < until {
        segments.push(StatusSegment {
            status: current_status,
            start: cursor,
            end: until,
        });
    }
    segments
}

/// Fraction of the range spent online, in [0, 1].
pub fn online_ratio(segments: &[StatusSegment]) -> f64 {
    let total: i64 = segments
        .iter()
        .map(|s| (s.end - s.start).num_milliseconds())
        .sum();
    if total <= 0 {
        return 0.0;
    }
    let online: i64 = segments
        .iter()
        .filter(|s| s.status == DeviceStatus::Online)
        .map(|s| (s.end - s.start).num_milliseconds())
        .sum();
    online as f64 / total as f64
}
