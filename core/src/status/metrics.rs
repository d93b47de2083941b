// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Metrics aggregation-on-read.
//!
//! History tables keep raw per-probe samples; reads down-sample to a
//! bounded point count by bucketing time and averaging each field within
//! the bucket. RTT extremes are preserved when requested.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::repository::models::{BandwidthSample, DeviceMetricsSample};

/// Down-sampled resource metrics point
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMetricsPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub ping_rtt_ms: Option<f64>,
    pub uptime_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_ping_rtt_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ping_rtt_ms: Option<f64>,
}

/// Down-sampled bandwidth point
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedBandwidthPoint {
    pub timestamp: DateTime<Utc>,
    pub in_bits_per_sec: f64,
    pub out_bits_per_sec: f64,
    pub utilisation_percent: f64,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Bucket width so that at most `max_points` buckets cover the span.
/// One extra millisecond keeps the last sample off the final boundary.
fn bucket_width(span: Duration, max_points: usize) -> Duration {
    let max_points = max_points.max(1) as i64;
    let millis = (span.num_milliseconds() / max_points + 1).max(1);
    Duration::milliseconds(millis)
}

/// Down-sample device metrics to at most `max_points` bucket means.
///
/// `samples` must be sorted by timestamp (repositories return them in
/// append order). `with_extremes` adds per-bucket RTT min/max.
pub fn aggregate_metrics(
    samples: &[DeviceMetricsSample],
    max_points: usize,
    with_extremes: bool,
) -> Vec<AggregatedMetricsPoint> {
    if samples.is_empty() {
        return Vec::new();
    }
    if samples.len() <= max_points {
        return samples
            .iter()
            .map(|s| AggregatedMetricsPoint {
                timestamp: s.timestamp,
                cpu_percent: s.cpu_percent,
                memory_percent: s.memory_percent,
                disk_percent: s.disk_percent,
                ping_rtt_ms: s.ping_rtt_ms,
                uptime_seconds: s.uptime_seconds,
                min_ping_rtt_ms: if with_extremes { s.ping_rtt_ms } else { None },
                max_ping_rtt_ms: if with_extremes { s.ping_rtt_ms } else { None },
            })
            .collect();
    }

    let start = samples.first().unwrap().timestamp;
    let end = samples.last().unwrap().timestamp;
    let width = bucket_width(end - start, max_points);

    let mut points = Vec::new();
    let mut bucket_start = start;
    let mut index = 0;
    while index < samples.len() {
        let bucket_end = bucket_start + width;
        let mut cpu = Vec::new();
        let mut memory = Vec::new();
        let mut disk = Vec::new();
        let mut rtt = Vec::new();
        let mut uptime = None;
        while index < samples.len() && samples[index].timestamp < bucket_end {
            let s = &samples[index];
            if let Some(v) = s.cpu_percent {
                cpu.push(v);
            }
            if let Some(v) = s.memory_percent {
                memory.push(v);
            }
            if let Some(v) = s.disk_percent {
                disk.push(v);
            }
            if let Some(v) = s.ping_rtt_ms {
                rtt.push(v);
            }
            if s.uptime_seconds.is_some() {
                uptime = s.uptime_seconds;
            }
            index += 1;
        }
        if !(cpu.is_empty() && memory.is_empty() && disk.is_empty() && rtt.is_empty() && uptime.is_none())
        {
            points.push(AggregatedMetricsPoint {
                timestamp: bucket_start,
                cpu_percent: mean(&cpu),
                memory_percent: mean(&memory),
                disk_percent: mean(&disk),
                ping_rtt_ms: mean(&rtt),
                uptime_seconds: uptime,
                min_ping_rtt_ms: if with_extremes {
                    rtt.iter().copied().reduce(f64::min)
                } else {
                    None
                },
                max_ping_rtt_ms: if with_extremes {
                    rtt.iter().copied().reduce(f64::max)
                } else {
                    None
                },
            });
        }
        bucket_start = bucket_end;
    }
    points
}

/// Down-sample bandwidth history to at most `max_points` bucket means.
pub fn aggregate_bandwidth(
    samples: &[BandwidthSample],
    max_points: usize,
) -> Vec<AggregatedBandwidthPoint> {
    if samples.is_empty() {
        return Vec::new();
    }
    if samples.len() <= max_points {
        return samples
            .iter()
            .map(|s| AggregatedBandwidthPoint {
                timestamp: s.timestamp,
                in_bits_per_sec: s.in_bits_per_sec,
                out_bits_per_sec: s.out_bits_per_sec,
                utilisation_percent: s.utilisation_percent,
            })
            .collect();
    }

    let start = samples.first().unwrap().timestamp;
    let end = samples.last().unwrap().timestamp;
    let width = bucket_width(end - start, max_points);

    let mut points = Vec::new();
    let mut bucket_start = start;
    let mut index = 0;
    while index < samples.len() {
        let bucket_end = bucket_start + width;
        let mut in_bps = Vec::new();
        let mut out_bps = Vec::new();
        let mut util = Vec::new();
        while index < samples.len() && samples[index].timestamp < bucket_end {
            in_bps.push(samples[index].in_bits_per_sec);
            out_bps.push(samples[index].out_bits_per_sec);
            util.push(samples[index].utilisation_percent);
            index += 1;
        }
        if let (Some(in_bps), Some(out_bps), Some(util)) =
            (mean(&in_bps), mean(&out_bps), mean(&util))
        {
            points.push(AggregatedBandwidthPoint {
                timestamp: bucket_start,
                in_bits_per_sec: in_bps,
                out_bits_per_sec: out_bps,
                utilisation_percent: util,
            });
        }
        bucket_start = bucket_end;
    }
    points
}
