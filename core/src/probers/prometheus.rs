// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Prometheus exposition prober.
//!
//! Scrapes `{scheme}://{ip}:{port}/metrics`, parses the text exposition
//! format, and extracts the node_exporter series CoreBit understands plus
//! any user-declared custom metrics. CPU utilisation needs two scrapes
//! (counter deltas), so the prober keeps a per-device snapshot of the CPU
//! second counters between cycles.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use super::error::ProbeError;
use super::types::{CounterBits, CustomMetricReading, InterfaceCounters, ProbeSample};
use super::{remaining, Credentials, Prober, PrometheusCredentials};
use crate::repository::models::{Device, DeviceData};

/// Filesystem types ignored when deriving disk usage
const PSEUDO_FILESYSTEMS: [&str; 5] = ["tmpfs", "devtmpfs", "overlay", "squashfs", "ramfs"];

/// Exporters answer fast; cap a scrape well under the probe deadline.
const SCRAPE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// One parsed sample line
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl Series {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Clone, Copy)]
struct CpuSnapshot {
    idle: f64,
    total: f64,
}

/// Prometheus text-format prober
pub struct PrometheusProber {
    client: reqwest::Client,
    cpu_state: DashMap<Uuid, CpuSnapshot>,
}

impl PrometheusProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            client,
            cpu_state: DashMap::new(),
        }
    }

    /// Fetch and parse one exposition document.
    async fn scrape(
        &self,
        url: &str,
        deadline: Instant,
    ) -> Result<Vec<Series>, ProbeError> {
        let budget = remaining(deadline)?.min(SCRAPE_TIMEOUT);
        let response = self.client.get(url).timeout(budget).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProbeError::Auth(format!("scrape returned {status}")));
        }
        if !status.is_success() {
            return Err(ProbeError::Protocol(format!("scrape returned {status}")));
        }
        let body = response.text().await?;
        Ok(parse_exposition(&body))
    }

    fn cpu_percent(&self, device_id: Uuid, series: &[Series]) -> Option<f64> {
        let mut idle = 0.0;
        let mut total = 0.0;
        let mut seen = false;
        for s in series.iter().filter(|s| s.name == "node_cpu_seconds_total") {
            seen = true;
            total += s.value;
            if s.label("mode") == Some("idle") {
                idle += s.value;
            }
        }
        if !seen {
            return None;
        }

        let current = CpuSnapshot { idle, total };
        let previous = self.cpu_state.insert(device_id, current);
        let previous = previous?;
        let d_total = current.total - previous.total;
        let d_idle = current.idle - previous.idle;
        if d_total <= 0.0 || d_idle < 0.0 {
            return None;
        }
        Some((100.0 * (1.0 - d_idle / d_total)).clamp(0.0, 100.0))
    }
}

impl Default for PrometheusProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for PrometheusProber {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    async fn probe(
        &self,
        device: &Device,
        creds: &Credentials,
        deadline: Instant,
    ) -> Result<ProbeSample, ProbeError> {
        let ip = device
            .ip
            .ok_or_else(|| ProbeError::Credentials("device has no IP address".to_string()))?;
        let creds = PrometheusCredentials::from_bag(creds)?;
        let url = format!("{}://{}:{}/metrics", creds.scheme, ip, creds.port);
        trace!(%url, "scraping");

        let series = self.scrape(&url, deadline).await?;
        let mut sample = ProbeSample::reachable();

        let mut data = DeviceData {
            cpu_percent: self.cpu_percent(device.id, &series),
            ..DeviceData::default()
        };
        data.memory_percent = memory_percent(&series);
        data.disk_percent = disk_percent(&series);
        data.uptime_seconds = uptime_seconds(&series, sample.collected_at.timestamp());
        sample.device_data = Some(data);

        sample.interfaces = network_counters(&series);
        sample.custom_metrics = creds
            .custom_metrics
            .iter()
            .filter_map(|config| {
                let value = series
                    .iter()
                    .find(|s| s.name == config.metric_name)
                    .map(|s| s.value)?;
                Some(CustomMetricReading {
                    metric_id: config.id.clone(),
                    raw_value: value,
                    value,
                    is_counter: config.is_rate(),
                })
            })
            .collect();

        Ok(sample)
    }
}

/// Parse the Prometheus text exposition format.
///
/// Comment and type lines are skipped; histograms and summaries surface as
/// their component series. Lines that fail to parse are ignored.
pub fn parse_exposition(body: &str) -> Vec<Series> {
    body.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Series> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (name, rest) = match line.find(|c| c == '{' || c == ' ' || c == '\t') {
        Some(pos) => line.split_at(pos),
        None => return None,
    };
    if name.is_empty() {
        return None;
    }

    let (labels, value_part) = if let Some(stripped) = rest.strip_prefix('{') {
        let close = find_label_end(stripped)?;
        (parse_labels(&stripped[..close]), &stripped[close + 1..])
    } else {
        (HashMap::new(), rest)
    };

    // First whitespace-separated token is the value; a second would be the
    // timestamp, which CoreBit stamps itself.
    let value_token = value_part.split_whitespace().next()?;
    let value = match value_token {
        "NaN" => f64::NAN,
        "+Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        token => token.parse().ok()?,
    };

    Some(Series {
        name: name.to_string(),
        labels,
        value,
    })
}

/// Position of the closing `}`, honouring quoted label values.
fn find_label_end(s: &str) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '}' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_labels(s: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut rest = s;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_matches(',').trim().to_string();
        rest = &rest[eq + 1..];
        let Some(stripped) = rest.strip_prefix('"') else { break };

        let mut value = String::new();
        let mut escaped = false;
        let mut consumed = stripped.len();
        for (i, c) in stripped.char_indices() {
            if escaped {
                match c {
                    'n' => value.push('\n'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    other => value.push(other),
                }
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                consumed = i + 1;
                break;
            } else {
                value.push(c);
            }
        }
        if !key.is_empty() {
            labels.insert(key, value);
        }
        rest = stripped[consumed..].trim_start_matches(',').trim_start();
    }
    labels
}

fn first_value<'a>(series: &'a [Series], name: &str) -> Option<&'a Series> {
    series.iter().find(|s| s.name == name)
}

fn memory_percent(series: &[Series]) -> Option<f64> {
    let total = first_value(series, "node_memory_MemTotal_bytes")?.value;
    let available = first_value(series, "node_memory_MemAvailable_bytes")?.value;
    if total <= 0.0 {
        return None;
    }
    Some((100.0 * (1.0 - available / total)).clamp(0.0, 100.0))
}

/// Disk usage of the root filesystem, or the largest real filesystem when
/// no root mountpoint is exported.
fn disk_percent(series: &[Series]) -> Option<f64> {
    let sizes: Vec<&Series> = series
        .iter()
        .filter(|s| s.name == "node_filesystem_size_bytes")
        .filter(|s| {
            s.label("fstype")
                .map_or(true, |t| !PSEUDO_FILESYSTEMS.contains(&t))
        })
        .collect();

    let chosen = sizes
        .iter()
        .find(|s| s.label("mountpoint") == Some("/"))
        .or_else(|| {
            sizes
                .iter()
                .max_by(|a, b| a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal))
        })?;
    let mountpoint = chosen.label("mountpoint")?;

    let avail = series
        .iter()
        .find(|s| {
            s.name == "node_filesystem_avail_bytes" && s.label("mountpoint") == Some(mountpoint)
        })?
        .value;
    if chosen.value <= 0.0 {
        return None;
    }
    Some((100.0 * (1.0 - avail / chosen.value)).clamp(0.0, 100.0))
}

fn uptime_seconds(series: &[Series], now_epoch: i64) -> Option<u64> {
    let boot = first_value(series, "node_boot_time_seconds")?.value;
    let uptime = now_epoch as f64 - boot;
    if uptime < 0.0 {
        return None;
    }
    Some(uptime as u64)
}

/// Per-interface receive/transmit byte counters, loopback excluded.
fn network_counters(series: &[Series]) -> Vec<InterfaceCounters> {
    let mut by_device: HashMap<String, (Option<u64>, Option<u64>)> = HashMap::new();
    for s in series {
        let slot = match s.name.as_str() {
            "node_network_receive_bytes_total" => 0,
            "node_network_transmit_bytes_total" => 1,
            _ => continue,
        };
        let Some(device) = s.label("device") else { continue };
        if device == "lo" {
            continue;
        }
        let entry = by_device.entry(device.to_string()).or_default();
        if slot == 0 {
            entry.0 = Some(s.value as u64);
        } else {
            entry.1 = Some(s.value as u64);
        }
    }

    let mut counters: Vec<InterfaceCounters> = by_device
        .into_iter()
        .filter_map(|(name, (rx, tx))| {
            Some(InterfaceCounters {
                snmp_index: None,
                name: Some(name),
                in_octets: rx?,
                out_octets: tx?,
                bits: CounterBits::Bits64,
            })
        })
        .collect();
    counters.sort_by(|a, b| a.name.cmp(&b.name));
    counters
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# HELP node_memory_MemTotal_bytes Memory information field MemTotal_bytes.
# TYPE node_memory_MemTotal_bytes gauge
node_memory_MemTotal_bytes 8.0e+09
node_memory_MemAvailable_bytes 2.0e+09
node_boot_time_seconds 1000
node_filesystem_size_bytes{device="/dev/sda1",fstype="ext4",mountpoint="/"} 100000
node_filesystem_avail_bytes{device="/dev/sda1",fstype="ext4",mountpoint="/"} 25000
node_filesystem_size_bytes{device="tmpfs",fstype="tmpfs",mountpoint="/run"} 999999
node_network_receive_bytes_total{device="eth0"} 1234
node_network_transmit_bytes_total{device="eth0"} 5678
node_network_receive_bytes_total{device="lo"} 42
node_network_transmit_bytes_total{device="lo"} 42
node_cpu_seconds_total{cpu="0",mode="idle"} 100
node_cpu_seconds_total{cpu="0",mode="user"} 10
"#;

    #[test]
    fn test_parse_basic_lines() {
        let series = parse_exposition(SAMPLE);
        let total = first_value(&series, "node_memory_MemTotal_bytes").unwrap();
        assert_eq!(total.value, 8.0e9);

        let fs = series
            .iter()
            .find(|s| s.name == "node_filesystem_size_bytes" && s.label("mountpoint") == Some("/"))
            .unwrap();
        assert_eq!(fs.label("fstype"), Some("ext4"));
        assert_eq!(fs.value, 100000.0);
    }

    #[test]
    fn test_parse_escaped_labels() {
        let series =
            parse_exposition(r#"weird_metric{path="C:\\temp\\\"dir\"",other="a,b}c"} 1"#);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].label("path"), Some(r#"C:\temp\"dir""#));
        assert_eq!(series[0].label("other"), Some("a,b}c"));
    }

    #[test]
    fn test_memory_and_disk_percent() {
        let series = parse_exposition(SAMPLE);
        assert_eq!(memory_percent(&series), Some(75.0));
        assert_eq!(disk_percent(&series), Some(75.0));
    }

    #[test]
    fn test_uptime() {
        let series = parse_exposition(SAMPLE);
        assert_eq!(uptime_seconds(&series, 4600), Some(3600));
    }

    #[test]
    fn test_network_counters_skip_loopback() {
        let series = parse_exposition(SAMPLE);
        let counters = network_counters(&series);
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].name.as_deref(), Some("eth0"));
        assert_eq!(counters[0].in_octets, 1234);
        assert_eq!(counters[0].out_octets, 5678);
    }

    #[test]
    fn test_cpu_percent_needs_two_scrapes() {
        let prober = PrometheusProber::new();
        let id = Uuid::new_v4();
        let first = parse_exposition(SAMPLE);
        assert_eq!(prober.cpu_percent(id, &first), None);

        // Second scrape: 20s wall, 5s idle → 75% busy.
        let second = parse_exposition(
            "node_cpu_seconds_total{cpu=\"0\",mode=\"idle\"} 105\n\
             node_cpu_seconds_total{cpu=\"0\",mode=\"user\"} 25\n",
        );
        let cpu = prober.cpu_percent(id, &second).unwrap();
        assert!((cpu - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_probe_against_mock_server() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE))
            .mount(&server)
            .await;

        let port = server.address().port();
        let prober = PrometheusProber::new();
        let device = Device::new(
            "node",
            crate::repository::models::DeviceKind::Server,
            Some("127.0.0.1".parse().unwrap()),
        );
        let creds = Credentials::from_value(&serde_json::json!({ "port": port }));

        let sample = prober
            .probe(
                &device,
                &creds,
                Instant::now() + std::time::Duration::from_secs(5),
            )
            .await
            .unwrap();

        let data = sample.device_data.unwrap();
        assert_eq!(data.memory_percent, Some(75.0));
        assert_eq!(sample.interfaces.len(), 1);
    }
}
