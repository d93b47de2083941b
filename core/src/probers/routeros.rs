// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! RouterOS API prober.
//!
//! Implements the RouterOS API wire protocol directly: length-prefixed
//! words grouped into sentences, a sentence ending with an empty word.
//! Replies start with `!re` (data), `!done`, `!trap` (error) or `!fatal`.
//! Authentication is the post-6.43 plain login.
//!
//! Two probe depths:
//!
//! - *Quick* (every cycle): `/system/identity/print`,
//!   `/system/resource/print` and `/interface/print` for identity,
//!   resources and the port list.
//! - *Detailed* (every Nth cycle, or when the port set changed):
//!   adds `/interface/ethernet/monitor` for negotiated link rates. The
//!   discovered rates are cached and merged into quick samples.
//!
//! `useTLS` connects port 8729 through rustls with certificate
//! verification disabled; RouterOS ships self-signed certificates.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use super::error::ProbeError;
use super::types::ProbeSample;
use super::{remaining, Credentials, MikrotikCredentials, Prober};
use crate::repository::models::{Device, DeviceData, DevicePort, PortStatus};

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A reply sentence kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    Data,
    Done,
    Trap,
    Fatal,
}

/// One parsed reply sentence
#[derive(Debug, Clone)]
struct Reply {
    kind: ReplyKind,
    attributes: HashMap<String, String>,
}

impl Reply {
    fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// RouterOS API prober
pub struct RouterOsProber {
    detailed_every: u32,
    cycles: DashMap<Uuid, u32>,
    port_names: DashMap<Uuid, Vec<String>>,
    /// Link rates learned by the last detailed pass, merged into quick samples.
    known_rates: DashMap<Uuid, HashMap<String, String>>,
}

impl RouterOsProber {
    pub fn new(detailed_every: u32) -> Self {
        Self {
            detailed_every: detailed_every.max(1),
            cycles: DashMap::new(),
            port_names: DashMap::new(),
            known_rates: DashMap::new(),
        }
    }

    /// Open a session and authenticate. Returns the client and the
    /// connect+login round-trip time in milliseconds.
    async fn connect(
        &self,
        ip: Ipv4Addr,
        creds: &MikrotikCredentials,
        deadline: Instant,
    ) -> Result<(ApiClient, f64), ProbeError> {
        let started = std::time::Instant::now();
        let tcp = tokio::time::timeout(
            remaining(deadline)?,
            TcpStream::connect((ip, creds.api_port)),
        )
        .await
        .map_err(|_| ProbeError::Timeout(Duration::ZERO))??;
        tcp.set_nodelay(true).ok();

        let stream: Box<dyn Transport> = if creds.use_tls {
            let connector = tls_connector();
            let server_name =
                tokio_rustls::rustls::pki_types::ServerName::from(std::net::IpAddr::V4(ip));
            let tls = tokio::time::timeout(remaining(deadline)?, connector.connect(server_name, tcp))
                .await
                .map_err(|_| ProbeError::Timeout(Duration::ZERO))??;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let mut client = ApiClient { stream };
        client
            .login(&creds.username, &creds.password, deadline)
            .await?;
        Ok((client, started.elapsed().as_secs_f64() * 1000.0))
    }

    /// Connect, authenticate, and fetch the identity. The scanner uses
    /// this as its RouterOS fingerprint check.
    pub async fn check_auth(
        &self,
        ip: Ipv4Addr,
        creds: &MikrotikCredentials,
        deadline: Instant,
    ) -> Result<String, ProbeError> {
        let (mut client, _) = self.connect(ip, creds, deadline).await?;
        let identity = client
            .command(&["/system/identity/print"], deadline)
            .await?;
        let name = identity
            .first()
            .and_then(|r| r.get("name"))
            .unwrap_or_default()
            .to_string();
        client.close().await;
        Ok(name)
    }

    /// Should this cycle run the detailed pass?
    fn wants_detailed(&self, device_id: Uuid, current_ports: &[String]) -> bool {
        let cycle = {
            let mut entry = self.cycles.entry(device_id).or_insert(0);
            *entry += 1;
            *entry
        };
        let ports_changed = self
            .port_names
            .get(&device_id)
            .map(|known| known.as_slice() != current_ports)
            .unwrap_or(true);
        self.port_names
            .insert(device_id, current_ports.to_vec());
        cycle % self.detailed_every == 1 || ports_changed
    }
}

#[async_trait]
impl Prober for RouterOsProber {
    fn name(&self) -> &'static str {
        "routeros"
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
        let creds = MikrotikCredentials::from_bag(creds)?;
        let (mut client, rtt_ms) = self.connect(ip, &creds, deadline).await?;

        let identity = client
            .command(&["/system/identity/print"], deadline)
            .await?;
        let resource = client
            .command(&["/system/resource/print"], deadline)
            .await?;
        let interfaces = client.command(&["/interface/print"], deadline).await?;

        let mut data = DeviceData::default();
        if let Some(reply) = identity.first() {
            if let Some(name) = reply.get("name") {
                data.model = Some(name.to_string());
            }
        }
        if let Some(res) = resource.first() {
            data.uptime_seconds = res.get("uptime").and_then(parse_routeros_duration);
            data.version = res.get("version").map(str::to_string);
            if let Some(board) = res.get("board-name") {
                // Identity stays in `model` only until the board is known.
                data.model = Some(match data.model.take() {
                    Some(identity) => format!("{board} ({identity})"),
                    None => board.to_string(),
                });
            }
            data.cpu_percent = res.get("cpu-load").and_then(|v| v.parse().ok());
            data.memory_percent =
                used_percent(res.get("free-memory"), res.get("total-memory"));
            data.disk_percent =
                used_percent(res.get("free-hdd-space"), res.get("total-hdd-space"));
        }

        let mut ports = Vec::new();
        for reply in interfaces.iter().filter(|r| r.kind == ReplyKind::Data) {
            let Some(name) = reply.get("name") else { continue };
            ports.push(DevicePort {
                name: name.to_string(),
                default_name: reply.get("default-name").map(str::to_string),
                status: if reply.get("running") == Some("true") {
                    PortStatus::Up
                } else {
                    PortStatus::Down
                },
                speed: None,
                description: reply.get("comment").map(str::to_string),
                snmp_index: reply.get(".id").and_then(parse_internal_id),
            });
        }

        let port_names: Vec<String> = ports.iter().map(|p| p.name.clone()).collect();
        if self.wants_detailed(device.id, &port_names) {
            let mut rates = HashMap::new();
            for port in ports.iter().filter(|p| {
                p.status == PortStatus::Up
                    && p.default_name
                        .as_deref()
                        .unwrap_or(&p.name)
                        .starts_with("ether")
            }) {
                let monitor = client
                    .command(
                        &[
                            "/interface/ethernet/monitor",
                            &format!("=numbers={}", port.name),
                            "=once=",
                        ],
                        deadline,
                    )
                    .await;
                match monitor {
                    Ok(replies) => {
                        if let Some(rate) = replies.iter().find_map(|r| r.get("rate")) {
                            rates.insert(port.name.clone(), rate.to_string());
                        }
                    }
                    Err(e) if e.is_transient() => return Err(e),
                    // Non-ethernet oddities are tolerated; the port simply
                    // keeps no rate.
                    Err(e) => trace!(port = %port.name, error = %e, "ethernet monitor failed"),
                }
            }
            debug!(device = %device.name, rates = rates.len(), "detailed probe refreshed link rates");
            self.known_rates.insert(device.id, rates);
        }
        if let Some(rates) = self.known_rates.get(&device.id) {
            for port in &mut ports {
                port.speed = rates.get(&port.name).cloned();
            }
        }
        data.ports = ports;

        client.close().await;
        Ok(ProbeSample::reachable().with_rtt(rtt_ms).with_device_data(data))
    }
}

/// Minimal RouterOS API client over one connection.
struct ApiClient {
    stream: Box<dyn Transport>,
}

impl ApiClient {
    /// Post-6.43 plain login.
    async fn login(
        &mut self,
        username: &str,
        password: &str,
        deadline: Instant,
    ) -> Result<(), ProbeError> {
        let words = [
            "/login".to_string(),
            format!("=name={username}"),
            format!("=password={password}"),
        ];
        self.write_sentence(&words, deadline).await?;
        let replies = self.read_replies(deadline).await?;
        if let Some(trap) = replies.iter().find(|r| r.kind == ReplyKind::Trap) {
            return Err(ProbeError::Auth(
                trap.get("message").unwrap_or("login rejected").to_string(),
            ));
        }
        // Pre-6.43 devices answer with a challenge instead of !done.
        if replies.iter().any(|r| r.get("ret").is_some()) {
            return Err(ProbeError::Protocol(
                "device requires the legacy challenge login".to_string(),
            ));
        }
        Ok(())
    }

    /// Send one command sentence and collect replies until `!done`.
    async fn command(&mut self, words: &[&str], deadline: Instant) -> Result<Vec<Reply>, ProbeError> {
        let owned: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        self.write_sentence(&owned, deadline).await?;
        let replies = self.read_replies(deadline).await?;
        if let Some(trap) = replies.iter().find(|r| r.kind == ReplyKind::Trap) {
            return Err(ProbeError::Protocol(
                trap.get("message").unwrap_or("trap").to_string(),
            ));
        }
        Ok(replies
            .into_iter()
            .filter(|r| r.kind == ReplyKind::Data)
            .collect())
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn write_sentence(
        &mut self,
        words: &[String],
        deadline: Instant,
    ) -> Result<(), ProbeError> {
        let mut buf = Vec::new();
        for word in words {
            encode_length(word.len() as u32, &mut buf);
            buf.extend_from_slice(word.as_bytes());
        }
        buf.push(0);
        tokio::time::timeout(remaining(deadline)?, self.stream.write_all(&buf))
            .await
            .map_err(|_| ProbeError::Timeout(Duration::ZERO))??;
        Ok(())
    }

    /// Read sentences until a terminal `!done` or `!fatal`.
    async fn read_replies(&mut self, deadline: Instant) -> Result<Vec<Reply>, ProbeError> {
        let mut replies = Vec::new();
        loop {
            let words = self.read_sentence(deadline).await?;
            if words.is_empty() {
                continue;
            }
            let kind = match words[0].as_str() {
                "!re" => ReplyKind::Data,
                "!done" => ReplyKind::Done,
                "!trap" => ReplyKind::Trap,
                "!fatal" => ReplyKind::Fatal,
                other => {
                    return Err(ProbeError::Protocol(format!(
                        "unexpected reply word {other}"
                    )))
                }
            };
            let mut attributes = HashMap::new();
            for word in &words[1..] {
                if let Some(rest) = word.strip_prefix('=') {
                    if let Some((key, value)) = rest.split_once('=') {
                        attributes.insert(key.to_string(), value.to_string());
                    }
                } else if let Some(rest) = word.strip_prefix('.') {
                    if let Some((key, value)) = rest.split_once('=') {
                        attributes.insert(format!(".{key}"), value.to_string());
                    }
                }
            }
            let terminal = matches!(kind, ReplyKind::Done | ReplyKind::Fatal);
            replies.push(Reply { kind, attributes });
            if terminal {
                if replies.iter().any(|r| r.kind == ReplyKind::Fatal) {
                    return Err(ProbeError::Protocol("connection fataled".to_string()));
                }
                return Ok(replies);
            }
        }
    }

    async fn read_sentence(&mut self, deadline: Instant) -> Result<Vec<String>, ProbeError> {
        let mut words = Vec::new();
        loop {
            let len = self.read_length(deadline).await?;
            if len == 0 {
                return Ok(words);
            }
            let mut buf = vec![0u8; len as usize];
            tokio::time::timeout(remaining(deadline)?, self.stream.read_exact(&mut buf))
                .await
                .map_err(|_| ProbeError::Timeout(Duration::ZERO))??;
            words.push(String::from_utf8_lossy(&buf).into_owned());
        }
    }

    async fn read_length(&mut self, deadline: Instant) -> Result<u32, ProbeError> {
        let first = self.read_byte(deadline).await?;
        let (extra, mut value) = match first {
            b if b & 0x80 == 0 => (0, u32::from(b)),
            b if b & 0xC0 == 0x80 => (1, u32::from(b & 0x3F)),
            b if b & 0xE0 == 0xC0 => (2, u32::from(b & 0x1F)),
            b if b & 0xF0 == 0xE0 => (3, u32::from(b & 0x0F)),
            _ => (4, 0),
        };
        for _ in 0..extra {
            value = (value << 8) | u32::from(self.read_byte(deadline).await?);
        }
        Ok(value)
    }

    async fn read_byte(&mut self, deadline: Instant) -> Result<u8, ProbeError> {
        let mut byte = [0u8; 1];
        tokio::time::timeout(remaining(deadline)?, self.stream.read_exact(&mut byte))
            .await
            .map_err(|_| ProbeError::Timeout(Duration::ZERO))??;
        Ok(byte[0])
    }
}

/// RouterOS API variable-width length prefix.
fn encode_length(len: u32, out: &mut Vec<u8>) {
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0x3FFF => out.extend_from_slice(&((len | 0x8000) as u16).to_be_bytes()),
        0x4000..=0x1F_FFFF => {
            let value = len | 0xC0_0000;
            out.extend_from_slice(&value.to_be_bytes()[1..]);
        }
        0x20_0000..=0x0FFF_FFFF => out.extend_from_slice(&(len | 0xE000_0000).to_be_bytes()),
        _ => {
            out.push(0xF0);
            out.extend_from_slice(&len.to_be_bytes());
        }
    }
}

/// `"1w2d3h4m5s"` → seconds. Unknown units are skipped.
fn parse_routeros_duration(text: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut any = false;
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            'w' => 604_800,
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => continue,
        };
        total += value * unit;
        any = true;
    }
    if any {
        Some(total)
    } else {
        None
    }
}

/// `*1F` → 31. RouterOS interface ifIndex tracks the internal id.
fn parse_internal_id(id: &str) -> Option<i32> {
    i32::from_str_radix(id.strip_prefix('*')?, 16).ok()
}

fn used_percent(free: Option<&str>, total: Option<&str>) -> Option<f64> {
    let free: f64 = free?.parse().ok()?;
    let total: f64 = total?.parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    Some((100.0 * (1.0 - free / total)).clamp(0.0, 100.0))
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    use tokio_rustls::rustls::{self, crypto::ring};

    let provider = Arc::new(ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// RouterOS device certificates are self-signed; accept them.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<tokio_rustls::rustls::crypto::CryptoProvider>,
}

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &tokio_rustls::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        tokio_rustls::rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        tokio_rustls::rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
