// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICMP ping prober.
//!
//! Sends two concurrent echo requests (1 s timeout each) and reports the
//! minimum round-trip time; a single reply counts as success. Prefers an
//! unprivileged datagram ICMP socket, falls back to a raw socket, and when
//! ICMP is unavailable entirely falls back to TCP connect probes against
//! common ports (where an open port *or* an active refusal proves the host
//! is up).

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant as StdInstant};
use tokio::time::Instant;
use tracing::trace;

use super::error::ProbeError;
use super::types::ProbeSample;
use super::{remaining, Credentials, Prober};
use crate::repository::models::Device;

/// Timeout of a single echo request
const ECHO_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of concurrent echoes per probe
const ECHO_COUNT: u16 = 2;

/// Payload carried in each echo request
const ECHO_PAYLOAD: &[u8] = b"corebit-echo-0123456789abcdef";

/// Ports tried by the TCP fallback; refusal also proves liveness.
const FALLBACK_PORTS: [u16; 4] = [443, 80, 22, 8291];

/// ICMP echo prober
pub struct PingProber;

impl PingProber {
    pub fn new() -> Self {
        Self
    }

    /// Ping `ip` once: two concurrent echoes, minimum RTT in milliseconds.
    pub async fn ping(&self, ip: Ipv4Addr, timeout: Duration) -> Result<f64, ProbeError> {
        let ident = (std::process::id() as u16) ^ u16::from(ip.octets()[2]) << 8
            ^ u16::from(ip.octets()[3]);

        let mut tasks = Vec::with_capacity(ECHO_COUNT as usize);
        for seq in 0..ECHO_COUNT {
            tasks.push(tokio::task::spawn_blocking(move || {
                icmp_echo(ip, ident, seq, timeout)
            }));
        }

        let mut best: Option<f64> = None;
        let mut icmp_unavailable = false;
        let mut last_err: Option<ProbeError> = None;
        for task in tasks {
            match task.await {
                Ok(Ok(rtt)) => {
                    best = Some(best.map_or(rtt, |b: f64| b.min(rtt)));
                }
                Ok(Err(EchoError::Unavailable)) => icmp_unavailable = true,
                Ok(Err(EchoError::Io(e))) => last_err = Some(e.into()),
                Err(join) => last_err = Some(ProbeError::Network(join.to_string())),
            }
        }

        if let Some(rtt) = best {
            return Ok(rtt);
        }
        if icmp_unavailable {
            trace!(%ip, "ICMP unavailable, falling back to TCP connect");
            return tcp_fallback(ip, timeout).await;
        }
        Err(last_err.unwrap_or(ProbeError::Timeout(timeout)))
    }
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for PingProber {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn probe(
        &self,
        device: &Device,
        _creds: &Credentials,
        deadline: Instant,
    ) -> Result<ProbeSample, ProbeError> {
        let ip = device
            .ip
            .ok_or_else(|| ProbeError::Credentials("device has no IP address".to_string()))?;
        let budget = remaining(deadline)?;
        let rtt = self.ping(ip, ECHO_TIMEOUT.min(budget)).await?;
        Ok(ProbeSample::reachable().with_rtt(rtt))
    }
}

enum EchoError {
    /// ICMP sockets are not permitted in this environment.
    Unavailable,
    Io(std::io::Error),
}

fn open_icmp_socket() -> Result<Socket, EchoError> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
        .or_else(|_| Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)))
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => EchoError::Unavailable,
            _ => EchoError::Io(e),
        })
}

/// Blocking single echo exchange. Returns RTT in milliseconds.
fn icmp_echo(ip: Ipv4Addr, ident: u16, seq: u16, timeout: Duration) -> Result<f64, EchoError> {
    let socket = open_icmp_socket()?;
    socket.set_read_timeout(Some(timeout)).map_err(EchoError::Io)?;
    socket.set_write_timeout(Some(timeout)).map_err(EchoError::Io)?;

    let addr = SocketAddr::new(IpAddr::V4(ip), 0);
    let request = build_echo_request(ident, seq);
    let start = StdInstant::now();
    socket
        .send_to(&request, &addr.into())
        .map_err(EchoError::Io)?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1600];
    loop {
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(EchoError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "echo timed out",
            )));
        }
        let (len, _peer) = socket.recv_from(&mut buf).map_err(EchoError::Io)?;
        let rtt = start.elapsed();
        // Initialized by recv_from up to `len`.
        #[allow(unsafe_code)]
        let data: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), len) };
        if is_matching_reply(data, seq) {
            return Ok(rtt.as_secs_f64() * 1000.0);
        }
    }
}

/// Echo request packet: type 8, code 0, checksum, identifier, sequence.
fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
    packet.extend_from_slice(&[8, 0, 0, 0]);
    packet.extend_from_slice(&ident.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(ECHO_PAYLOAD);
    let checksum = internet_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// RFC 1071 one's-complement checksum.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum = sum.wrapping_add(u32::from(word));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Accept an echo reply with our sequence number. Raw sockets deliver the
/// IP header as well; datagram sockets rewrite the identifier, so only the
/// sequence is matched.
fn is_matching_reply(mut data: &[u8], seq: u16) -> bool {
    if data.len() >= 20 && data[0] >> 4 == 4 {
        let ihl = usize::from(data[0] & 0x0f) * 4;
        if data.len() <= ihl {
            return false;
        }
        data = &data[ihl..];
    }
    data.len() >= 8 && data[0] == 0 && u16::from_be_bytes([data[6], data[7]]) == seq
}

/// Attempt TCP connects to common ports; an open port or an active refusal
/// both prove the host answers.
async fn tcp_fallback(ip: Ipv4Addr, timeout: Duration) -> Result<f64, ProbeError> {
    let mut attempts = Vec::new();
    for port in FALLBACK_PORTS {
        attempts.push(async move {
            let start = StdInstant::now();
            let result = tokio::time::timeout(
                timeout,
                tokio::net::TcpStream::connect((ip, port)),
            )
            .await;
            match result {
                Ok(Ok(_)) => Some(start.elapsed().as_secs_f64() * 1000.0),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    Some(start.elapsed().as_secs_f64() * 1000.0)
                }
                _ => None,
            }
        });
    }
    let results = futures::future::join_all(attempts).await;
    results
        .into_iter()
        .flatten()
        .fold(None, |best: Option<f64>, rtt| {
            Some(best.map_or(rtt, |b| b.min(rtt)))
        })
        .ok_or(ProbeError::Timeout(timeout))
}
