// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! SNMP prober (v1, v2c, v3).
//!
//! A self-contained SNMP client over UDP: the BER subset codec lives in
//! [`ber`], the v3 user security model in [`usm`]. The prober collects the
//! system group, HOST-RESOURCES CPU/memory/disk where the agent exposes
//! them, and the interface table with octet counters (64-bit `ifHC*`
//! preferred, 32-bit fallback).

pub mod ber;
pub mod usm;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::trace;

use super::error::ProbeError;
use super::types::{CounterBits, InterfaceCounters, ProbeSample};
use super::{remaining, Credentials, Prober, SnmpCredentials};
use crate::probers::credentials::SnmpVersion;
use crate::repository::models::{Device, DeviceData, DevicePort, PortStatus};
use ber::{Oid, Pdu, SnmpValue};

/// SNMP agent port
const SNMP_PORT: u16 = 161;

/// Upper bound on walked table rows
const MAX_WALK_ROWS: usize = 512;

/// v1 error-status `noSuchName`, the v1 end-of-table signal
const ERROR_NO_SUCH_NAME: i32 = 2;

// System group
const SYS_DESCR: &str = "1.3.6.1.2.1.1.1.0";
const SYS_UPTIME: &str = "1.3.6.1.2.1.1.3.0";
const SYS_NAME: &str = "1.3.6.1.2.1.1.5.0";

// HOST-RESOURCES-MIB
const HR_PROCESSOR_LOAD: &str = "1.3.6.1.2.1.25.3.3.1.2";
const HR_STORAGE_TYPE: &str = "1.3.6.1.2.1.25.2.3.1.2";
const HR_STORAGE_DESCR: &str = "1.3.6.1.2.1.25.2.3.1.3";
const HR_STORAGE_ALLOC: &str = "1.3.6.1.2.1.25.2.3.1.4";
const HR_STORAGE_SIZE: &str = "1.3.6.1.2.1.25.2.3.1.5";
const HR_STORAGE_USED: &str = "1.3.6.1.2.1.25.2.3.1.6";
const HR_STORAGE_TYPE_RAM: &str = "1.3.6.1.2.1.25.2.1.2";
const HR_STORAGE_TYPE_FIXED_DISK: &str = "1.3.6.1.2.1.25.2.1.4";

// IF-MIB
const IF_DESCR: &str = "1.3.6.1.2.1.2.2.1.2";
const IF_SPEED: &str = "1.3.6.1.2.1.2.2.1.5";
const IF_OPER_STATUS: &str = "1.3.6.1.2.1.2.2.1.8";
const IF_IN_OCTETS: &str = "1.3.6.1.2.1.2.2.1.10";
const IF_OUT_OCTETS: &str = "1.3.6.1.2.1.2.2.1.16";
const IF_X_NAME: &str = "1.3.6.1.2.1.31.1.1.1.1";
const IF_X_HIGH_SPEED: &str = "1.3.6.1.2.1.31.1.1.1.15";
const IF_X_ALIAS: &str = "1.3.6.1.2.1.31.1.1.1.18";
const IF_HC_IN_OCTETS: &str = "1.3.6.1.2.1.31.1.1.1.6";
const IF_HC_OUT_OCTETS: &str = "1.3.6.1.2.1.31.1.1.1.10";

fn oid(text: &str) -> Oid {
    Oid::parse(text).expect("static OID")
}

#[derive(Clone)]
struct EngineState {
    engine_id: Vec<u8>,
    boots: i64,
    time: i64,
}

/// One UDP conversation with an agent.
pub struct SnmpSession {
    socket: UdpSocket,
    creds: SnmpCredentials,
    request_id: i32,
    msg_id: i32,
    salt: u64,
    engine: Option<EngineState>,
    auth_key: Option<Vec<u8>>,
    priv_key: Option<Vec<u8>>,
}

impl SnmpSession {
    pub async fn connect(
        ip: Ipv4Addr,
        creds: SnmpCredentials,
        deadline: Instant,
    ) -> Result<Self, ProbeError> {
        let _ = remaining(deadline)?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((ip, SNMP_PORT)).await?;
        let seed = (std::process::id() as i32) << 8;
        Ok(Self {
            socket,
            creds,
            request_id: seed,
            msg_id: seed ^ 0x5A5A,
            salt: u64::from(std::process::id()),
            engine: None,
            auth_key: None,
            priv_key: None,
        })
    }

    fn next_request_id(&mut self) -> i32 {
        self.request_id = self.request_id.wrapping_add(1);
        self.request_id
    }

    fn next_msg_id(&mut self) -> i32 {
        self.msg_id = self.msg_id.wrapping_add(1) & 0x7FFF_FFFF;
        self.msg_id
    }

    fn next_salt(&mut self) -> u64 {
        self.salt = self.salt.wrapping_add(1);
        self.salt
    }

    /// One request/response exchange with the credential-configured
    /// timeout and retry count, bounded by the probe deadline.
    async fn exchange(&self, request: &[u8], deadline: Instant) -> Result<Vec<u8>, ProbeError> {
        let mut buf = vec![0u8; 65_535];
        for _attempt in 0..=self.creds.retries {
            let budget = self.creds.timeout.min(remaining(deadline)?);
            self.socket.send(request).await?;
            match tokio::time::timeout(budget, self.socket.recv(&mut buf)).await {
                Ok(Ok(len)) => return Ok(buf[..len].to_vec()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            }
        }
        Err(ProbeError::Timeout(self.creds.timeout))
    }

    /// v3 engine discovery plus key localization.
    async fn ensure_engine(&mut self, deadline: Instant) -> Result<(), ProbeError> {
        if self.engine.is_some() {
            return Ok(());
        }
        let message = usm::encode_discovery(self.next_msg_id(), self.next_request_id())
            .map_err(map_usm)?;
        let response = self.exchange(&message, deadline).await?;
        let decoded = usm::decode_message(&response, None, None).map_err(map_usm)?;
        if decoded.engine_id.is_empty() {
            return Err(ProbeError::Protocol(
                "agent did not reveal its engine id".to_string(),
            ));
        }
        if !usm::is_unknown_engine_report(&decoded.pdu) {
            trace!("discovery answered with a non-report PDU; continuing");
        }

        if let (Some(auth_protocol), Some(auth_password)) =
            (self.creds.auth_protocol, self.creds.auth_key.clone())
        {
            self.auth_key = Some(
                usm::localize_key(auth_protocol, &auth_password, &decoded.engine_id)
                    .map_err(map_usm)?,
            );
            // The privacy key localizes under the *auth* protocol's hash.
            if let (Some(_), Some(priv_password)) =
                (self.creds.priv_protocol, self.creds.priv_key.clone())
            {
                self.priv_key = Some(
                    usm::localize_key(auth_protocol, &priv_password, &decoded.engine_id)
                        .map_err(map_usm)?,
                );
            }
        }
        self.engine = Some(EngineState {
            engine_id: decoded.engine_id,
            boots: decoded.engine_boots,
            time: decoded.engine_time,
        });
        Ok(())
    }

    /// Send one PDU and return the matched response PDU.
    async fn transact(&mut self, mut pdu: Pdu, deadline: Instant) -> Result<Pdu, ProbeError> {
        pdu.request_id = self.next_request_id();
        match self.creds.version {
            SnmpVersion::V1 | SnmpVersion::V2c => {
                let version = if self.creds.version == SnmpVersion::V1 { 0 } else { 1 };
                let message = ber::encode_community_message(version, &self.creds.community, &pdu)
                    .map_err(|e| ProbeError::Protocol(e.to_string()))?;
                let response = self.exchange(&message, deadline).await?;
                let (_, _, decoded) = ber::decode_community_message(&response)
                    .map_err(|e| ProbeError::Protocol(e.to_string()))?;
                if decoded.request_id != pdu.request_id {
                    return Err(ProbeError::Protocol("response id mismatch".to_string()));
                }
                Ok(decoded)
            }
            SnmpVersion::V3 => {
                self.ensure_engine(deadline).await?;
                let mut attempts = 0;
                loop {
                    let engine = self.engine.clone().expect("engine discovered above");
                    let auth_key = self.auth_key.clone();
                    let priv_key = self.priv_key.clone();
                    let auth = self.creds.auth_protocol.zip(auth_key.as_deref());
                    let privacy = self.creds.priv_protocol.zip(priv_key.as_deref());
                    let msg_id = self.next_msg_id();
                    let salt = self.next_salt();
                    let message = usm::encode_message(&usm::V3Message {
                        msg_id,
                        engine_id: &engine.engine_id,
                        engine_boots: engine.boots,
                        engine_time: engine.time,
                        user: self.creds.username.as_deref().unwrap_or_default(),
                        auth,
                        privacy,
                        salt,
                        reportable: true,
                        pdu: &pdu,
                    })
                    .map_err(map_usm)?;

                    let response = self.exchange(&message, deadline).await?;
                    let decoded = usm::decode_message(&response, auth, privacy).map_err(map_usm)?;

                    if usm::is_time_window_report(&decoded.pdu) && attempts == 0 {
                        // Resynchronize clocks and retry once.
                        self.engine = Some(EngineState {
                            engine_id: decoded.engine_id,
                            boots: decoded.engine_boots,
                            time: decoded.engine_time,
                        });
                        attempts += 1;
                        continue;
                    }
                    if decoded.pdu.pdu_type == ber::PDU_REPORT {
                        return Err(ProbeError::Auth(
                            "agent rejected the request with a report".to_string(),
                        ));
                    }
                    return Ok(decoded.pdu);
                }
            }
        }
    }

    /// GET a fixed set of OIDs.
    pub async fn get(
        &mut self,
        oids: &[Oid],
        deadline: Instant,
    ) -> Result<Vec<(Oid, SnmpValue)>, ProbeError> {
        let response = self.transact(Pdu::get(0, oids), deadline).await?;
        if response.error_status != 0 {
            return Err(ProbeError::Protocol(format!(
                "agent returned error status {}",
                response.error_status
            )));
        }
        Ok(response.varbinds)
    }

    /// Walk a subtree with GetNext, collecting `(index-suffix OID, value)`.
    pub async fn walk(
        &mut self,
        base: &Oid,
        deadline: Instant,
    ) -> Result<Vec<(Oid, SnmpValue)>, ProbeError> {
        let mut rows = Vec::new();
        let mut current = base.clone();
        while rows.len() < MAX_WALK_ROWS {
            let response = self.transact(Pdu::get_next(0, &current), deadline).await?;
            if response.error_status == ERROR_NO_SUCH_NAME {
                break;
            }
            if response.error_status != 0 {
                return Err(ProbeError::Protocol(format!(
                    "agent returned error status {}",
                    response.error_status
                )));
            }
            let Some((next_oid, value)) = response.varbinds.into_iter().next() else {
                break;
            };
            if !next_oid.starts_with(base)
                || value == SnmpValue::EndOfMibView
                || next_oid == current
            {
                break;
            }
            current = next_oid.clone();
            rows.push((next_oid, value));
        }
        Ok(rows)
    }

    /// Walk a table column keyed by its final (row index) arc.
    async fn walk_column(
        &mut self,
        base: &str,
        deadline: Instant,
    ) -> Result<BTreeMap<u32, SnmpValue>, ProbeError> {
        let base = oid(base);
        Ok(self
            .walk(&base, deadline)
            .await?
            .into_iter()
            .filter_map(|(row_oid, value)| Some((row_oid.last_arc()?, value)))
            .collect())
    }
}

fn map_usm(e: usm::UsmError) -> ProbeError {
    match e {
        usm::UsmError::AuthenticationFailed => {
            ProbeError::Auth("message authentication failed".to_string())
        }
        usm::UsmError::BadConfiguration(msg) => ProbeError::Credentials(msg),
        other => ProbeError::Protocol(other.to_string()),
    }
}

/// SNMP prober
pub struct SnmpProber;

impl SnmpProber {
    pub fn new() -> Self {
        Self
    }

    /// `sysDescr.0` alone; used by the scanner fingerprint phase.
    pub async fn system_description(
        &self,
        ip: Ipv4Addr,
        creds: &Credentials,
        deadline: Instant,
    ) -> Result<String, ProbeError> {
        let creds = SnmpCredentials::from_bag(creds)?;
        let mut session = SnmpSession::connect(ip, creds, deadline).await?;
        let values = session.get(&[oid(SYS_DESCR)], deadline).await?;
        values
            .first()
            .and_then(|(_, v)| v.as_text())
            .ok_or_else(|| ProbeError::Protocol("sysDescr missing".to_string()))
    }
}

impl Default for SnmpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for SnmpProber {
    fn name(&self) -> &'static str {
        "snmp"
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
        let creds = SnmpCredentials::from_bag(creds)?;
        let mut session = SnmpSession::connect(ip, creds, deadline).await?;

        // System group: required; everything else is best-effort.
        let system = session
            .get(&[oid(SYS_DESCR), oid(SYS_UPTIME), oid(SYS_NAME)], deadline)
            .await?;
        let mut data = DeviceData::default();
        for (bind_oid, value) in &system {
            match bind_oid.to_string().as_str() {
                SYS_DESCR => data.model = value.as_text().map(|t| truncate(&t, 128)),
                SYS_UPTIME => {
                    data.uptime_seconds = value.as_u64().map(|ticks| ticks / 100);
                }
                _ => {}
            }
        }

        if let Ok(loads) = session.walk_column(HR_PROCESSOR_LOAD, deadline).await {
            let loads: Vec<i64> = loads.values().filter_map(SnmpValue::as_i64).collect();
            if !loads.is_empty() {
                data.cpu_percent =
                    Some((loads.iter().sum::<i64>() as f64 / loads.len() as f64).clamp(0.0, 100.0));
            }
        }

        if let Ok(storage) = self::storage_table(&mut session, deadline).await {
            data.memory_percent = storage.ram_percent;
            data.disk_percent = storage.disk_percent;
        }

        let (ports, interfaces) = interface_table(&mut session, deadline).await?;
        data.ports = ports;

        let mut sample = ProbeSample::reachable().with_device_data(data);
        sample.interfaces = interfaces;
        Ok(sample)
    }
}

struct StorageSummary {
    ram_percent: Option<f64>,
    disk_percent: Option<f64>,
}

/// Derive memory and disk usage from the hrStorage table.
async fn storage_table(
    session: &mut SnmpSession,
    deadline: Instant,
) -> Result<StorageSummary, ProbeError> {
    let types = session.walk_column(HR_STORAGE_TYPE, deadline).await?;
    let descrs = session.walk_column(HR_STORAGE_DESCR, deadline).await?;
    let allocs = session.walk_column(HR_STORAGE_ALLOC, deadline).await?;
    let sizes = session.walk_column(HR_STORAGE_SIZE, deadline).await?;
    let useds = session.walk_column(HR_STORAGE_USED, deadline).await?;

    let ram_type = oid(HR_STORAGE_TYPE_RAM);
    let disk_type = oid(HR_STORAGE_TYPE_FIXED_DISK);

    let mut ram_percent = None;
    let mut best_disk: Option<(u64, f64, bool)> = None; // (bytes, percent, is_root)
    for (index, type_value) in &types {
        let SnmpValue::Oid(storage_type) = type_value else { continue };
        let percent = match (
            sizes.get(index).and_then(SnmpValue::as_u64),
            useds.get(index).and_then(SnmpValue::as_u64),
        ) {
            (Some(size), Some(used)) if size > 0 => (100.0 * used as f64 / size as f64).min(100.0),
            _ => continue,
        };

        if *storage_type == ram_type && ram_percent.is_none() {
            ram_percent = Some(percent);
        } else if *storage_type == disk_type {
            let alloc = allocs.get(index).and_then(SnmpValue::as_u64).unwrap_or(1);
            let size = sizes.get(index).and_then(SnmpValue::as_u64).unwrap_or(0);
            let bytes = size.saturating_mul(alloc);
            let is_root = descrs
                .get(index)
                .and_then(SnmpValue::as_text)
                .map_or(false, |d| d == "/");
            let better = match &best_disk {
                None => true,
                Some((_, _, true)) => is_root,
                Some((best_bytes, _, false)) => is_root || bytes > *best_bytes,
            };
            if better {
                best_disk = Some((bytes, percent, is_root));
            }
        }
    }

    Ok(StorageSummary {
        ram_percent,
        disk_percent: best_disk.map(|(_, percent, _)| percent),
    })
}

/// Interface list plus octet counters, preferring 64-bit `ifHC*`.
async fn interface_table(
    session: &mut SnmpSession,
    deadline: Instant,
) -> Result<(Vec<DevicePort>, Vec<InterfaceCounters>), ProbeError> {
    let descrs = session.walk_column(IF_DESCR, deadline).await?;
    let oper = session.walk_column(IF_OPER_STATUS, deadline).await.unwrap_or_default();
    let speeds = session.walk_column(IF_SPEED, deadline).await.unwrap_or_default();
    let names = session.walk_column(IF_X_NAME, deadline).await.unwrap_or_default();
    let aliases = session.walk_column(IF_X_ALIAS, deadline).await.unwrap_or_default();
    let high_speeds = session
        .walk_column(IF_X_HIGH_SPEED, deadline)
        .await
        .unwrap_or_default();
    let hc_in = session.walk_column(IF_HC_IN_OCTETS, deadline).await.unwrap_or_default();
    let hc_out = session.walk_column(IF_HC_OUT_OCTETS, deadline).await.unwrap_or_default();
    let in32 = session.walk_column(IF_IN_OCTETS, deadline).await.unwrap_or_default();
    let out32 = session.walk_column(IF_OUT_OCTETS, deadline).await.unwrap_or_default();

    let mut ports = Vec::new();
    let mut counters = Vec::new();
    for (index, descr) in &descrs {
        let name = names
            .get(index)
            .and_then(SnmpValue::as_text)
            .or_else(|| descr.as_text())
            .unwrap_or_else(|| format!("if{index}"));

        ports.push(DevicePort {
            name: name.clone(),
            default_name: descr.as_text(),
            status: if oper.get(index).and_then(SnmpValue::as_i64) == Some(1) {
                PortStatus::Up
            } else {
                PortStatus::Down
            },
            speed: speed_label(
                high_speeds.get(index).and_then(SnmpValue::as_u64),
                speeds.get(index).and_then(SnmpValue::as_u64),
            ),
            description: aliases
                .get(index)
                .and_then(SnmpValue::as_text)
                .filter(|alias| !alias.is_empty()),
            snmp_index: Some(*index as i32),
        });

        let (in_octets, out_octets, bits) = match (
            hc_in.get(index).and_then(SnmpValue::as_u64),
            hc_out.get(index).and_then(SnmpValue::as_u64),
        ) {
            (Some(rx), Some(tx)) => (Some(rx), Some(tx), CounterBits::Bits64),
            _ => (
                in32.get(index).and_then(SnmpValue::as_u64),
                out32.get(index).and_then(SnmpValue::as_u64),
                CounterBits::Bits32,
            ),
        };
        if let (Some(in_octets), Some(out_octets)) = (in_octets, out_octets) {
            counters.push(InterfaceCounters {
                snmp_index: Some(*index as i32),
                name: Some(name),
                in_octets,
                out_octets,
                bits,
            });
        }
    }
    Ok((ports, counters))
}

/// Human label from ifHighSpeed (Mb/s) or ifSpeed (b/s).
fn speed_label(high_speed_mbps: Option<u64>, speed_bps: Option<u64>) -> Option<String> {
    let mbps = match (high_speed_mbps, speed_bps) {
        (Some(mbps), _) if mbps > 0 => mbps,
        (_, Some(bps)) if bps > 0 => bps / 1_000_000,
        _ => return None,
    };
    Some(if mbps >= 1000 && mbps % 1000 == 0 {
        format!("{}Gbps", mbps / 1000)
    } else {
        format!("{mbps}Mbps")
    })
}

fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        trimmed.to_string()
    } else {
        let mut end = max;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        trimmed[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_speed_label() {
        assert_eq!(speed_label(Some(1000), None).as_deref(), Some("1Gbps"));
        assert_eq!(speed_label(Some(2500), None).as_deref(), Some("2500Mbps"));
        assert_eq!(
            speed_label(None, Some(100_000_000)).as_deref(),
            Some("100Mbps")
        );
        assert_eq!(speed_label(None, Some(0)), None);
        assert_eq!(speed_label(None, None), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("  hello  ", 128), "hello");
        assert_eq!(truncate("abcdef", 3), "abc");
        // Multi-byte character straddling the cut.
        assert_eq!(truncate("aé", 2), "a");
    }

    /// In-process v2c agent answering from a fixed OID map.
    async fn fake_agent(bindings: Vec<(Oid, SnmpValue)>) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_535];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else { break };
                let Ok((version, community, pdu)) = ber::decode_community_message(&buf[..len])
                else {
                    continue;
                };
                let varbinds: Vec<(Oid, SnmpValue)> = match pdu.pdu_type {
                    ber::PDU_GET => pdu
                        .varbinds
                        .iter()
                        .map(|(o, _)| {
                            let value = bindings
                                .iter()
                                .find(|(bo, _)| bo == o)
                                .map(|(_, v)| v.clone())
                                .unwrap_or(SnmpValue::NoSuchObject);
                            (o.clone(), value)
                        })
                        .collect(),
                    ber::PDU_GET_NEXT => {
                        let target = &pdu.varbinds[0].0;
                        match bindings.iter().find(|(bo, _)| bo > target) {
                            Some((o, v)) => vec![(o.clone(), v.clone())],
                            None => vec![(target.clone(), SnmpValue::EndOfMibView)],
                        }
                    }
                    _ => continue,
                };
                let response = Pdu {
                    pdu_type: ber::PDU_RESPONSE,
                    request_id: pdu.request_id,
                    error_status: 0,
                    error_index: 0,
                    varbinds,
                };
                let message =
                    ber::encode_community_message(version, &community, &response).unwrap();
                let _ = socket.send_to(&message, peer).await;
            }
        });
        addr
    }

    fn test_creds() -> SnmpCredentials {
        SnmpCredentials::from_bag(&Credentials::from_value(&json!({
            "snmpVersion": "2c",
            "snmpCommunity": "public",
            "timeoutMs": 1000,
        })))
        .unwrap()
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_get_against_fake_agent() {
        let addr = fake_agent(vec![(
            oid(SYS_DESCR),
            SnmpValue::OctetString(b"Linux node01 6.1".to_vec()),
        )])
        .await;

        let mut session = SnmpSession {
            socket: {
                let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                s.connect(addr).await.unwrap();
                s
            },
            creds: test_creds(),
            request_id: 1,
            msg_id: 1,
            salt: 0,
            engine: None,
            auth_key: None,
            priv_key: None,
        };

        let values = session.get(&[oid(SYS_DESCR)], far_deadline()).await.unwrap();
        assert_eq!(values[0].1.as_text().unwrap(), "Linux node01 6.1");
    }

    #[tokio::test]
    async fn test_walk_stays_in_subtree() {
        let addr = fake_agent(vec![
            (
                Oid::parse("1.3.6.1.2.1.2.2.1.2.1").unwrap(),
                SnmpValue::OctetString(b"eth0".to_vec()),
            ),
            (
                Oid::parse("1.3.6.1.2.1.2.2.1.2.2").unwrap(),
                SnmpValue::OctetString(b"eth1".to_vec()),
            ),
            (
                Oid::parse("1.3.6.1.2.1.2.2.1.3.1").unwrap(),
                SnmpValue::Integer(6),
            ),
        ])
        .await;

        let mut session = SnmpSession {
            socket: {
                let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                s.connect(addr).await.unwrap();
                s
            },
            creds: test_creds(),
            request_id: 1,
            msg_id: 1,
            salt: 0,
            engine: None,
            auth_key: None,
            priv_key: None,
        };

        let rows = session
            .walk(&oid(IF_DESCR), far_deadline())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1.as_text().unwrap(), "eth0");
        assert_eq!(rows[1].1.as_text().unwrap(), "eth1");
        assert_eq!(rows[1].0.last_arc(), Some(2));
    }
}
